//! In-process transport that answers requests with a closure.
//!
//! Used by tests and local runs without a broker. A responder returning `None`
//! never replies, which exercises the caller's deadline.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use super::{RpcChannel, RpcReply, RpcTransport};

type Responder = dyn Fn(&str, &[u8]) -> Option<Vec<u8>> + Send + Sync;

#[derive(Clone)]
pub struct LoopbackTransport {
    responder: Arc<Responder>,
    closed: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl LoopbackTransport {
    pub fn replying(
        responder: impl Fn(&str, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(responder),
            closed: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Channels closed so far.
    #[must_use]
    pub fn closed_channels(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Routing keys published so far.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RpcTransport for LoopbackTransport {
    async fn open(&self) -> Result<Box<dyn RpcChannel>> {
        Ok(Box::new(LoopbackChannel {
            transport: self.clone(),
            pending: None,
        }))
    }
}

struct LoopbackChannel {
    transport: LoopbackTransport,
    pending: Option<RpcReply>,
}

#[async_trait]
impl RpcChannel for LoopbackChannel {
    async fn declare_reply_queue(&mut self) -> Result<String> {
        Ok("loopback.reply".to_string())
    }

    async fn publish(
        &mut self,
        routing_key: &str,
        _reply_to: &str,
        correlation_id: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        if let Ok(mut requests) = self.transport.requests.lock() {
            requests.push(routing_key.to_string());
        }
        self.pending = (self.transport.responder)(routing_key, &payload).map(|payload| RpcReply {
            correlation_id: Some(correlation_id.to_string()),
            payload,
        });
        Ok(())
    }

    async fn next_reply(&mut self) -> Result<Option<RpcReply>> {
        match self.pending.take() {
            Some(reply) => Ok(Some(reply)),
            None => std::future::pending().await,
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.transport.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
