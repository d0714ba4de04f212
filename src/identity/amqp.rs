//! AMQP transport for identity lookups.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    options::{BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tracing::{Instrument, debug, info_span};

use super::{RpcChannel, RpcReply, RpcTransport};

pub struct AmqpTransport {
    connection: Connection,
    exchange: String,
}

impl AmqpTransport {
    /// Connect to the broker and make sure the request exchange exists.
    ///
    /// # Errors
    /// Returns an error if the broker is unreachable or the declaration fails.
    pub async fn connect(url: &str, exchange: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("failed to connect to AMQP broker")?;

        let channel = connection
            .create_channel()
            .await
            .context("failed to open AMQP channel")?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to declare exchange {exchange}"))?;
        channel
            .close(200, "OK")
            .await
            .context("failed to close AMQP channel")?;

        debug!(exchange, "connected to AMQP broker");

        Ok(Self {
            connection,
            exchange: exchange.to_string(),
        })
    }
}

#[async_trait]
impl RpcTransport for AmqpTransport {
    async fn open(&self) -> Result<Box<dyn RpcChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .context("failed to open AMQP channel")?;
        Ok(Box::new(AmqpChannel {
            channel,
            exchange: self.exchange.clone(),
            consumer: None,
        }))
    }
}

struct AmqpChannel {
    channel: Channel,
    exchange: String,
    consumer: Option<Consumer>,
}

#[async_trait]
impl RpcChannel for AmqpChannel {
    async fn declare_reply_queue(&mut self) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .context("failed to declare reply queue")?;
        let name = queue.name().as_str().to_string();

        let consumer = self
            .channel
            .basic_consume(
                &name,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .context("failed to consume reply queue")?;
        self.consumer = Some(consumer);

        Ok(name)
    }

    async fn publish(
        &mut self,
        routing_key: &str,
        reply_to: &str,
        correlation_id: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let span = info_span!(
            "amqp.publish",
            messaging.system = "rabbitmq",
            messaging.destination = %self.exchange,
            messaging.routing_key = routing_key
        );
        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_reply_to(reply_to.into())
                    .with_correlation_id(correlation_id.into()),
            )
            .instrument(span)
            .await
            .context("failed to publish identity request")?
            .await
            .context("identity request was not confirmed")?;
        Ok(())
    }

    async fn next_reply(&mut self) -> Result<Option<RpcReply>> {
        let consumer = self
            .consumer
            .as_mut()
            .ok_or_else(|| anyhow!("reply queue not declared"))?;

        match consumer.next().await {
            Some(delivery) => {
                let delivery = delivery.context("failed to receive identity reply")?;
                Ok(Some(RpcReply {
                    correlation_id: delivery
                        .properties
                        .correlation_id()
                        .as_ref()
                        .map(|id| id.as_str().to_string()),
                    payload: delivery.data,
                }))
            }
            None => Ok(None),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.channel
            .close(200, "OK")
            .await
            .context("failed to close AMQP channel")
    }
}
