//! OAuth identity lookups over a request/reply broker.
//!
//! The provider handshake happens in another service. This side publishes the
//! authorization code with a correlation id and a private reply queue, waits for
//! the one matching reply under a deadline and normalizes the returned profile.
//! The channel is closed on every exit path.

pub mod amqp;
pub mod loopback;

use anyhow::anyhow;
use async_trait::async_trait;
use rand::{Rng, distributions::Alphanumeric};
use serde::Deserialize;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::AuthError, session::LoginWith};

pub const DEFAULT_IDENTITY_EXCHANGE: &str = "rpc-exchange";
pub const DEFAULT_GOOGLE_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_GITHUB_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("identity provider did not answer within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("identity transport failed: {0:#}")]
    Transport(#[from] anyhow::Error),
    #[error("malformed identity reply: {0}")]
    Malformed(String),
}

impl From<RpcError> for AuthError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::DeadlineExceeded(_) => Self::DeadlineExceeded("Request timeout!".to_string()),
            RpcError::Transport(err) => Self::Internal(err),
            RpcError::Malformed(message) => Self::Internal(anyhow!(message)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    Google,
    Github,
}

impl Provider {
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::Google => "oauth.google.key",
            Self::Github => "oauth.github.key",
        }
    }

    #[must_use]
    pub const fn login_with(self) -> LoginWith {
        match self {
            Self::Google => LoginWith::Google,
            Self::Github => LoginWith::Github,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.login_with().as_str())
    }
}

impl FromStr for Provider {
    type Err = AuthError;

    fn from_str(value: &str) -> Result<Self, AuthError> {
        match value {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::Github),
            other => Err(AuthError::invalid_argument(format!(
                "unsupported provider: {other}"
            ))),
        }
    }
}

/// Profile fields every provider reply is reduced to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
}

#[derive(Deserialize)]
struct GoogleReply {
    email: Option<String>,
    given_name: Option<String>,
    picture: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GithubReply {
    user_info: GithubUserInfo,
    user_email: GithubUserEmail,
}

#[derive(Deserialize)]
struct GithubUserInfo {
    name: Option<String>,
    login: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct GithubUserEmail {
    email: Option<String>,
}

/// Reduce a provider reply to a [`Profile`].
///
/// # Errors
/// Returns `Malformed` when the reply is not JSON of the provider's shape or has no email.
pub fn normalize(provider: Provider, payload: &[u8]) -> Result<Profile, RpcError> {
    let (email, name, picture) = match provider {
        Provider::Google => {
            let reply: GoogleReply = serde_json::from_slice(payload)
                .map_err(|e| RpcError::Malformed(format!("google: {e}")))?;
            (reply.email, reply.given_name, reply.picture)
        }
        Provider::Github => {
            let reply: GithubReply = serde_json::from_slice(payload)
                .map_err(|e| RpcError::Malformed(format!("github: {e}")))?;
            let name = reply
                .user_info
                .name
                .as_deref()
                .and_then(|name| name.split_whitespace().next())
                .map(ToString::to_string)
                .or(reply.user_info.login);
            (reply.user_email.email, name, reply.user_info.avatar_url)
        }
    };

    let email = email
        .map(|email| crate::users::normalize_email(&email))
        .filter(|email| !email.is_empty())
        .ok_or_else(|| RpcError::Malformed(format!("{provider}: missing email")))?;
    let name = name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());

    Ok(Profile {
        email,
        name,
        picture,
    })
}

/// Username for a first OAuth login: the display name plus four random characters.
#[must_use]
pub fn derive_username(name: &str) -> String {
    let mut base: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .take(28)
        .collect();
    if base.is_empty() {
        base.push_str("user");
    }
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!("{base}{suffix}")
}

#[derive(Clone, Debug)]
pub struct RpcReply {
    pub correlation_id: Option<String>,
    pub payload: Vec<u8>,
}

/// Opens channels to the broker.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn open(&self) -> anyhow::Result<Box<dyn RpcChannel>>;
}

/// One broker channel, used for a single call.
#[async_trait]
pub trait RpcChannel: Send {
    /// Declare an exclusive reply queue and start consuming it. Returns its name.
    async fn declare_reply_queue(&mut self) -> anyhow::Result<String>;

    async fn publish(
        &mut self,
        routing_key: &str,
        reply_to: &str,
        correlation_id: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()>;

    /// Next message on the reply queue; `None` once the queue is gone.
    async fn next_reply(&mut self) -> anyhow::Result<Option<RpcReply>>;

    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct IdentityRpc {
    transport: Arc<dyn RpcTransport>,
    google_timeout: Duration,
    github_timeout: Duration,
}

impl fmt::Debug for IdentityRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRpc")
            .field("google_timeout", &self.google_timeout)
            .field("github_timeout", &self.github_timeout)
            .finish_non_exhaustive()
    }
}

impl IdentityRpc {
    #[must_use]
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            transport,
            google_timeout: Duration::from_secs(DEFAULT_GOOGLE_TIMEOUT_SECONDS),
            github_timeout: Duration::from_secs(DEFAULT_GITHUB_TIMEOUT_SECONDS),
        }
    }

    #[must_use]
    pub const fn with_google_timeout(mut self, timeout: Duration) -> Self {
        self.google_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_github_timeout(mut self, timeout: Duration) -> Self {
        self.github_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn timeout_for(&self, provider: Provider) -> Duration {
        match provider {
            Provider::Google => self.google_timeout,
            Provider::Github => self.github_timeout,
        }
    }

    /// Trade an authorization code for the provider profile.
    ///
    /// # Errors
    /// `DeadlineExceeded` after the provider's timeout, `Transport` on broker
    /// failures, `Malformed` for unusable replies.
    pub async fn exchange_code(&self, provider: Provider, code: &str) -> Result<Profile, RpcError> {
        let deadline = self.timeout_for(provider);
        let mut channel = self.transport.open().await?;

        let result = tokio::time::timeout(deadline, call(channel.as_mut(), provider, code)).await;

        if let Err(err) = channel.close().await {
            warn!(%provider, "failed to close identity channel: {err:#}");
        }

        match result {
            Ok(result) => result,
            Err(_) => {
                warn!(%provider, ?deadline, "identity provider timed out");
                Err(RpcError::DeadlineExceeded(deadline))
            }
        }
    }
}

async fn call(
    channel: &mut dyn RpcChannel,
    provider: Provider,
    code: &str,
) -> Result<Profile, RpcError> {
    let reply_to = channel.declare_reply_queue().await?;
    let correlation_id = Uuid::new_v4().to_string();
    let payload = serde_json::to_vec(&serde_json::json!({ "code": code }))
        .map_err(|e| RpcError::Transport(e.into()))?;

    channel
        .publish(provider.routing_key(), &reply_to, &correlation_id, payload)
        .await?;

    loop {
        let reply = channel
            .next_reply()
            .await?
            .ok_or_else(|| RpcError::Transport(anyhow!("reply queue closed")))?;

        if reply.correlation_id.as_deref() == Some(correlation_id.as_str()) {
            return normalize(provider, &reply.payload);
        }
        debug!(%provider, "ignoring reply for another call");
    }
}
