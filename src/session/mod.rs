//! Sessions: one issued access/refresh pair bound to a device and a network address.
//!
//! A session is looked up by its correlation id (the value clients present as
//! `Authorization: Bearer <id>`). The device fingerprint lives in `device_id`, and
//! a user has at most one non-revoked session per device. Rotated sessions stay in
//! the table as `revoked` until their grace window passes so racing requests and
//! replays can still be recognised.

pub mod sweeper;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};
use subtle::ConstantTimeEq;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::fingerprint::DeviceAttributes;

/// How the session owner authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LoginWith {
    Credentials,
    Google,
    Github,
}

impl LoginWith {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Credentials => "credentials",
            Self::Google => "google",
            Self::Github => "github",
        }
    }
}

impl fmt::Display for LoginWith {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoginWith {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "credentials" => Ok(Self::Credentials),
            "google" => Ok(Self::Google),
            "github" => Ok(Self::Github),
            other => Err(anyhow::anyhow!("unknown login provenance: {other}")),
        }
    }
}

/// The request's device and network context, passed explicitly through every flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientContext {
    pub user_agent: String,
    pub ip_address: String,
    pub device_id: String,
    pub attributes: DeviceAttributes,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub correlation_id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub csrf_hash: Vec<u8>,
    pub access_token: String,
    pub refresh_token: String,
    pub user_agent: String,
    pub ip_address: String,
    pub revoked: bool,
    pub revoked_until: Option<DateTime<Utc>>,
    pub login_with: LoginWith,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Compare a presented csrf value against the stored hash in constant time.
    #[must_use]
    pub fn csrf_matches(&self, presented: &str) -> bool {
        hash_csrf(presented)
            .as_slice()
            .ct_eq(self.csrf_hash.as_slice())
            .into()
    }
}

/// Everything needed to insert a session row.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub correlation_id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub csrf_hash: Vec<u8>,
    pub access_token: String,
    pub refresh_token: String,
    pub user_agent: String,
    pub ip_address: String,
    pub login_with: LoginWith,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Owner data joined onto a locked session for the identity check and re-issuance.
#[derive(Clone, Debug)]
pub struct SessionOwner {
    pub username: String,
    pub email: String,
    pub role: String,
}

/// The csrf value is only returned to the client; the store keeps its hash.
#[must_use]
pub fn hash_csrf(csrf: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(csrf.as_bytes());
    hasher.finalize().to_vec()
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a session and delete the user's other non-revoked session on the same
    /// device.
    async fn create(&self, session: NewSession) -> Result<Session>;

    async fn find_by_correlation_id(&self, correlation_id: Uuid) -> Result<Option<Session>>;

    async fn find_by_user_and_device(&self, user_id: Uuid, device_id: &str) -> Result<Vec<Session>>;

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Session>>;

    /// Flag a session as revoked, keeping it until `grace_until`.
    async fn revoke(&self, correlation_id: Uuid, grace_until: DateTime<Utc>) -> Result<bool>;

    /// Delete every session of a user. Returns the number of rows removed.
    async fn revoke_all(&self, user_id: Uuid) -> Result<u64>;

    async fn delete(&self, correlation_id: Uuid) -> Result<bool>;

    /// Delete revoked sessions past their grace window and sessions untouched for
    /// longer than `retention`. Safe to run next to live traffic.
    async fn sweep_expired(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64>;

    /// Lock a session row for the refresh protocol. `None` when it does not exist.
    async fn begin_refresh(&self, correlation_id: Uuid) -> Result<Option<Box<dyn RefreshGuard>>>;

    async fn ping(&self) -> Result<()>;
}

/// A session row held exclusively until the guard is consumed or dropped.
///
/// Dropping the guard without calling one of the consuming methods discards every
/// change, so an error halfway through the refresh protocol leaves storage intact.
#[async_trait]
pub trait RefreshGuard: Send {
    fn session(&self) -> &Session;

    fn owner(&self) -> &SessionOwner;

    /// Delete all sessions of the locked session's owner and commit.
    async fn revoke_all(self: Box<Self>) -> Result<u64>;

    /// Mark the locked session revoked until `grace_until`, insert its replacement
    /// and commit.
    async fn rotate(
        self: Box<Self>,
        grace_until: DateTime<Utc>,
        replacement: NewSession,
    ) -> Result<Session>;

    /// End the guard without changes.
    async fn release(self: Box<Self>) -> Result<()>;
}
