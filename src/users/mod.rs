//! Users, their settings, second-factor credentials and device links.

pub mod password;
pub mod verification;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;
use uuid::Uuid;

pub const ROLE_ADMIN: i16 = 1;
pub const ROLE_AUTHOR: i16 = 2;

/// Resolve a numeric role id to the name carried in access tokens.
#[must_use]
pub const fn role_name(role_id: i16) -> &'static str {
    match role_id {
        ROLE_ADMIN => "Admin",
        _ => "Author",
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TwoFaMethod {
    App,
    Passkey,
}

impl TwoFaMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Passkey => "passkey",
        }
    }
}

impl fmt::Display for TwoFaMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TwoFaMethod {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "app" => Ok(Self::App),
            "passkey" => Ok(Self::Passkey),
            other => Err(anyhow::anyhow!("unknown two-factor method: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub role_id: i16,
    pub role: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub role_id: i16,
    pub verified: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserSettings {
    pub user_id: Uuid,
    pub two_fa_method: Option<TwoFaMethod>,
}

/// A user recognised on a device, as shown by the account switcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SavedAccount {
    pub username: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub two_fa_method: Option<TwoFaMethod>,
}

/// A WebAuthn credential bound to the user and the device it was registered on.
#[derive(Clone, Debug)]
pub struct StoredPasskey {
    pub credential_id: Vec<u8>,
    pub user_id: Uuid,
    pub device_id: String,
    pub credential: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Lookup by email, or by username ignoring case.
    async fn find_by_email_or_username(&self, identifier: &str) -> Result<Option<User>>;

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>>;

    /// Insert a user. `None` when the username or email is already taken.
    async fn create_user(&self, user: NewUser) -> Result<Option<User>>;

    /// Return the user owning `user.email`, creating it when missing.
    async fn find_or_create_by_email(&self, user: NewUser) -> Result<User>;

    /// Return the user's settings, creating defaults on first use.
    async fn ensure_settings(&self, user_id: Uuid) -> Result<UserSettings>;

    async fn set_two_fa_method(&self, user_id: Uuid, method: Option<TwoFaMethod>) -> Result<()>;

    /// Link a user to a device, refreshing the link's activity timestamp.
    async fn link_saved_account(&self, device_id: &str, user_id: Uuid) -> Result<()>;

    async fn saved_accounts(&self, device_id: &str) -> Result<Vec<SavedAccount>>;

    async fn unlink_saved_account(&self, device_id: &str, username: &str) -> Result<bool>;

    /// Drop device links idle since before `cutoff`.
    async fn sweep_saved_accounts(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Replace the user's pending email verification code.
    async fn save_email_verification(
        &self,
        user_id: Uuid,
        code_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Spend a pending code that has not expired at `now` and mark the user
    /// verified. Returns `false` when no such code exists.
    async fn redeem_email_verification(
        &self,
        user_id: Uuid,
        code_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn sweep_email_verifications(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save_totp_secret(&self, user_id: Uuid, secret: &[u8]) -> Result<()>;

    async fn totp_secret(&self, user_id: Uuid) -> Result<Option<Vec<u8>>>;

    async fn delete_totp_secret(&self, user_id: Uuid) -> Result<bool>;

    /// Mark TOTP time step `step` as used. Returns `false` when the user has no
    /// secret or a step at least as recent was already accepted.
    async fn claim_totp_step(&self, user_id: Uuid, step: i64) -> Result<bool>;

    async fn list_passkeys(&self, user_id: Uuid) -> Result<Vec<StoredPasskey>>;

    /// Insert a credential unless the user already has one with the same id.
    /// Returns whether a row was written.
    async fn insert_passkey(&self, passkey: StoredPasskey) -> Result<bool>;

    async fn update_passkey(&self, credential_id: &[u8], credential: Vec<u8>) -> Result<()>;

    async fn delete_device_passkeys(&self, user_id: Uuid, device_id: &str) -> Result<u64>;
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Usernames are 3 to 32 characters of letters, digits, `_`, `.` or `-`.
#[must_use]
pub fn valid_username(username: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9_.-]{3,32}$").is_ok_and(|regex| regex.is_match(username))
}
