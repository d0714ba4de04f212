//! Email verification codes.
//!
//! Registration mails a link carrying a random code. Only the SHA-256 of the code
//! is stored, one pending code per user, and it can be redeemed once within
//! [`VERIFICATION_TTL_HOURS`].

use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use url::Url;

pub const VERIFY_EMAIL_SUBJECT: &str = "verify-email";
pub const VERIFICATION_TTL_HOURS: i64 = 24;

#[derive(Clone, Debug)]
pub struct VerificationCode {
    pub code: String,
    pub code_hash: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl VerificationCode {
    /// Draw a fresh code valid for [`VERIFICATION_TTL_HOURS`] from `now`.
    ///
    /// # Errors
    /// Returns an error if the system RNG fails.
    pub fn generate(now: DateTime<Utc>) -> Result<Self> {
        let mut bytes = [0u8; 32];
        OsRng.try_fill_bytes(&mut bytes)?;
        let code = URL_SAFE_NO_PAD.encode(bytes);
        Ok(Self {
            code_hash: hash_code(&code),
            code,
            expires_at: now + Duration::hours(VERIFICATION_TTL_HOURS),
        })
    }
}

#[must_use]
pub fn hash_code(code: &str) -> Vec<u8> {
    Sha256::digest(code.as_bytes()).to_vec()
}

/// The link mailed to the user: `{public_url}/auth/verify-email?username=..&subject=verify-email&code=..`.
///
/// # Errors
/// Returns an error if `public_url` is not an absolute URL.
pub fn verification_link(public_url: &str, username: &str, code: &str) -> Result<Url> {
    let mut url = Url::parse(public_url)?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("public url cannot be a base: {public_url}"))?
        .pop_if_empty()
        .extend(["auth", "verify-email"]);
    url.query_pairs_mut()
        .append_pair("username", username)
        .append_pair("subject", VERIFY_EMAIL_SUBJECT)
        .append_pair("code", code);
    Ok(url)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationStatus {
    Verified,
    AlreadyVerified,
    NotFound,
    InvalidRequest,
}

impl VerificationStatus {
    const fn verified(self) -> bool {
        matches!(self, Self::Verified | Self::AlreadyVerified)
    }

    const fn message(self) -> Option<&'static str> {
        match self {
            Self::Verified => None,
            Self::AlreadyVerified => Some("email-already-verified"),
            Self::NotFound => Some("request-not-found"),
            Self::InvalidRequest => Some("invalid-request"),
        }
    }

    /// Where the browser lands: `{client_url}/auth/email/status/{username}?request=..&verified=..`.
    ///
    /// # Errors
    /// Returns an error if `client_url` is not an absolute URL.
    pub fn status_location(self, client_url: &str, username: &str) -> Result<Url> {
        let mut url = Url::parse(client_url)?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("client url cannot be a base: {client_url}"))?
            .pop_if_empty()
            .extend(["auth", "email", "status", username]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("request", VERIFY_EMAIL_SUBJECT)
                .append_pair("verified", if self.verified() { "true" } else { "false" });
            if let Some(message) = self.message() {
                query.append_pair("message", message);
            }
        }
        Ok(url)
    }
}
