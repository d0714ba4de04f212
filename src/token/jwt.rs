//! Signed access and refresh tokens.
//!
//! Access tokens are short lived and carry the role; refresh tokens only carry the
//! identity, so a role change lands on the next rotation.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;
pub const DEFAULT_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Who a token pair is minted for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub user_id: Uuid,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token not active yet")]
    NotYetValid,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone)]
pub struct MintedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenIssuer {
    access_secret: SecretString,
    refresh_secret: SecretString,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    #[must_use]
    pub fn new(access_secret: SecretString, refresh_secret: SecretString) -> Self {
        Self {
            access_secret,
            refresh_secret,
            access_ttl: Duration::seconds(DEFAULT_ACCESS_TTL_SECONDS),
            refresh_ttl: Duration::seconds(DEFAULT_REFRESH_TTL_SECONDS),
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl = Duration::seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl = Duration::seconds(seconds);
        self
    }

    /// Mint an access/refresh pair for `subject`.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn mint(&self, subject: &Subject) -> Result<MintedTokens> {
        let now = Utc::now();
        let access_expires_at = now + self.access_ttl;
        let refresh_expires_at = now + self.refresh_ttl;

        let access = AccessClaims {
            sub: subject.user_id.to_string(),
            username: subject.username.clone(),
            role: subject.role.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: access_expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let refresh = RefreshClaims {
            sub: subject.user_id.to_string(),
            username: subject.username.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: refresh_expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let access_token = encode(
            &Header::new(Algorithm::HS256),
            &access,
            &EncodingKey::from_secret(self.access_secret.expose_secret().as_bytes()),
        )
        .context("failed to sign access token")?;
        let refresh_token = encode(
            &Header::new(Algorithm::HS256),
            &refresh,
            &EncodingKey::from_secret(self.refresh_secret.expose_secret().as_bytes()),
        )
        .context("failed to sign refresh token")?;

        Ok(MintedTokens {
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Verify a refresh token's signature and time window.
    ///
    /// # Errors
    /// Returns the specific reason the token is unusable.
    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        verify(token, &self.refresh_secret)
    }

    /// Verify an access token's signature and time window.
    ///
    /// # Errors
    /// Returns the specific reason the token is unusable.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        verify(token, &self.access_secret)
    }
}

fn verify<T: serde::de::DeserializeOwned>(
    token: &str,
    secret: &SecretString,
) -> Result<T, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;
    validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

    decode::<T>(
        token,
        &DecodingKey::from_secret(secret.expose_secret().as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::ImmatureSignature => TokenError::NotYetValid,
        _ => TokenError::InvalidSignature,
    })
}
