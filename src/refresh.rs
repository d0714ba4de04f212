//! The refresh protocol: decide whether a presented session may rotate.
//!
//! Gates run in a fixed order and the first failing gate ends the call:
//!
//! 1. transport: a well-formed correlation id and a csrf value are present
//! 2. lookup: the session exists (row locked from here on)
//! 3. csrf: the presented value matches the stored hash
//! 4. signature: the stored refresh token verifies and is inside its window
//! 5. revocation: a revoked session being presented again is a replay
//! 6. identity: the token's username is the session owner's
//! 7. device and network: same fingerprint attributes and same source IP
//! 8. rotate: revoke with a grace window and issue the replacement
//!
//! Replays (5) and hijacks (7) delete every session of the owner. Everything from
//! the lookup to the final write happens under the store's row lock, so two
//! concurrent refreshes of one session cannot both rotate it.

use anyhow::Context;
use chrono::{Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::AuthError,
    fingerprint::FingerprintEncoder,
    session::{ClientContext, RefreshGuard, SessionStore},
    token::{IssuedSession, Subject, TokenError, TokenIssuer, prepare_session},
};

pub const DEFAULT_GRACE_SECONDS: i64 = 60;

/// What happens when the stored refresh token has simply expired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Reject and leave the user's other sessions alone.
    #[default]
    Reject,
    /// Reject and delete every session of the user.
    RevokeAll,
}

#[derive(Clone, Copy, Debug)]
pub struct RefreshPolicy {
    grace_seconds: i64,
    expiry: ExpiryPolicy,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshPolicy {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            grace_seconds: DEFAULT_GRACE_SECONDS,
            expiry: ExpiryPolicy::Reject,
        }
    }

    #[must_use]
    pub const fn with_grace_seconds(mut self, seconds: i64) -> Self {
        self.grace_seconds = seconds;
        self
    }

    #[must_use]
    pub const fn with_expiry(mut self, expiry: ExpiryPolicy) -> Self {
        self.expiry = expiry;
        self
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::seconds(self.grace_seconds.max(0))
    }

    #[must_use]
    pub const fn expiry(&self) -> ExpiryPolicy {
        self.expiry
    }
}

/// Credentials presented on a refresh call.
#[derive(Clone, Copy, Debug)]
pub struct RefreshRequest<'a> {
    pub correlation_id: Option<&'a str>,
    pub csrf: Option<&'a str>,
    pub client: &'a ClientContext,
}

/// Collaborators the protocol consults.
#[derive(Clone, Copy)]
pub struct RefreshProtocol<'a> {
    pub sessions: &'a dyn SessionStore,
    pub tokens: &'a TokenIssuer,
    pub encoder: &'a FingerprintEncoder,
    pub policy: RefreshPolicy,
}

impl RefreshProtocol<'_> {
    /// Run the refresh protocol.
    ///
    /// # Errors
    /// `Unauthenticated` for transport failures, `PermissionDenied` for every
    /// rejected gate, `Internal` when storage or signing fails (nothing is written).
    pub async fn run(&self, request: RefreshRequest<'_>) -> Result<IssuedSession, AuthError> {
        // 1. transport
        let correlation_id = parse_correlation_id(request.correlation_id)?;
        let csrf = request
            .csrf
            .map(str::trim)
            .filter(|value| !is_placeholder(value))
            .ok_or_else(|| AuthError::unauthenticated("missing csrf token"))?;

        // 2. lookup
        let guard = self
            .sessions
            .begin_refresh(correlation_id)
            .await
            .context("failed to lock session")?
            .ok_or_else(|| AuthError::permission_denied("unknown session"))?;

        // 3. csrf
        if !guard.session().csrf_matches(csrf) {
            debug!(%correlation_id, "csrf mismatch on refresh");
            return reject(guard, AuthError::permission_denied("invalid csrf token")).await;
        }

        // 4. signature and time window
        let verified = self.tokens.verify_refresh(&guard.session().refresh_token);
        let claims = match verified {
            Ok(claims) => claims,
            Err(TokenError::Expired) => {
                let user_id = guard.session().user_id;
                let err = AuthError::permission_denied("refresh token expired");
                return match self.policy.expiry() {
                    ExpiryPolicy::Reject => reject(guard, err).await,
                    ExpiryPolicy::RevokeAll => {
                        warn!(%user_id, "expired refresh token presented, revoking all sessions");
                        revoke_all(guard, err).await
                    }
                };
            }
            Err(TokenError::NotYetValid) => {
                return reject(guard, AuthError::permission_denied("refresh token not active yet"))
                    .await;
            }
            Err(TokenError::InvalidSignature) => {
                return reject(
                    guard,
                    AuthError::permission_denied("invalid refresh token signature"),
                )
                .await;
            }
        };

        // 5. revocation
        if guard.session().revoked {
            warn!(user_id = %guard.session().user_id, %correlation_id, "rotated session replayed, revoking all sessions");
            return revoke_all(guard, AuthError::permission_denied("session compromised")).await;
        }

        // 6. identity
        if claims.username != guard.owner().username {
            return reject(guard, AuthError::permission_denied("tokens don't match")).await;
        }

        // 7. device and network
        let stored_attributes = self.encoder.decode(&guard.session().device_id);
        let same_device = stored_attributes.as_ref() == Some(&request.client.attributes);
        let same_network = guard.session().ip_address == request.client.ip_address;
        if !same_device || !same_network {
            warn!(
                user_id = %guard.session().user_id,
                same_device,
                same_network,
                "session presented from another device or network, revoking all sessions"
            );
            return revoke_all(guard, AuthError::permission_denied("IP/User-Agent mismatch"))
                .await;
        }

        // 8. rotate
        let subject = Subject {
            user_id: guard.session().user_id,
            username: guard.owner().username.clone(),
            role: guard.owner().role.clone(),
        };
        let device_id = guard.session().device_id.clone();
        let login_with = guard.session().login_with;
        let (replacement, csrf) =
            prepare_session(self.tokens, &subject, request.client, &device_id, login_with)?;

        let grace_until = Utc::now() + self.policy.grace();
        let session = guard
            .rotate(grace_until, replacement)
            .await
            .context("failed to rotate session")?;

        debug!(user_id = %session.user_id, "session rotated");

        Ok(IssuedSession { session, csrf })
    }
}

/// Parse a presented correlation id, treating client placeholders as missing.
///
/// # Errors
/// Returns `Unauthenticated` when the id is absent or not a UUID.
pub fn parse_correlation_id(raw: Option<&str>) -> Result<Uuid, AuthError> {
    let raw = raw
        .map(str::trim)
        .filter(|value| !is_placeholder(value))
        .ok_or_else(|| AuthError::unauthenticated("missing session id"))?;
    Uuid::parse_str(raw).map_err(|_| AuthError::unauthenticated("malformed session id"))
}

fn is_placeholder(value: &str) -> bool {
    value.is_empty() || value == "undefined" || value == "null"
}

async fn reject(guard: Box<dyn RefreshGuard>, err: AuthError) -> Result<IssuedSession, AuthError> {
    guard.release().await.context("failed to release session")?;
    Err(err)
}

async fn revoke_all(
    guard: Box<dyn RefreshGuard>,
    err: AuthError,
) -> Result<IssuedSession, AuthError> {
    let removed = guard
        .revoke_all()
        .await
        .context("failed to revoke sessions")?;
    debug!(removed, "sessions revoked");
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_transport_check() {
        assert!(matches!(
            parse_correlation_id(None),
            Err(AuthError::Unauthenticated(_))
        ));
        for placeholder in ["", "  ", "undefined", "null"] {
            assert!(matches!(
                parse_correlation_id(Some(placeholder)),
                Err(AuthError::Unauthenticated(_))
            ));
        }
        assert!(matches!(
            parse_correlation_id(Some("not-a-uuid")),
            Err(AuthError::Unauthenticated(_))
        ));

        let id = Uuid::new_v4();
        assert!(matches!(
            parse_correlation_id(Some(&id.to_string())),
            Ok(parsed) if parsed == id
        ));
    }

    #[test]
    fn policy_defaults() {
        let policy = RefreshPolicy::new();
        assert_eq!(policy.grace(), Duration::seconds(60));
        assert_eq!(policy.expiry(), ExpiryPolicy::Reject);

        let policy = policy
            .with_grace_seconds(-1)
            .with_expiry(ExpiryPolicy::RevokeAll);
        assert_eq!(policy.grace(), Duration::zero());
        assert_eq!(policy.expiry(), ExpiryPolicy::RevokeAll);
    }
}
