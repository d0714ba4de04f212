//! Authenticated principal extraction.
//!
//! Protected endpoints present the session correlation id as a bearer credential
//! plus the csrf value issued with it. The session must be live and its stored
//! access token must still verify.

use axum::http::HeaderMap;
use tracing::debug;
use uuid::Uuid;

use super::{
    context::{bearer, csrf},
    state::AuthState,
};
use crate::{
    error::AuthError,
    refresh::parse_correlation_id,
    session::Session,
    token::TokenError,
};

#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: Uuid,
    pub username: String,
    pub role: String,
    pub correlation_id: Uuid,
    pub device_id: String,
}

/// Resolve the presented session, checking only the csrf binding.
///
/// # Errors
/// `Unauthenticated` for missing credentials, `PermissionDenied` when the
/// session is unknown or the csrf value does not match.
pub async fn require_session(
    auth_state: &AuthState,
    headers: &HeaderMap,
) -> Result<Session, AuthError> {
    let correlation_id = parse_correlation_id(Some(bearer(headers)?))?;
    let csrf = csrf(headers)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AuthError::unauthenticated("missing csrf token"))?;

    let session = auth_state
        .sessions()
        .find_by_correlation_id(correlation_id)
        .await?
        .ok_or_else(|| AuthError::permission_denied("unknown session"))?;

    if !session.csrf_matches(csrf) {
        debug!(%correlation_id, "csrf mismatch");
        return Err(AuthError::permission_denied("invalid csrf token"));
    }

    Ok(session)
}

/// Resolve the presented session into a principal.
///
/// # Errors
/// Same as [`require_session`], plus `PermissionDenied` for rotated sessions and
/// `Unauthenticated` once the access token expired (the client should refresh).
pub async fn require_auth(
    auth_state: &AuthState,
    headers: &HeaderMap,
) -> Result<Principal, AuthError> {
    let session = require_session(auth_state, headers).await?;
    if session.revoked {
        return Err(AuthError::permission_denied("session revoked"));
    }

    let claims = match auth_state.tokens().verify_access(&session.access_token) {
        Ok(claims) => claims,
        Err(TokenError::Expired) => {
            return Err(AuthError::unauthenticated("access token expired"));
        }
        Err(err) => {
            debug!(correlation_id = %session.correlation_id, "access token rejected: {err}");
            return Err(AuthError::permission_denied("invalid access token"));
        }
    };

    Ok(Principal {
        user_id: session.user_id,
        username: claims.username,
        role: claims.role,
        correlation_id: session.correlation_id,
        device_id: session.device_id,
    })
}
