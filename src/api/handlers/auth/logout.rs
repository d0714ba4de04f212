use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{no_store_headers, principal::require_session, state::AuthState};
use crate::error::{AuthError, ErrorBody};

/// Delete the presented session. Works with an expired access token.
///
/// A rotated session is a replay, handled like on refresh: every session of
/// the owner is revoked.
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 204, description = "Session deleted"),
        (status = 401, description = "Missing session id or csrf token", body = ErrorBody),
        (status = 403, description = "Unknown, rotated or revoked session, or csrf mismatch", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let session = require_session(&auth_state, &headers).await?;
    if session.revoked {
        let removed = auth_state.sessions().revoke_all(session.user_id).await?;
        warn!(user_id = %session.user_id, removed, "logout with a rotated session; all sessions revoked");
        return Err(AuthError::permission_denied("session compromised"));
    }

    auth_state.sessions().delete(session.correlation_id).await?;

    debug!(user_id = %session.user_id, "signed out");

    Ok((StatusCode::NO_CONTENT, no_store_headers()))
}
