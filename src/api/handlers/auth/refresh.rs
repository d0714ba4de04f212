use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;

use super::{
    context::{PeerAddr, bearer, client_context, csrf},
    no_store_headers,
    state::AuthState,
    types::RefreshResponse,
};
use crate::{
    error::{AuthError, ErrorBody},
    refresh::{RefreshProtocol, RefreshRequest},
};

#[utoipa::path(
    post,
    path = "/auth/refresh",
    responses(
        (status = 200, description = "Session rotated", body = RefreshResponse),
        (status = 401, description = "Missing session id or csrf token", body = ErrorBody),
        (status = 403, description = "Refresh rejected", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    peer: PeerAddr,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    // A malformed header reads as a missing one; both are unauthenticated.
    let correlation_id = bearer(&headers).ok();
    let client = client_context(&auth_state, &headers, peer)?;

    let protocol = RefreshProtocol {
        sessions: auth_state.sessions(),
        tokens: auth_state.tokens(),
        encoder: auth_state.encoder(),
        policy: auth_state.config().refresh_policy(),
    };
    let issued = protocol
        .run(RefreshRequest {
            correlation_id,
            csrf: csrf(&headers),
            client: &client,
        })
        .await?;

    Ok((
        StatusCode::OK,
        no_store_headers(),
        Json(RefreshResponse::from(&issued)),
    ))
}
