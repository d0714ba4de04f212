use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;

use super::{principal::require_auth, state::AuthState, types::UsernameResponse};
use crate::error::{AuthError, ErrorBody};

#[utoipa::path(
    get,
    path = "/auth/check-username",
    responses(
        (status = 200, description = "Owner of the presented session", body = UsernameResponse),
        (status = 401, description = "Missing credentials or expired access token", body = ErrorBody),
        (status = 403, description = "Session rejected", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn check_username(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let principal = require_auth(&auth_state, &headers).await?;
    Ok((
        StatusCode::OK,
        Json(UsernameResponse {
            username: principal.username,
        }),
    ))
}
