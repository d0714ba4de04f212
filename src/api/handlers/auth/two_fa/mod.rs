//! Two-factor endpoints: status lookup, authenticator app and WebAuthn.

pub mod totp;
pub mod webauthn;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use std::sync::Arc;
use uuid::Uuid;

use super::{state::AuthState, types::TwoFaStatusResponse};
use crate::{
    error::{AuthError, ErrorBody},
    users::User,
};

const NO_SECOND_FACTOR: &str = "two-factor authentication is not enabled";

#[utoipa::path(
    get,
    path = "/auth/two-fa/status/{email_or_username}",
    params(("email_or_username" = String, Path, description = "Email or username")),
    responses(
        (status = 200, description = "Second factor the account signs in with", body = TwoFaStatusResponse),
        (status = 403, description = "No second factor or unknown account", body = ErrorBody)
    ),
    tag = "two-fa"
)]
pub async fn status(
    Path(email_or_username): Path<String>,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    // Unknown accounts answer like accounts without a second factor.
    let user = auth_state
        .users()
        .find_by_email_or_username(&email_or_username)
        .await?
        .ok_or_else(|| AuthError::permission_denied(NO_SECOND_FACTOR))?;

    let two_fa_method = auth_state
        .users()
        .ensure_settings(user.id)
        .await?
        .two_fa_method
        .ok_or_else(|| AuthError::permission_denied(NO_SECOND_FACTOR))?;

    Ok((StatusCode::OK, Json(TwoFaStatusResponse { two_fa_method })))
}

pub(super) async fn load_user(auth_state: &AuthState, user_id: Uuid) -> Result<User, AuthError> {
    auth_state
        .users()
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AuthError::not_found("user not found"))
}
