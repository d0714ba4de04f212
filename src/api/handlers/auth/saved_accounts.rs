//! Accounts remembered on a device, keyed by the `User-Agent` fingerprint.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use super::{
    context::{PeerAddr, client_context},
    state::AuthState,
    types::SavedAccountResponse,
};
use crate::error::{AuthError, ErrorBody};

#[utoipa::path(
    get,
    path = "/auth/saved-accounts",
    responses(
        (status = 200, description = "Accounts saved on this device", body = [SavedAccountResponse]),
        (status = 400, description = "Missing user agent", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn saved_accounts(
    headers: HeaderMap,
    peer: PeerAddr,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let client = client_context(&auth_state, &headers, peer)?;

    let cutoff = Utc::now() - auth_state.config().sweep_config().retention();
    if let Err(err) = auth_state.users().sweep_saved_accounts(cutoff).await {
        warn!("failed to sweep saved accounts: {err:#}");
    }

    let accounts: Vec<SavedAccountResponse> = auth_state
        .users()
        .saved_accounts(&client.device_id)
        .await?
        .into_iter()
        .map(SavedAccountResponse::from)
        .collect();

    Ok((StatusCode::OK, Json(accounts)))
}

#[utoipa::path(
    delete,
    path = "/auth/saved-accounts/{username}",
    params(("username" = String, Path, description = "Account to forget on this device")),
    responses(
        (status = 204, description = "Account forgotten"),
        (status = 400, description = "Missing user agent", body = ErrorBody),
        (status = 404, description = "Account not saved on this device", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn delete_saved_account(
    headers: HeaderMap,
    peer: PeerAddr,
    Path(username): Path<String>,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let client = client_context(&auth_state, &headers, peer)?;

    let removed = auth_state
        .users()
        .unlink_saved_account(&client.device_id, username.trim())
        .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AuthError::not_found("account not saved on this device"))
    }
}
