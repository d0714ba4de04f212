use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential};

use super::load_user;
use crate::{
    api::handlers::auth::{
        context::{PeerAddr, client_context},
        no_store_headers,
        principal::require_auth,
        state::AuthState,
        types::{
            SessionBootstrap, TwoFaMethodResponse, WebauthnLoginOptionsRequest,
            WebauthnLoginVerifyRequest, WebauthnOptionsResponse, WebauthnVerifyRequest,
        },
    },
    error::{AuthError, ErrorBody},
    session::LoginWith,
    token,
    users::TwoFaMethod,
};

#[utoipa::path(
    post,
    path = "/auth/two-fa/webauthn/register/options",
    responses(
        (status = 200, description = "Credential creation options", body = WebauthnOptionsResponse),
        (status = 401, description = "Not signed in", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "two-fa"
)]
pub async fn register_options(
    headers: HeaderMap,
    peer: PeerAddr,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let principal = require_auth(&auth_state, &headers).await?;
    let client = client_context(&auth_state, &headers, peer)?;
    let user = load_user(&auth_state, principal.user_id).await?;

    let challenge = auth_state
        .webauthn()
        .register_options(auth_state.credentials(), &user, &client)
        .await?;

    Ok((StatusCode::OK, Json(options(&challenge)?)))
}

#[utoipa::path(
    post,
    path = "/auth/two-fa/webauthn/register/verify",
    request_body = WebauthnVerifyRequest,
    responses(
        (status = 200, description = "Passkey registered", body = TwoFaMethodResponse),
        (status = 403, description = "Verification failed", body = ErrorBody),
        (status = 404, description = "No pending registration", body = ErrorBody),
        (status = 409, description = "Passkey already registered", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "two-fa"
)]
pub async fn register_verify(
    headers: HeaderMap,
    peer: PeerAddr,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<WebauthnVerifyRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let principal = require_auth(&auth_state, &headers).await?;
    let client = client_context(&auth_state, &headers, peer)?;
    let response: RegisterPublicKeyCredential = parse_response(request.response)?;

    auth_state
        .webauthn()
        .register_verify(
            auth_state.credentials(),
            auth_state.users(),
            principal.user_id,
            &client,
            &response,
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(TwoFaMethodResponse {
            two_fa_method: Some(TwoFaMethod::Passkey),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/auth/two-fa/webauthn/login/options",
    request_body = WebauthnLoginOptionsRequest,
    responses(
        (status = 200, description = "Credential request options", body = WebauthnOptionsResponse),
        (status = 403, description = "No passkey on this device or invalid sign-in ticket", body = ErrorBody)
    ),
    tag = "two-fa"
)]
pub async fn login_options(
    headers: HeaderMap,
    peer: PeerAddr,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<WebauthnLoginOptionsRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let client = client_context(&auth_state, &headers, peer)?;
    let user_id = auth_state
        .tickets()
        .peek(&request.mfa_ticket, &client)
        .await?;
    let user = load_user(&auth_state, user_id).await?;

    let challenge = auth_state
        .webauthn()
        .login_options(auth_state.credentials(), &user, &client)
        .await?;

    Ok((StatusCode::OK, Json(options(&challenge)?)))
}

#[utoipa::path(
    post,
    path = "/auth/two-fa/webauthn/login/verify",
    request_body = WebauthnLoginVerifyRequest,
    responses(
        (status = 200, description = "Signed in", body = SessionBootstrap),
        (status = 403, description = "Verification failed or invalid sign-in ticket", body = ErrorBody),
        (status = 404, description = "No pending login", body = ErrorBody)
    ),
    tag = "two-fa"
)]
pub async fn login_verify(
    headers: HeaderMap,
    peer: PeerAddr,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<WebauthnLoginVerifyRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let client = client_context(&auth_state, &headers, peer)?;
    let response: PublicKeyCredential = parse_response(request.response)?;
    let attempt = auth_state
        .tickets()
        .begin(&request.mfa_ticket, &client)
        .await?;
    let user_id = attempt.user_id();

    let verified = auth_state
        .webauthn()
        .login_verify(
            auth_state.credentials(),
            auth_state.users(),
            &client,
            &response,
        )
        .await
        .and_then(|user| {
            if user.id == user_id {
                Ok(user)
            } else {
                Err(AuthError::permission_denied("passkey belongs to another account"))
            }
        });
    let user = match verified {
        Ok(user) => user,
        Err(err) => {
            if matches!(err, AuthError::PermissionDenied(_) | AuthError::NotFound(_)) {
                let left = auth_state.tickets().fail(attempt).await;
                debug!(%user_id, left, "WebAuthn login refused");
            }
            return Err(err);
        }
    };

    let issued = token::issue(
        auth_state.tokens(),
        auth_state.sessions(),
        auth_state.users(),
        &user,
        &client,
        LoginWith::Credentials,
    )
    .await?;

    Ok((
        StatusCode::OK,
        no_store_headers(),
        Json(SessionBootstrap::new(&issued, &user)),
    ))
}

#[utoipa::path(
    delete,
    path = "/auth/two-fa/webauthn",
    responses(
        (status = 200, description = "This device's passkeys removed", body = TwoFaMethodResponse),
        (status = 401, description = "Not signed in", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "two-fa"
)]
pub async fn delete(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let principal = require_auth(&auth_state, &headers).await?;

    let two_fa_method = auth_state
        .webauthn()
        .delete(
            auth_state.credentials(),
            auth_state.users(),
            principal.user_id,
            &principal.device_id,
        )
        .await?;

    Ok((StatusCode::OK, Json(TwoFaMethodResponse { two_fa_method })))
}

fn options<T: Serialize>(challenge: &T) -> Result<WebauthnOptionsResponse, AuthError> {
    let options = serde_json::to_value(challenge)
        .map_err(|e| anyhow::anyhow!("failed to serialize WebAuthn options: {e}"))?;
    Ok(WebauthnOptionsResponse { options })
}

fn parse_response<T: serde::de::DeserializeOwned>(response: Value) -> Result<T, AuthError> {
    serde_json::from_value(response)
        .map_err(|_| AuthError::invalid_argument("invalid WebAuthn response"))
}
