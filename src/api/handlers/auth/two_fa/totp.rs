use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::debug;

use super::load_user;
use crate::{
    api::handlers::auth::{
        context::{PeerAddr, client_context},
        no_store_headers,
        principal::require_auth,
        state::AuthState,
        types::{SessionBootstrap, TotpLoginRequest, TotpVerifyRequest, TwoFaMethodResponse},
    },
    error::{AuthError, ErrorBody},
    mfa::TotpEnrollment,
    session::LoginWith,
    token,
    users::TwoFaMethod,
};

#[utoipa::path(
    post,
    path = "/auth/two-fa/totp/register",
    responses(
        (status = 200, description = "Secret to add to the authenticator app", body = TotpEnrollment),
        (status = 401, description = "Not signed in", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "two-fa"
)]
pub async fn register(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let principal = require_auth(&auth_state, &headers).await?;
    let user = load_user(&auth_state, principal.user_id).await?;

    let enrollment = auth_state
        .totp()
        .register_begin(user.id, &user.email)
        .await?;

    Ok((StatusCode::OK, no_store_headers(), Json(enrollment)))
}

#[utoipa::path(
    post,
    path = "/auth/two-fa/totp/verify",
    request_body = TotpVerifyRequest,
    responses(
        (status = 200, description = "Authenticator app enabled", body = TwoFaMethodResponse),
        (status = 403, description = "Wrong code, registration discarded", body = ErrorBody),
        (status = 404, description = "Registration unknown or expired", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "two-fa"
)]
pub async fn verify(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<TotpVerifyRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let principal = require_auth(&auth_state, &headers).await?;

    auth_state
        .totp()
        .verify(
            auth_state.credentials(),
            auth_state.users(),
            principal.user_id,
            request.registration_id,
            &request.code,
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(TwoFaMethodResponse {
            two_fa_method: Some(TwoFaMethod::App),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/auth/two-fa/totp/login",
    request_body = TotpLoginRequest,
    responses(
        (status = 200, description = "Signed in", body = SessionBootstrap),
        (status = 403, description = "Wrong or reused code, or invalid sign-in ticket", body = ErrorBody)
    ),
    tag = "two-fa"
)]
pub async fn login(
    headers: HeaderMap,
    peer: PeerAddr,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<TotpLoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let client = client_context(&auth_state, &headers, peer)?;
    let attempt = auth_state
        .tickets()
        .begin(&request.mfa_ticket, &client)
        .await?;
    let user_id = attempt.user_id();

    if let Err(err) = auth_state
        .totp()
        .check(auth_state.credentials(), user_id, &request.code)
        .await
    {
        if matches!(err, AuthError::PermissionDenied(_)) {
            let left = auth_state.tickets().fail(attempt).await;
            debug!(%user_id, left, "TOTP login refused");
        }
        return Err(err);
    }
    let user = load_user(&auth_state, user_id).await?;

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
    path = "/auth/two-fa/totp",
    responses(
        (status = 200, description = "Authenticator app removed", body = TwoFaMethodResponse),
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
        .totp()
        .delete(
            auth_state.credentials(),
            auth_state.users(),
            principal.user_id,
        )
        .await?;

    Ok((StatusCode::OK, Json(TwoFaMethodResponse { two_fa_method })))
}
