use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use super::{
    context::{PeerAddr, client_context},
    no_store_headers,
    state::AuthState,
    types::{LoginRequest, SecondFactorRequired, SessionBootstrap},
};
use crate::{
    error::{AuthError, ErrorBody},
    session::LoginWith,
    token,
    users::password::verify_password,
};

const INVALID_CREDENTIALS: &str = "invalid credentials";

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in", body = SessionBootstrap),
        (status = 202, description = "Password accepted, second factor required", body = SecondFactorRequired),
        (status = 400, description = "Missing fields or user agent", body = ErrorBody),
        (status = 403, description = "Invalid credentials", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    peer: PeerAddr,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    let identifier = request.email_or_username.trim();
    if identifier.is_empty() || request.password.is_empty() {
        return Err(AuthError::invalid_argument(
            "email or username and password are required",
        ));
    }
    let client = client_context(&auth_state, &headers, peer)?;

    let user = auth_state
        .users()
        .find_by_email_or_username(identifier)
        .await?
        .ok_or_else(|| AuthError::permission_denied(INVALID_CREDENTIALS))?;

    // OAuth-only accounts have no password.
    let Some(password_hash) = user.password_hash.as_deref() else {
        return Err(AuthError::permission_denied(INVALID_CREDENTIALS));
    };
    if !verify_password(&request.password, password_hash)? {
        debug!(user_id = %user.id, "password mismatch");
        return Err(AuthError::permission_denied(INVALID_CREDENTIALS));
    }

    let settings = auth_state.users().ensure_settings(user.id).await?;
    if let Some(two_fa_method) = settings.two_fa_method {
        let mfa_ticket = auth_state.tickets().issue(user.id, &client).await?;
        debug!(user_id = %user.id, %two_fa_method, "second factor required");
        return Ok((
            StatusCode::ACCEPTED,
            no_store_headers(),
            Json(SecondFactorRequired {
                mfa_ticket,
                two_fa_method,
                expires_in: auth_state.config().challenge_ttl_seconds(),
            }),
        )
            .into_response());
    }

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
    )
        .into_response())
}
