use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    context::{PeerAddr, client_context},
    no_store_headers,
    state::AuthState,
    types::{RegisterRequest, SessionBootstrap},
};
use crate::{
    email::verification_email,
    error::{AuthError, ErrorBody},
    session::LoginWith,
    token,
    users::{
        NewUser, ROLE_AUTHOR, User, normalize_email,
        password::hash_password,
        valid_email, valid_username,
        verification::{VerificationCode, verification_link},
    },
};

#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and signed in", body = SessionBootstrap),
        (status = 400, description = "Missing or invalid fields", body = ErrorBody),
        (status = 409, description = "Username or email already taken", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn register(
    headers: HeaderMap,
    peer: PeerAddr,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let username = required(request.username.as_deref(), "username")?;
    let email = normalize_email(required(request.email.as_deref(), "email")?);
    let password = request
        .password
        .as_deref()
        .filter(|password| !password.is_empty())
        .ok_or_else(|| AuthError::invalid_argument("password is required"))?;

    if !valid_username(username) {
        return Err(AuthError::invalid_argument("invalid username"));
    }
    if !valid_email(&email) {
        return Err(AuthError::invalid_argument("invalid email"));
    }

    let client = client_context(&auth_state, &headers, peer)?;
    let password_hash = hash_password(password)?;
    let name = request
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    let user = auth_state
        .users()
        .create_user(NewUser {
            username: username.to_string(),
            email,
            password_hash: Some(password_hash),
            name,
            picture: None,
            role_id: ROLE_AUTHOR,
            verified: false,
        })
        .await?
        .ok_or_else(|| AuthError::already_exists("username or email already taken"))?;

    debug!(user_id = %user.id, "user registered");

    let issued = token::issue(
        auth_state.tokens(),
        auth_state.sessions(),
        auth_state.users(),
        &user,
        &client,
        LoginWith::Credentials,
    )
    .await?;

    if let Err(err) = send_verification(&auth_state, &user).await {
        warn!(user_id = %user.id, "failed to send verification email: {err:#}");
    }

    Ok((
        StatusCode::CREATED,
        no_store_headers(),
        Json(SessionBootstrap::new(&issued, &user)),
    ))
}

/// Store a fresh verification code for `user` and mail the link.
async fn send_verification(auth_state: &AuthState, user: &User) -> anyhow::Result<()> {
    let code = VerificationCode::generate(Utc::now())?;
    auth_state
        .users()
        .save_email_verification(user.id, &code.code_hash, code.expires_at)
        .await?;

    let link = verification_link(auth_state.config().public_url(), &user.username, &code.code)?;
    let (subject, html) =
        verification_email(user.name.as_deref().unwrap_or(&user.username), link.as_str());
    auth_state.email().send(&user.email, &subject, &html).await
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, AuthError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AuthError::invalid_argument(format!("{field} is required")))
}
