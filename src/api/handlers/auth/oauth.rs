use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::debug;

use super::{
    context::{PeerAddr, client_context},
    no_store_headers,
    state::AuthState,
    types::{OAuthRequest, SessionBootstrap},
};
use crate::{
    error::{AuthError, ErrorBody},
    identity::{Provider, derive_username},
    token,
    users::{NewUser, ROLE_AUTHOR, normalize_email},
};

/// Sign in with an authorization code from Google or GitHub.
///
/// The code is traded for a profile by the identity service; first logins create a
/// verified account.
#[utoipa::path(
    post,
    path = "/auth/oauth/{provider}",
    params(("provider" = String, Path, description = "`google` or `github`")),
    request_body = OAuthRequest,
    responses(
        (status = 200, description = "Signed in", body = SessionBootstrap),
        (status = 400, description = "Unsupported provider or missing code", body = ErrorBody),
        (status = 504, description = "Identity provider timed out", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn oauth(
    headers: HeaderMap,
    peer: PeerAddr,
    Path(provider): Path<String>,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<OAuthRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let provider: Provider = provider.parse()?;
    let code = request.code.trim();
    if code.is_empty() {
        return Err(AuthError::invalid_argument("authorization code is required"));
    }
    let client = client_context(&auth_state, &headers, peer)?;

    let identity = auth_state
        .identity()
        .ok_or_else(|| anyhow::anyhow!("identity provider unavailable"))?;
    let profile = identity.exchange_code(provider, code).await?;

    let user = auth_state
        .users()
        .find_or_create_by_email(NewUser {
            username: derive_username(&profile.name),
            email: normalize_email(&profile.email),
            password_hash: None,
            name: Some(profile.name),
            picture: profile.picture,
            role_id: ROLE_AUTHOR,
            verified: true,
        })
        .await?;

    debug!(user_id = %user.id, %provider, "OAuth login");

    let issued = token::issue(
        auth_state.tokens(),
        auth_state.sessions(),
        auth_state.users(),
        &user,
        &client,
        provider.login_with(),
    )
    .await?;

    Ok((
        StatusCode::OK,
        no_store_headers(),
        Json(SessionBootstrap::new(&issued, &user)),
    ))
}
