//! Landing endpoint of the email verification link.

use anyhow::Context;
use axum::{
    extract::{Extension, Query},
    http::{HeaderValue, StatusCode, header::LOCATION},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::{no_store_headers, state::AuthState, types::VerifyEmailQuery};
use crate::{
    error::{AuthError, ErrorBody},
    users::verification::{VERIFY_EMAIL_SUBJECT, VerificationStatus, hash_code},
};

/// Redeem a verification code and send the browser to the frontend status page.
#[utoipa::path(
    get,
    path = "/auth/verify-email",
    params(
        ("username" = String, Query, description = "Account the link was sent to"),
        ("subject" = String, Query, description = "Always `verify-email`"),
        ("code" = String, Query, description = "Code from the email")
    ),
    responses(
        (status = 302, description = "Redirect to `{client}/auth/email/status/{username}` with `verified` and `message` query parameters"),
        (status = 500, description = "Storage failure", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn verify_email(
    auth_state: Extension<Arc<AuthState>>,
    Query(query): Query<VerifyEmailQuery>,
) -> Result<Response, AuthError> {
    let username = query.username.as_deref().map(str::trim).unwrap_or_default();
    let status = verification_status(&auth_state, username, &query).await?;
    debug!(username, ?status, "email verification");

    let location = status
        .status_location(auth_state.config().client_url(), username)
        .context("invalid client url")?;
    let location =
        HeaderValue::from_str(location.as_str()).context("invalid verification redirect")?;

    let mut headers = no_store_headers();
    headers.insert(LOCATION, location);
    Ok((StatusCode::FOUND, headers).into_response())
}

async fn verification_status(
    auth_state: &AuthState,
    username: &str,
    query: &VerifyEmailQuery,
) -> Result<VerificationStatus, AuthError> {
    let code = query.code.as_deref().map(str::trim).unwrap_or_default();
    if username.is_empty()
        || code.is_empty()
        || query.subject.as_deref() != Some(VERIFY_EMAIL_SUBJECT)
    {
        return Ok(VerificationStatus::InvalidRequest);
    }

    let Some(user) = auth_state
        .users()
        .find_by_email_or_username(username)
        .await?
        .filter(|user| user.username.eq_ignore_ascii_case(username))
    else {
        return Ok(VerificationStatus::NotFound);
    };

    let redeemed = auth_state
        .users()
        .redeem_email_verification(user.id, &hash_code(code), Utc::now())
        .await?;

    Ok(match (redeemed, user.verified) {
        (false, _) => VerificationStatus::NotFound,
        (true, true) => VerificationStatus::AlreadyVerified,
        (true, false) => {
            info!(user_id = %user.id, "email verified");
            VerificationStatus::Verified
        }
    })
}
