//! Request and response bodies of the auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    token::IssuedSession,
    users::{SavedAccount, TwoFaMethod, User},
};

/// Query string of the emailed verification link.
#[derive(Deserialize, Debug, Default)]
pub struct VerifyEmailQuery {
    pub username: Option<String>,
    pub subject: Option<String>,
    pub code: Option<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct RegisterRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email_or_username: String,
    pub password: String,
}

/// What a client needs after signing in: the session handle and who it belongs to.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionBootstrap {
    pub client_id: Uuid,
    pub csrf: String,
    pub username: String,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    /// Access token expiry, unix seconds.
    pub exp: i64,
    pub is_verified: bool,
}

impl SessionBootstrap {
    pub(crate) fn new(issued: &IssuedSession, user: &User) -> Self {
        Self {
            client_id: issued.session.correlation_id,
            csrf: issued.csrf.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role.clone(),
            exp: issued.session.access_expires_at.timestamp(),
            is_verified: user.verified,
        }
    }
}

/// Password accepted; the account still has to pass its second factor.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SecondFactorRequired {
    /// Single-use ticket for the second-factor login endpoints, bound to this device.
    pub mfa_ticket: String,
    pub two_fa_method: TwoFaMethod,
    /// Seconds until the ticket expires.
    pub expires_in: u64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub client_id: Uuid,
    pub csrf: String,
    pub exp: i64,
}

impl From<&IssuedSession> for RefreshResponse {
    fn from(issued: &IssuedSession) -> Self {
        Self {
            client_id: issued.session.correlation_id,
            csrf: issued.csrf.clone(),
            exp: issued.session.access_expires_at.timestamp(),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct UsernameResponse {
    pub username: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SavedAccountResponse {
    pub username: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub two_fa_method: Option<TwoFaMethod>,
}

impl From<SavedAccount> for SavedAccountResponse {
    fn from(account: SavedAccount) -> Self {
        Self {
            username: account.username,
            name: account.name,
            picture: account.picture,
            two_fa_method: account.two_fa_method,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TwoFaStatusResponse {
    pub two_fa_method: TwoFaMethod,
}

/// The second factor left after removing one, if any.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TwoFaMethodResponse {
    pub two_fa_method: Option<TwoFaMethod>,
}

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TotpVerifyRequest {
    pub registration_id: Uuid,
    pub code: String,
}

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TotpLoginRequest {
    pub mfa_ticket: String,
    pub code: String,
}

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WebauthnLoginOptionsRequest {
    pub mfa_ticket: String,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct OAuthRequest {
    pub code: String,
}

/// A WebAuthn ceremony challenge, passed to `navigator.credentials` as is.
#[derive(ToSchema, Serialize, Debug)]
pub struct WebauthnOptionsResponse {
    pub options: serde_json::Value,
}

/// The browser's credential response, forwarded untouched.
#[derive(ToSchema, Deserialize, Debug)]
pub struct WebauthnVerifyRequest {
    pub response: serde_json::Value,
}

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WebauthnLoginVerifyRequest {
    pub mfa_ticket: String,
    pub response: serde_json::Value,
}
