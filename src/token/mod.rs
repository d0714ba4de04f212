//! Session issuance: mint tokens, record the session, run the login side effects.
//!
//! Every issuance gets a fresh random correlation id (UUID v4) and csrf value.
//! The device fingerprint is stored next to it as `device_id`, which is what the
//! one-session-per-device rule and saved accounts key on.

pub mod jwt;

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::AuthError,
    session::{ClientContext, LoginWith, NewSession, Session, SessionStore, hash_csrf},
    users::{User, UserStore},
};

pub use jwt::{MintedTokens, Subject, TokenError, TokenIssuer};

/// A session that was just written, plus the csrf value only the client gets to see.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub csrf: String,
}

/// Create a random csrf value.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_csrf() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate csrf token")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Mint tokens for `subject` and build the row for a new session on `client`'s device.
/// Nothing is written; the caller decides whether this is a fresh login or a rotation.
///
/// # Errors
/// Returns an error if signing or random generation fails.
pub fn prepare_session(
    tokens: &TokenIssuer,
    subject: &Subject,
    client: &ClientContext,
    device_id: &str,
    login_with: LoginWith,
) -> Result<(NewSession, String)> {
    let minted = tokens.mint(subject)?;
    let csrf = generate_csrf()?;

    let session = NewSession {
        correlation_id: Uuid::new_v4(),
        user_id: subject.user_id,
        device_id: device_id.to_string(),
        csrf_hash: hash_csrf(&csrf),
        access_token: minted.access_token,
        refresh_token: minted.refresh_token,
        user_agent: client.user_agent.clone(),
        ip_address: client.ip_address.clone(),
        login_with,
        access_expires_at: minted.access_expires_at,
        refresh_expires_at: minted.refresh_expires_at,
    };

    Ok((session, csrf))
}

/// Issue a brand new session for `user` on the requesting device.
///
/// Settings creation and saved-account linking run afterwards and never fail the login.
///
/// # Errors
/// Returns `Internal` if minting or the session insert fails.
pub async fn issue(
    tokens: &TokenIssuer,
    sessions: &dyn SessionStore,
    users: &dyn UserStore,
    user: &User,
    client: &ClientContext,
    login_with: LoginWith,
) -> Result<IssuedSession, AuthError> {
    let subject = Subject {
        user_id: user.id,
        username: user.username.clone(),
        role: user.role.clone(),
    };

    let (new_session, csrf) =
        prepare_session(tokens, &subject, client, &client.device_id, login_with)?;
    let session = sessions
        .create(new_session)
        .await
        .context("failed to store session")?;

    debug!(user_id = %user.id, login_with = %login_with, "session issued");

    link_device(users, user.id, &client.device_id).await;

    Ok(IssuedSession { session, csrf })
}

async fn link_device(users: &dyn UserStore, user_id: Uuid, device_id: &str) {
    let settings = match users.ensure_settings(user_id).await {
        Ok(settings) => settings,
        Err(err) => {
            warn!(%user_id, "failed to ensure user settings: {err:#}");
            return;
        }
    };

    if settings.two_fa_method.is_some() {
        if let Err(err) = users.link_saved_account(device_id, user_id).await {
            warn!(%user_id, "failed to link saved account: {err:#}");
        }
    }
}
