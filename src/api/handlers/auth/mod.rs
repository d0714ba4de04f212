//! Auth endpoints.
//!
//! Sessions are presented as `Authorization: Bearer <clientId>` together with
//! `X-CSRF-Token: <csrf>`, both taken from the bootstrap payload that register,
//! login, the second-factor logins and OAuth return. `POST /auth/refresh` swaps
//! them for a fresh pair; see [`crate::refresh`] for the checks it runs.

pub mod check_username;
pub mod context;
pub mod login;
pub mod logout;
pub mod oauth;
pub mod principal;
pub mod refresh;
pub mod register;
pub mod saved_accounts;
pub mod state;
pub mod two_fa;
pub mod types;
pub mod verify_email;

#[cfg(test)]
mod tests;

use axum::http::{
    HeaderMap, HeaderValue,
    header::{CACHE_CONTROL, EXPIRES, PRAGMA},
};

pub use principal::{Principal, require_auth};
pub use state::{AuthConfig, AuthSecrets, AuthState, Stores};

/// Headers that keep session material out of every cache.
pub(crate) fn no_store_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    headers
}
