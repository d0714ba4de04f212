//! # Quillgate (authentication and sessions)
//!
//! `quillgate` signs readers and authors into the blogging platform and keeps
//! their sessions alive.
//!
//! ## Sessions
//!
//! Every sign-in creates a session bound to a device fingerprint: a signed
//! digest of the client's user agent. Each user has at most one live session
//! per device; other users on the same browser build keep theirs. The client
//! holds an opaque correlation id and a CSRF token; the JWT pair never leaves
//! the server.
//!
//! ## Refresh rotation
//!
//! Refreshing rotates both tokens and the CSRF value. Each refresh token is
//! single use: presenting one that was already rotated is treated as theft and
//! revokes every session of its owner.
//!
//! ## Second factors
//!
//! Users may enroll an authenticator app (TOTP) or a WebAuthn credential. With
//! a second factor enabled, a correct password only yields a short-lived,
//! single-use sign-in ticket bound to the device. The second-factor endpoints
//! take that ticket instead of an account name and spend it after a few wrong
//! codes.
//!
//! ## OAuth
//!
//! Google and GitHub codes are exchanged through an identity service over AMQP
//! request/reply. Accounts found by email are signed in; unknown emails are
//! registered as verified authors.

pub mod api;
pub mod cli;
pub mod email;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod mfa;
pub mod refresh;
pub mod session;
pub mod store;
pub mod token;
pub mod users;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
