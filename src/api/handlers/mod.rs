//! API handlers for Quillgate.

pub mod auth;
pub mod health;

use crate::APP_USER_AGENT;

/// `GET /` answers with the service name and version.
pub async fn root() -> &'static str {
    APP_USER_AGENT
}
