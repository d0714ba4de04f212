use super::auth::AuthState;
use crate::GIT_COMMIT_HASH;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    /// `ok` when the session store answers, `error` otherwise.
    database: String,
    /// `enabled` when an identity service is configured for OAuth.
    oauth: String,
}

impl Health {
    fn app_header(&self) -> HeaderMap {
        let short_hash = self.commit.get(..7).unwrap_or_default();
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&format!("{}:{}:{short_hash}", self.name, self.version)) {
            Ok(value) => {
                debug!("X-App header: {value:?}");
                headers.insert("X-App", value);
            }
            Err(err) => error!("Failed to build X-App header: {err}"),
        }
        headers
    }
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Session store is reachable", body = [Health]),
        (status = 503, description = "Session store is unreachable", body = [Health])
    ),
    tag= "health"
)]
// axum handler for health
pub async fn health(method: Method, auth_state: Extension<Arc<AuthState>>) -> Response {
    let store_ok = match auth_state.sessions().ping().await {
        Ok(()) => true,
        Err(err) => {
            error!("Session store ping failed: {err:#}");
            false
        }
    };

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if store_ok { "ok" } else { "error" }.to_string(),
        oauth: if auth_state.oauth_enabled() {
            "enabled"
        } else {
            "disabled"
        }
        .to_string(),
    };

    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let headers = health.app_header();

    // OPTIONS only gets the status and X-App header.
    if method == Method::GET {
        (status, headers, Json(health)).into_response()
    } else {
        (status, headers, Body::empty()).into_response()
    }
}
