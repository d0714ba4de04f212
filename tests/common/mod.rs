#![allow(dead_code)]

use anyhow::{Result, anyhow};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{
        Method, Request, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
    },
};
use quillgate::{
    api::{
        self,
        handlers::auth::{AuthConfig, AuthSecrets, AuthState, Stores},
    },
    store::MemoryStore,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

pub const CHROME_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const FIREFOX_WINDOWS: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0";

pub struct Harness {
    pub app: Router,
    pub store: Arc<MemoryStore>,
    pub state: Arc<AuthState>,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::with_config(AuthConfig::new())
    }

    pub fn with_config(config: AuthConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let secrets = AuthSecrets {
            access_token: SecretString::from("access-secret"),
            refresh_token: SecretString::from("refresh-secret"),
            fingerprint: SecretString::from("fingerprint-secret"),
        };
        let state = Arc::new(AuthState::new(
            config,
            secrets,
            Stores::from_backend(store.clone()),
        )?);
        let app = api::app(state.clone())?;
        Ok(Self { app, store, state })
    }

    pub async fn send(&self, request: Request<Body>) -> Result<(StatusCode, Value)> {
        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, body))
    }

    /// Register `username` from `device` and return its session.
    pub async fn register(&self, device: &Device, username: &str) -> Result<Session> {
        let (status, body) = self
            .send(device.request(
                Method::POST,
                "/auth/register",
                None,
                Some(json!({
                    "username": username,
                    "email": format!("{username}@example.com"),
                    "password": "correct horse battery staple",
                    "name": username,
                })),
            )?)
            .await?;
        if status != StatusCode::CREATED {
            return Err(anyhow!("register failed with {status}: {body}"));
        }
        Session::from_body(&body)
    }

    pub async fn login(&self, device: &Device, username: &str) -> Result<Session> {
        let (status, body) = self
            .send(device.request(
                Method::POST,
                "/auth/login",
                None,
                Some(json!({
                    "emailOrUsername": username,
                    "password": "correct horse battery staple",
                })),
            )?)
            .await?;
        if status != StatusCode::OK {
            return Err(anyhow!("login failed with {status}: {body}"));
        }
        Session::from_body(&body)
    }

    pub async fn refresh(&self, device: &Device, session: &Session) -> Result<(StatusCode, Value)> {
        self.send(device.request(Method::POST, "/auth/refresh", Some(session), None)?)
            .await
    }
}

/// A simulated browser: user agent plus source address.
#[derive(Clone, Debug)]
pub struct Device {
    pub user_agent: &'static str,
    pub ip: &'static str,
}

impl Device {
    pub const fn chrome() -> Self {
        Self {
            user_agent: CHROME_WINDOWS,
            ip: "203.0.113.10",
        }
    }

    pub fn from_ip(self, ip: &'static str) -> Self {
        Self { ip, ..self }
    }

    pub fn with_user_agent(self, user_agent: &'static str) -> Self {
        Self { user_agent, ..self }
    }

    pub fn request(
        &self,
        method: Method,
        uri: &str,
        session: Option<&Session>,
        body: Option<Value>,
    ) -> Result<Request<Body>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_AGENT, self.user_agent)
            .header("x-forwarded-for", self.ip);
        if let Some(session) = session {
            builder = builder
                .header(AUTHORIZATION, format!("Bearer {}", session.client_id))
                .header("x-csrf-token", session.csrf.as_str());
        }
        let request = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))?,
            None => builder.body(Body::empty())?,
        };
        Ok(request)
    }
}

/// The credentials a client keeps after signing in.
#[derive(Clone, Debug)]
pub struct Session {
    pub client_id: String,
    pub csrf: String,
}

impl Session {
    pub fn from_body(body: &Value) -> Result<Self> {
        let field = |name: &str| {
            body.get(name)
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| anyhow!("missing {name} in {body}"))
        };
        Ok(Self {
            client_id: field("clientId")?,
            csrf: field("csrf")?,
        })
    }

    pub fn with_csrf(&self, csrf: &str) -> Self {
        Self {
            client_id: self.client_id.clone(),
            csrf: csrf.to_string(),
        }
    }

    pub fn correlation_id(&self) -> Result<uuid::Uuid> {
        Ok(uuid::Uuid::parse_str(&self.client_id)?)
    }
}
