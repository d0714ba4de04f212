mod common;

use anyhow::{Result, anyhow};
use axum::http::{
    Method, Request, StatusCode,
    header::{CACHE_CONTROL, CONTENT_TYPE},
};
use common::{Device, FIREFOX_WINDOWS, Harness};
use quillgate::{session::SessionStore, users::UserStore};
use serde_json::{Value, json};

#[tokio::test]
async fn one_live_session_per_device() -> Result<()> {
    let harness = Harness::new()?;
    let chrome = Device::chrome();
    harness.register(&chrome, "alice").await?;

    let mut last = None;
    for _ in 0..5 {
        last = Some(harness.login(&chrome, "alice").await?);
    }
    let last = last.ok_or_else(|| anyhow!("no login"))?;

    let session = harness
        .store
        .find_by_correlation_id(last.correlation_id()?)
        .await?
        .ok_or_else(|| anyhow!("session missing"))?;
    let on_device = harness
        .store
        .find_by_user_and_device(session.user_id, &session.device_id)
        .await?;
    assert_eq!(on_device.iter().filter(|s| !s.revoked).count(), 1);

    // A second browser gets its own session.
    harness
        .login(&chrome.clone().with_user_agent(FIREFOX_WINDOWS), "alice")
        .await?;
    assert_eq!(harness.store.list_by_user(session.user_id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn empty_password_creates_nothing() -> Result<()> {
    let harness = Harness::new()?;
    let chrome = Device::chrome();

    let (status, body) = harness
        .send(chrome.request(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({
                "username": "mallory",
                "email": "mallory@example.com",
                "password": "",
            })),
        )?)
        .await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");
    assert!(
        harness
            .store
            .find_by_email_or_username("mallory")
            .await?
            .is_none()
    );
    Ok(())
}

#[tokio::test]
async fn missing_user_agent_is_invalid() -> Result<()> {
    let harness = Harness::new()?;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/auth/login")
        .header(CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from(
            json!({"emailOrUsername": "alice", "password": "x"}).to_string(),
        ))?;

    let (status, body) = harness.send(request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "missing user agent");
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_conflicts() -> Result<()> {
    let harness = Harness::new()?;
    let chrome = Device::chrome();
    harness.register(&chrome, "judy").await?;

    let (status, body) = harness
        .send(chrome.request(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({
                "username": "judy",
                "email": "someone-else@example.com",
                "password": "hunter2hunter2",
            })),
        )?)
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "already_exists");
    Ok(())
}

#[tokio::test]
async fn bootstrap_payload_and_cache_headers() -> Result<()> {
    let harness = Harness::new()?;
    let chrome = Device::chrome();

    let request = chrome.request(
        Method::POST,
        "/auth/register",
        None,
        Some(json!({
            "username": "kim",
            "email": "Kim@Example.com",
            "password": "hunter2hunter2",
            "name": "Kim",
        })),
    )?;
    let response = tower::ServiceExt::oneshot(harness.app.clone(), request).await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(
        response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("no-store"))
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let body: Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["username"], "kim");
    assert_eq!(body["email"], "kim@example.com");
    assert_eq!(body["role"], "Author");
    assert_eq!(body["isVerified"], false);
    assert!(body["exp"].as_i64().is_some_and(|exp| exp > 0));
    assert!(body.get("accessToken").is_none());
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_denied() -> Result<()> {
    let harness = Harness::new()?;
    let chrome = Device::chrome();
    harness.register(&chrome, "leo").await?;

    for identifier in ["leo", "nobody"] {
        let (status, body) = harness
            .send(chrome.request(
                Method::POST,
                "/auth/login",
                None,
                Some(json!({"emailOrUsername": identifier, "password": "wrong password"})),
            )?)
            .await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "invalid credentials");
    }
    Ok(())
}

#[tokio::test]
async fn check_username_needs_a_session() -> Result<()> {
    let harness = Harness::new()?;
    let chrome = Device::chrome();
    let session = harness.register(&chrome, "mia").await?;

    let (status, body) = harness
        .send(chrome.request(Method::GET, "/auth/check-username", Some(&session), None)?)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "mia");

    let (status, _) = harness
        .send(chrome.request(Method::GET, "/auth/check-username", None, None)?)
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn health_and_root() -> Result<()> {
    let harness = Harness::new()?;
    let chrome = Device::chrome();

    let (status, body) = harness
        .send(chrome.request(Method::GET, "/health", None, None)?)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "ok");
    assert_eq!(body["name"], "quillgate");
    assert_eq!(body["oauth"], "disabled");

    let response = tower::ServiceExt::oneshot(
        harness.app.clone(),
        chrome.request(Method::GET, "/", None, None)?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    Ok(())
}
