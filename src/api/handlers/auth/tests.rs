use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{
        Method, Request, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE, LOCATION, USER_AGENT},
    },
};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use totp_rs::{Algorithm, Secret, TOTP};
use tower::ServiceExt;
use uuid::Uuid;

use super::{AuthConfig, AuthSecrets, AuthState, Stores};
use crate::{
    email::EmailSender,
    identity::{IdentityRpc, loopback::LoopbackTransport},
    session::SessionStore,
    store::MemoryStore,
    users::{CredentialStore, TwoFaMethod, UserStore},
};

const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const PASSWORD: &str = "correct horse battery staple";

/// Keeps every sent email as `(to, subject, html)`.
#[derive(Default)]
struct Outbox(Mutex<Vec<(String, String, String)>>);

#[async_trait]
impl EmailSender for Outbox {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        self.0
            .lock()
            .await
            .push((to.to_string(), subject.to_string(), html.to_string()));
        Ok(())
    }
}

struct TestApp {
    app: Router,
    state: Arc<AuthState>,
    store: Arc<MemoryStore>,
    outbox: Arc<Outbox>,
}

fn test_app(config: AuthConfig, identity: Option<LoopbackTransport>) -> Result<TestApp> {
    let store = Arc::new(MemoryStore::new());
    let secrets = AuthSecrets {
        access_token: SecretString::from("access"),
        refresh_token: SecretString::from("refresh"),
        fingerprint: SecretString::from("fingerprint"),
    };
    let outbox = Arc::new(Outbox::default());
    let mut state = AuthState::new(config, secrets, Stores::from_backend(store.clone()))?
        .with_email_sender(outbox.clone());
    if let Some(transport) = identity {
        state = state.with_identity(IdentityRpc::new(Arc::new(transport)));
    }
    let state = Arc::new(state);
    let app = crate::api::app(state.clone())?;
    Ok(TestApp {
        app,
        state,
        store,
        outbox,
    })
}

struct Credentials {
    client_id: String,
    csrf: String,
}

fn request(
    method: Method,
    uri: &str,
    session: Option<&Credentials>,
    body: Option<Value>,
) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(USER_AGENT, CHROME)
        .header("x-forwarded-for", "203.0.113.5");
    if let Some(session) = session {
        builder = builder
            .header(AUTHORIZATION, format!("Bearer {}", session.client_id))
            .header("x-csrf-token", session.csrf.as_str());
    }
    Ok(match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))?,
        None => builder.body(Body::empty())?,
    })
}

async fn send(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

fn credentials(body: &Value) -> Result<Credentials> {
    let field = |name: &str| {
        body[name]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("missing {name} in {body}"))
    };
    Ok(Credentials {
        client_id: field("clientId")?,
        csrf: field("csrf")?,
    })
}

async fn register(app: &Router, username: &str) -> Result<Credentials> {
    let (status, body) = send(
        app,
        request(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({
                "username": username,
                "email": format!("{username}@example.com"),
                "password": PASSWORD,
            })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    credentials(&body)
}

fn authenticator(secret: Vec<u8>) -> Result<TOTP> {
    TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, None, "user".to_string())
        .map_err(|e| anyhow!("{e}"))
}

fn current_code(secret_base32: &str) -> Result<String> {
    let secret = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| anyhow!("{e}"))?;
    Ok(authenticator(secret)?.generate_current()?)
}

/// The code of the next time step, still inside the accepted skew.
fn next_code(totp: &TOTP) -> Result<String> {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?;
    Ok(totp.generate(now.as_secs() + totp.step))
}

async fn password_login(
    app: &Router,
    username: &str,
    password: &str,
) -> Result<(StatusCode, Value)> {
    send(
        app,
        request(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({"emailOrUsername": username, "password": password})),
        )?,
    )
    .await
}

async fn mfa_ticket(app: &Router, username: &str) -> Result<String> {
    let (status, body) = password_login(app, username, PASSWORD).await?;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    body["mfaTicket"]
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("missing mfaTicket in {body}"))
}

async fn totp_login(app: &Router, ticket: &str, code: &str) -> Result<(StatusCode, Value)> {
    send(
        app,
        request(
            Method::POST,
            "/auth/two-fa/totp/login",
            None,
            Some(json!({"mfaTicket": ticket, "code": code})),
        )?,
    )
    .await
}

async fn user_id(store: &MemoryStore, username: &str) -> Result<Uuid> {
    store
        .find_by_email_or_username(username)
        .await?
        .map(|user| user.id)
        .ok_or_else(|| anyhow!("{username} not found"))
}

#[tokio::test]
async fn totp_wrong_code_discards_registration() -> Result<()> {
    let test = test_app(AuthConfig::new(), None)?;
    let session = register(&test.app, "alice").await?;
    let alice = user_id(&test.store, "alice").await?;

    let (status, enrollment) = send(
        &test.app,
        request(Method::POST, "/auth/two-fa/totp/register", Some(&session), None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(test.state.totp().pending_for(alice).await, 1);

    let secret = enrollment["secret"].as_str().unwrap_or_default();
    let code = current_code(secret)?;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let (status, _) = send(
        &test.app,
        request(
            Method::POST,
            "/auth/two-fa/totp/verify",
            Some(&session),
            Some(json!({
                "registrationId": enrollment["registrationId"],
                "code": wrong,
            })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(test.state.totp().pending_for(alice).await, 0);
    assert!(test.store.totp_secret(alice).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn totp_enrollment_changes_how_the_user_signs_in() -> Result<()> {
    let test = test_app(AuthConfig::new(), None)?;
    let session = register(&test.app, "bob").await?;

    let (_, enrollment) = send(
        &test.app,
        request(Method::POST, "/auth/two-fa/totp/register", Some(&session), None)?,
    )
    .await?;
    let secret = enrollment["secret"].as_str().unwrap_or_default().to_string();

    let (status, body) = send(
        &test.app,
        request(
            Method::POST,
            "/auth/two-fa/totp/verify",
            Some(&session),
            Some(json!({
                "registrationId": enrollment["registrationId"],
                "code": current_code(&secret)?,
            })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["twoFaMethod"], "app");

    let (status, body) = send(
        &test.app,
        request(Method::GET, "/auth/two-fa/status/bob", None, None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["twoFaMethod"], "app");

    // Password alone is no longer enough.
    let (status, body) = password_login(&test.app, "bob", PASSWORD).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["twoFaMethod"], "app");
    assert!(body.get("clientId").is_none());
    let ticket = body["mfaTicket"].as_str().unwrap_or_default().to_string();

    // The confirmation code claimed the current step.
    let totp = authenticator(
        Secret::Encoded(secret.clone())
            .to_bytes()
            .map_err(|e| anyhow!("{e}"))?,
    )?;
    let (status, body) = totp_login(&test.app, &ticket, &next_code(&totp)?).await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    let session = credentials(&body)?;

    // The ticket is spent.
    let (status, _) = totp_login(&test.app, &ticket, &next_code(&totp)?).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Signing in with a second factor saves the account on this device.
    let (status, body) = send(
        &test.app,
        request(Method::GET, "/auth/saved-accounts", None, None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["username"], "bob");
    assert_eq!(body[0]["twoFaMethod"], "app");

    let (status, body) = send(
        &test.app,
        request(Method::DELETE, "/auth/two-fa/totp", Some(&session), None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["twoFaMethod"], Value::Null);

    let (status, _) = send(
        &test.app,
        request(Method::GET, "/auth/two-fa/status/bob", None, None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

async fn enable_totp(test: &TestApp, username: &str, secret: &[u8]) -> Result<Uuid> {
    register(&test.app, username).await?;
    let user = user_id(&test.store, username).await?;
    test.store.save_totp_secret(user, secret).await?;
    test.store
        .set_two_fa_method(user, Some(TwoFaMethod::App))
        .await?;
    Ok(user)
}

#[tokio::test]
async fn totp_login_needs_the_password_first() -> Result<()> {
    let test = test_app(AuthConfig::new(), None)?;
    enable_totp(&test, "carol", &[42; 20]).await?;
    let code = authenticator(vec![42; 20])?.generate_current()?;

    let (status, _) = totp_login(&test.app, "carol", &code).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = password_login(&test.app, "carol", "wrong password").await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.get("mfaTicket").is_none());

    let ticket = mfa_ticket(&test.app, "carol").await?;
    let (status, body) = totp_login(&test.app, &ticket, &code).await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["username"], "carol");
    Ok(())
}

#[tokio::test]
async fn totp_login_limits_wrong_codes() -> Result<()> {
    let test = test_app(AuthConfig::new(), None)?;
    let carol = enable_totp(&test, "carol", &[42; 20]).await?;
    let code = authenticator(vec![42; 20])?.generate_current()?;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let ticket = mfa_ticket(&test.app, "carol").await?;
    for _ in 0..crate::mfa::MAX_FAILED_ATTEMPTS {
        let (status, _) = totp_login(&test.app, &ticket, wrong).await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
    assert_eq!(test.state.tickets().pending_for(carol).await, 0);

    // Even the right code is refused on a spent ticket.
    let (status, body) = totp_login(&test.app, &ticket, &code).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "invalid or expired sign-in ticket");

    let ticket = mfa_ticket(&test.app, "carol").await?;
    let (status, _) = totp_login(&test.app, &ticket, &code).await?;
    assert_eq!(status, StatusCode::OK);

    // A used code stays used, even with a fresh ticket.
    let ticket = mfa_ticket(&test.app, "carol").await?;
    let (status, body) = totp_login(&test.app, &ticket, &code).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "code already used");
    Ok(())
}

#[tokio::test]
async fn saved_account_can_be_forgotten() -> Result<()> {
    let test = test_app(AuthConfig::new(), None)?;
    let session = register(&test.app, "dave").await?;
    let dave = user_id(&test.store, "dave").await?;
    let device_id = test
        .store
        .find_by_correlation_id(Uuid::parse_str(&session.client_id)?)
        .await?
        .map(|session| session.device_id)
        .ok_or_else(|| anyhow!("session missing"))?;
    test.store.link_saved_account(&device_id, dave).await?;

    let (status, _) = send(
        &test.app,
        request(Method::DELETE, "/auth/saved-accounts/dave", None, None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &test.app,
        request(Method::DELETE, "/auth/saved-accounts/dave", None, None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
    Ok(())
}

#[tokio::test]
async fn webauthn_login_needs_ticket_and_credential() -> Result<()> {
    let test = test_app(AuthConfig::new(), None)?;
    register(&test.app, "erin").await?;
    let erin = user_id(&test.store, "erin").await?;
    test.store
        .set_two_fa_method(erin, Some(TwoFaMethod::Passkey))
        .await?;

    let options = |ticket: &str| {
        request(
            Method::POST,
            "/auth/two-fa/webauthn/login/options",
            None,
            Some(json!({"mfaTicket": ticket})),
        )
    };

    let (status, _) = send(&test.app, options("erin")?).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = password_login(&test.app, "erin", PASSWORD).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["twoFaMethod"], "passkey");
    let ticket = body["mfaTicket"].as_str().unwrap_or_default().to_string();

    let (status, body) = send(&test.app, options(&ticket)?).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "no passkey registered on this device");
    // asking for options does not spend the ticket
    assert_eq!(test.state.tickets().pending_for(erin).await, 1);
    Ok(())
}

#[tokio::test]
async fn webauthn_registration_options_need_a_session() -> Result<()> {
    let test = test_app(AuthConfig::new(), None)?;
    let session = register(&test.app, "frank").await?;
    let frank = user_id(&test.store, "frank").await?;

    let (status, _) = send(
        &test.app,
        request(Method::POST, "/auth/two-fa/webauthn/register/options", None, None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &test.app,
        request(
            Method::POST,
            "/auth/two-fa/webauthn/register/options",
            Some(&session),
            None,
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body["options"]["publicKey"]["challenge"].is_string());
    assert_eq!(test.state.webauthn().pending_registrations_for(frank).await, 1);

    let (status, _) = send(
        &test.app,
        request(
            Method::POST,
            "/auth/two-fa/webauthn/register/verify",
            Some(&session),
            Some(json!({"response": {"id": "bogus"}})),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn oauth_creates_a_verified_account_once() -> Result<()> {
    let transport = LoopbackTransport::replying(|routing_key, _payload| {
        (routing_key == "oauth.google.key").then(|| {
            br#"{"email":"Grace@Example.com","given_name":"Grace","picture":"https://img/g.png"}"#
                .to_vec()
        })
    });
    let test = test_app(AuthConfig::new(), Some(transport.clone()))?;

    let mut usernames = Vec::new();
    for _ in 0..2 {
        let (status, body) = send(
            &test.app,
            request(
                Method::POST,
                "/auth/oauth/google",
                None,
                Some(json!({"code": "4/0Ab"})),
            )?,
        )
        .await?;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["email"], "grace@example.com");
        assert_eq!(body["isVerified"], true);
        usernames.push(body["username"].as_str().unwrap_or_default().to_string());
    }

    assert_eq!(usernames[0], usernames[1]);
    assert!(usernames[0].starts_with("Grace"));
    assert_eq!(transport.requests(), vec!["oauth.google.key"; 2]);
    assert_eq!(transport.closed_channels(), 2);
    Ok(())
}

#[tokio::test]
async fn oauth_timeout_and_bad_input() -> Result<()> {
    let transport = LoopbackTransport::replying(|_, _| None);
    let config = AuthConfig::new().with_github_timeout_seconds(1);
    let test = test_app(config, Some(transport.clone()))?;

    let (status, body) = send(
        &test.app,
        request(
            Method::POST,
            "/auth/oauth/github",
            None,
            Some(json!({"code": "abc"})),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["code"], "deadline_exceeded");
    assert_eq!(transport.closed_channels(), 1);

    let (status, _) = send(
        &test.app,
        request(
            Method::POST,
            "/auth/oauth/facebook",
            None,
            Some(json!({"code": "abc"})),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &test.app,
        request(
            Method::POST,
            "/auth/oauth/google",
            None,
            Some(json!({"code": "  "})),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn oauth_without_identity_service() -> Result<()> {
    let test = test_app(AuthConfig::new(), None)?;
    let (status, body) = send(
        &test.app,
        request(
            Method::POST,
            "/auth/oauth/google",
            None,
            Some(json!({"code": "abc"})),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "Internal server error");
    Ok(())
}

/// Path and query of the link in the last email sent to `to`.
async fn emailed_link(outbox: &Outbox, to: &str) -> Result<String> {
    let sent = outbox.0.lock().await;
    let (_, _, html) = sent
        .iter()
        .rev()
        .find(|(recipient, _, _)| recipient == to)
        .ok_or_else(|| anyhow!("no email sent to {to}"))?;
    let href = html
        .split("href=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .ok_or_else(|| anyhow!("no link in {html}"))?
        .replace("&amp;", "&");
    let url = url::Url::parse(&href)?;
    Ok(format!("{}?{}", url.path(), url.query().unwrap_or_default()))
}

async fn follow(app: &Router, uri: &str) -> Result<(StatusCode, String)> {
    let response = app
        .clone()
        .oneshot(request(Method::GET, uri, None, None)?)
        .await?;
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Ok((response.status(), location))
}

#[tokio::test]
async fn registration_link_verifies_the_email_once() -> Result<()> {
    let test = test_app(
        AuthConfig::new().with_client_url("https://blog.example.com".into()),
        None,
    )?;
    register(&test.app, "dave").await?;
    let dave = user_id(&test.store, "dave").await?;

    let link = emailed_link(&test.outbox, "dave@example.com").await?;
    assert!(link.starts_with("/auth/verify-email?username=dave&subject=verify-email&code="));

    let (status, location) = follow(&test.app, &link).await?;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(
        location,
        "https://blog.example.com/auth/email/status/dave?request=verify-email&verified=true"
    );
    assert!(test.store.find_by_id(dave).await?.is_some_and(|user| user.verified));

    let (status, location) = follow(&test.app, &link).await?;
    assert_eq!(status, StatusCode::FOUND);
    assert!(location.ends_with("verified=false&message=request-not-found"));

    let (status, body) = password_login(&test.app, "dave", PASSWORD).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isVerified"], true);
    Ok(())
}

#[tokio::test]
async fn verification_link_must_match_the_account() -> Result<()> {
    let test = test_app(AuthConfig::new(), None)?;
    register(&test.app, "dave").await?;
    register(&test.app, "mallory").await?;
    let link = emailed_link(&test.outbox, "mallory@example.com").await?;

    // mallory's code does not verify dave
    let stolen = link.replace("username=mallory", "username=dave");
    let (_, location) = follow(&test.app, &stolen).await?;
    assert!(location.contains("/auth/email/status/dave?"));
    assert!(location.ends_with("verified=false&message=request-not-found"));

    let wrong_subject = link.replace("subject=verify-email", "subject=reset-password");
    let (_, location) = follow(&test.app, &wrong_subject).await?;
    assert!(location.ends_with("verified=false&message=invalid-request"));

    let (status, location) = follow(
        &test.app,
        "/auth/verify-email?username=ghost&subject=verify-email&code=x",
    )
    .await?;
    assert_eq!(status, StatusCode::FOUND);
    assert!(location.ends_with("verified=false&message=request-not-found"));

    let mallory = user_id(&test.store, "mallory").await?;
    assert!(test.store.find_by_id(mallory).await?.is_some_and(|user| !user.verified));
    Ok(())
}
