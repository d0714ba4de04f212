//! Auth state and configuration shared by every handler.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use url::Url;

use crate::{
    email::{EmailSender, LogEmailSender},
    fingerprint::{DEFAULT_DIVIDER, FingerprintEncoder},
    identity::{DEFAULT_GITHUB_TIMEOUT_SECONDS, DEFAULT_GOOGLE_TIMEOUT_SECONDS, IdentityRpc},
    mfa::{
        DEFAULT_CHALLENGE_TTL_SECONDS, MfaTickets, TotpGate, WebauthnGate,
        totp::DEFAULT_TOTP_ISSUER, webauthn::DEFAULT_RP_NAME,
    },
    refresh::{DEFAULT_GRACE_SECONDS, ExpiryPolicy, RefreshPolicy},
    session::{SessionStore, sweeper::SweepConfig},
    token::{
        TokenIssuer,
        jwt::{DEFAULT_ACCESS_TTL_SECONDS, DEFAULT_REFRESH_TTL_SECONDS},
    },
    users::{CredentialStore, UserStore},
};

const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60 * 60;
const DEFAULT_SESSION_RETENTION_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_RP_ORIGIN: &str = "http://localhost:8080";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    refresh_grace_seconds: i64,
    revoke_on_expired_refresh: bool,
    session_retention_seconds: i64,
    sweep_interval_seconds: u64,
    fingerprint_divider: String,
    webauthn_rp_id: String,
    webauthn_rp_origin: String,
    webauthn_rp_name: String,
    totp_issuer: String,
    challenge_ttl_seconds: u64,
    google_timeout_seconds: u64,
    github_timeout_seconds: u64,
    public_url: String,
    client_url: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            refresh_grace_seconds: DEFAULT_GRACE_SECONDS,
            revoke_on_expired_refresh: false,
            session_retention_seconds: DEFAULT_SESSION_RETENTION_SECONDS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
            fingerprint_divider: DEFAULT_DIVIDER.to_string(),
            webauthn_rp_id: "localhost".to_string(),
            webauthn_rp_origin: DEFAULT_RP_ORIGIN.to_string(),
            webauthn_rp_name: DEFAULT_RP_NAME.to_string(),
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
            challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
            google_timeout_seconds: DEFAULT_GOOGLE_TIMEOUT_SECONDS,
            github_timeout_seconds: DEFAULT_GITHUB_TIMEOUT_SECONDS,
            public_url: DEFAULT_RP_ORIGIN.to_string(),
            client_url: None,
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_grace_seconds(mut self, seconds: i64) -> Self {
        self.refresh_grace_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_revoke_on_expired_refresh(mut self, revoke: bool) -> Self {
        self.revoke_on_expired_refresh = revoke;
        self
    }

    #[must_use]
    pub fn with_session_retention_seconds(mut self, seconds: i64) -> Self {
        self.session_retention_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.sweep_interval_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_fingerprint_divider(mut self, divider: String) -> Self {
        self.fingerprint_divider = divider;
        self
    }

    /// Set the relying party origin. The RP id follows the origin's host unless
    /// set explicitly afterwards.
    #[must_use]
    pub fn with_webauthn_rp_origin(mut self, rp_origin: String) -> Self {
        if let Some(host) = Url::parse(&rp_origin)
            .ok()
            .and_then(|url| url.host_str().map(ToString::to_string))
        {
            self.webauthn_rp_id = host;
        }
        self.webauthn_rp_origin = rp_origin.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_webauthn_rp_id(mut self, rp_id: String) -> Self {
        self.webauthn_rp_id = rp_id;
        self
    }

    #[must_use]
    pub fn with_webauthn_rp_name(mut self, rp_name: String) -> Self {
        self.webauthn_rp_name = rp_name;
        self
    }

    #[must_use]
    pub fn with_totp_issuer(mut self, issuer: String) -> Self {
        self.totp_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_challenge_ttl_seconds(mut self, seconds: u64) -> Self {
        self.challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_google_timeout_seconds(mut self, seconds: u64) -> Self {
        self.google_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_github_timeout_seconds(mut self, seconds: u64) -> Self {
        self.github_timeout_seconds = seconds;
        self
    }

    /// Base URL of this service, used for links sent by email.
    #[must_use]
    pub fn with_public_url(mut self, public_url: String) -> Self {
        self.public_url = public_url.trim_end_matches('/').to_string();
        self
    }

    /// Frontend URL for browser redirects. Defaults to the relying party origin.
    #[must_use]
    pub fn with_client_url(mut self, client_url: String) -> Self {
        self.client_url = Some(client_url.trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    #[must_use]
    pub fn client_url(&self) -> &str {
        self.client_url.as_deref().unwrap_or(&self.webauthn_rp_origin)
    }

    #[must_use]
    pub fn webauthn_rp_id(&self) -> &str {
        &self.webauthn_rp_id
    }

    #[must_use]
    pub fn webauthn_rp_origin(&self) -> &str {
        &self.webauthn_rp_origin
    }

    #[must_use]
    pub fn webauthn_rp_name(&self) -> &str {
        &self.webauthn_rp_name
    }

    #[must_use]
    pub fn refresh_policy(&self) -> RefreshPolicy {
        let expiry = if self.revoke_on_expired_refresh {
            ExpiryPolicy::RevokeAll
        } else {
            ExpiryPolicy::Reject
        };
        RefreshPolicy::new()
            .with_grace_seconds(self.refresh_grace_seconds)
            .with_expiry(expiry)
    }

    #[must_use]
    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig::new()
            .with_interval_seconds(self.sweep_interval_seconds)
            .with_retention_seconds(self.session_retention_seconds)
    }

    pub(crate) fn identity_timeouts(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.google_timeout_seconds),
            Duration::from_secs(self.github_timeout_seconds),
        )
    }

    #[must_use]
    pub const fn challenge_ttl_seconds(&self) -> u64 {
        self.challenge_ttl_seconds
    }

    fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_seconds)
    }
}

/// Server-side secrets. Never logged.
#[derive(Clone)]
pub struct AuthSecrets {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub fingerprint: SecretString,
}

/// Storage behind the handlers. One backend usually implements all three.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub users: Arc<dyn UserStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Stores {
    pub fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: SessionStore + UserStore + CredentialStore + 'static,
    {
        Self {
            sessions: backend.clone(),
            users: backend.clone(),
            credentials: backend,
        }
    }
}

pub struct AuthState {
    config: AuthConfig,
    stores: Stores,
    tokens: TokenIssuer,
    encoder: FingerprintEncoder,
    tickets: MfaTickets,
    totp: TotpGate,
    webauthn: WebauthnGate,
    identity: Option<IdentityRpc>,
    email: Arc<dyn EmailSender>,
}

impl AuthState {
    /// Assemble the state from configuration.
    ///
    /// # Errors
    /// Returns an error if the WebAuthn relying party cannot be built.
    pub fn new(config: AuthConfig, secrets: AuthSecrets, stores: Stores) -> Result<Self> {
        let tokens = TokenIssuer::new(secrets.access_token, secrets.refresh_token)
            .with_access_ttl_seconds(config.access_ttl_seconds)
            .with_refresh_ttl_seconds(config.refresh_ttl_seconds);
        let encoder = FingerprintEncoder::new(secrets.fingerprint)
            .with_divider(config.fingerprint_divider.clone());
        let tickets = MfaTickets::new(config.challenge_ttl());
        let totp = TotpGate::new(config.totp_issuer.clone(), config.challenge_ttl());
        let webauthn = WebauthnGate::new(
            config.webauthn_rp_id(),
            config.webauthn_rp_origin(),
            config.webauthn_rp_name(),
            config.challenge_ttl(),
        )
        .context("failed to configure WebAuthn relying party")?;

        Ok(Self {
            config,
            stores,
            tokens,
            encoder,
            tickets,
            totp,
            webauthn,
            identity: None,
            email: Arc::new(LogEmailSender),
        })
    }

    #[must_use]
    pub fn with_identity(mut self, identity: IdentityRpc) -> Self {
        let (google, github) = self.config.identity_timeouts();
        self.identity = Some(
            identity
                .with_google_timeout(google)
                .with_github_timeout(github),
        );
        self
    }

    /// Whether an identity service is wired in for OAuth sign-in.
    #[must_use]
    pub const fn oauth_enabled(&self) -> bool {
        self.identity.is_some()
    }

    #[must_use]
    pub fn with_email_sender(mut self, email: Arc<dyn EmailSender>) -> Self {
        self.email = email;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn sessions(&self) -> &dyn SessionStore {
        self.stores.sessions.as_ref()
    }

    pub fn users(&self) -> &dyn UserStore {
        self.stores.users.as_ref()
    }

    pub fn credentials(&self) -> &dyn CredentialStore {
        self.stores.credentials.as_ref()
    }

    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub(crate) fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub(crate) fn encoder(&self) -> &FingerprintEncoder {
        &self.encoder
    }

    pub(crate) fn tickets(&self) -> &MfaTickets {
        &self.tickets
    }

    pub(crate) fn totp(&self) -> &TotpGate {
        &self.totp
    }

    pub(crate) fn webauthn(&self) -> &WebauthnGate {
        &self.webauthn
    }

    pub(crate) fn identity(&self) -> Option<&IdentityRpc> {
        self.identity.as_ref()
    }

    pub(crate) fn email(&self) -> &dyn EmailSender {
        self.email.as_ref()
    }
}
