use crate::{
    api::{
        self,
        handlers::auth::{AuthConfig, AuthSecrets, AuthState, Stores},
    },
    cli::commands::{auth, identity, mfa},
    identity::{IdentityRpc, amqp::AmqpTransport},
    store::{memory::MemoryStore, postgres::PgStore},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub public_url: String,
    pub client_url: Option<String>,
    pub auth: auth::Options,
    pub mfa: mfa::Options,
    pub identity: identity::Options,
}

impl Args {
    fn auth_config(&self) -> AuthConfig {
        let config = AuthConfig::new()
            .with_access_ttl_seconds(self.auth.access_token_ttl_seconds)
            .with_refresh_ttl_seconds(self.auth.refresh_token_ttl_seconds)
            .with_refresh_grace_seconds(self.auth.refresh_grace_seconds)
            .with_revoke_on_expired_refresh(self.auth.revoke_on_expired_refresh)
            .with_session_retention_seconds(self.auth.session_retention_seconds)
            .with_sweep_interval_seconds(self.auth.sweep_interval_seconds)
            .with_fingerprint_divider(self.auth.fingerprint_divider.clone())
            .with_webauthn_rp_origin(self.mfa.rp_origin.clone())
            .with_webauthn_rp_name(self.mfa.rp_name.clone())
            .with_totp_issuer(self.mfa.totp_issuer.clone())
            .with_challenge_ttl_seconds(self.mfa.challenge_ttl_seconds)
            .with_google_timeout_seconds(self.identity.google_timeout_seconds)
            .with_github_timeout_seconds(self.identity.github_timeout_seconds)
            .with_public_url(self.public_url.clone());

        let config = match &self.client_url {
            Some(client_url) => config.with_client_url(client_url.clone()),
            None => config,
        };
        match &self.mfa.rp_id {
            Some(rp_id) => config.with_webauthn_rp_id(rp_id.clone()),
            None => config,
        }
    }

    fn secrets(&self) -> AuthSecrets {
        AuthSecrets {
            access_token: self.auth.access_token_secret.clone(),
            refresh_token: self.auth.refresh_token_secret.clone(),
            fingerprint: self.auth.fingerprint_secret.clone(),
        }
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the store or broker is unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    debug!("Server args: {:?}", args);

    let stores = if let Some(dsn) = &args.dsn {
        Stores::from_backend(Arc::new(PgStore::connect(dsn).await?))
    } else {
        warn!("using the in-memory store; all data is lost on restart");
        Stores::from_backend(Arc::new(MemoryStore::new()))
    };

    let mut state = AuthState::new(args.auth_config(), args.secrets(), stores)?;

    if let Some(url) = &args.identity.amqp_url {
        let transport = AmqpTransport::connect(url, &args.identity.exchange)
            .await
            .context("Could not connect to the identity service")?;
        state = state.with_identity(IdentityRpc::new(Arc::new(transport)));
        info!(exchange = %args.identity.exchange, "identity RPC enabled");
    } else {
        warn!("no AMQP URL configured; OAuth sign-in is disabled");
    }

    api::new(args.port, Arc::new(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn args(rp_id: Option<&str>) -> Args {
        Args {
            port: 8080,
            dsn: None,
            public_url: "https://auth.quillgate.dev".to_string(),
            client_url: None,
            auth: auth::Options {
                access_token_secret: SecretString::from("access"),
                refresh_token_secret: SecretString::from("refresh"),
                access_token_ttl_seconds: 60,
                refresh_token_ttl_seconds: 600,
                refresh_grace_seconds: 5,
                revoke_on_expired_refresh: true,
                session_retention_seconds: 3600,
                sweep_interval_seconds: 60,
                fingerprint_secret: SecretString::from("fingerprint"),
                fingerprint_divider: ".".to_string(),
            },
            mfa: mfa::Options {
                rp_id: rp_id.map(ToString::to_string),
                rp_origin: "https://blog.quillgate.dev".to_string(),
                rp_name: "Quillgate".to_string(),
                totp_issuer: "Quillgate".to_string(),
                challenge_ttl_seconds: 300,
            },
            identity: identity::Options {
                amqp_url: None,
                exchange: "rpc-exchange".to_string(),
                google_timeout_seconds: 5,
                github_timeout_seconds: 10,
            },
        }
    }

    #[test]
    fn rp_id_defaults_to_origin_host() {
        let config = args(None).auth_config();
        assert_eq!(config.webauthn_rp_id(), "blog.quillgate.dev");

        let config = args(Some("quillgate.dev")).auth_config();
        assert_eq!(config.webauthn_rp_id(), "quillgate.dev");
    }

    #[test]
    fn client_url_defaults_to_origin() {
        let config = args(None).auth_config();
        assert_eq!(config.public_url(), "https://auth.quillgate.dev");
        assert_eq!(config.client_url(), "https://blog.quillgate.dev");

        let mut custom = args(None);
        custom.client_url = Some("https://app.quillgate.dev/".to_string());
        assert_eq!(custom.auth_config().client_url(), "https://app.quillgate.dev");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let rendered = format!("{:?}", args(None));
        assert!(!rendered.contains("\"access\""));
        assert!(!rendered.contains("fingerprint_secret: \"fingerprint\""));
    }
}
