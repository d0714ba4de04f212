//! Command-line argument dispatch.
//!
//! Maps validated CLI arguments to the action to run, such as starting the API
//! server with its full configuration.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{
    ARG_CLIENT_URL, ARG_DSN, ARG_MEMORY_STORE, ARG_PORT, ARG_PUBLIC_URL, auth, identity, mfa,
};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let memory_store = matches.get_flag(ARG_MEMORY_STORE);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .filter(|dsn| !dsn.trim().is_empty());
    if dsn.is_none() && !memory_store {
        anyhow::bail!("missing required argument: --{ARG_DSN}");
    }
    let url = |id: &str| {
        matches
            .get_one::<String>(id)
            .cloned()
            .filter(|url| !url.trim().is_empty())
    };

    Ok(Action::Server(Args {
        port,
        dsn,
        public_url: url(ARG_PUBLIC_URL).unwrap_or_else(|| "http://localhost:8080".to_string()),
        client_url: url(ARG_CLIENT_URL),
        auth: auth::Options::parse(matches)?,
        mfa: mfa::Options::parse(matches),
        identity: identity::Options::parse(matches),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn memory_store_needs_no_dsn() -> Result<()> {
        temp_env::with_vars(
            [
                ("QUILLGATE_DSN", None::<&str>),
                ("QUILLGATE_MEMORY_STORE", Some("true")),
                ("QUILLGATE_ACCESS_TOKEN_SECRET", Some("access")),
                ("QUILLGATE_REFRESH_TOKEN_SECRET", Some("refresh")),
                ("QUILLGATE_FINGERPRINT_SECRET", Some("fingerprint")),
                ("QUILLGATE_AMQP_URL", None::<&str>),
                ("QUILLGATE_PUBLIC_URL", Some("https://auth.quillgate.dev")),
                ("QUILLGATE_CLIENT_URL", Some(" ")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["quillgate"]);
                let Action::Server(args) = handler(&matches)?;
                assert!(args.dsn.is_none());
                assert_eq!(args.public_url, "https://auth.quillgate.dev");
                assert!(args.client_url.is_none());
                assert_eq!(args.auth.access_token_secret.expose_secret(), "access");
                assert!(args.identity.amqp_url.is_none());
                Ok(())
            },
        )
    }

    #[test]
    fn empty_secret_is_rejected() {
        temp_env::with_vars(
            [
                ("QUILLGATE_MEMORY_STORE", Some("true")),
                ("QUILLGATE_ACCESS_TOKEN_SECRET", Some(" ")),
                ("QUILLGATE_REFRESH_TOKEN_SECRET", Some("refresh")),
                ("QUILLGATE_FINGERPRINT_SECRET", Some("fingerprint")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["quillgate"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(
                        err.to_string()
                            .contains("missing required argument: --access-token-secret")
                    );
                }
            },
        );
    }
}
