use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_ACCESS_TOKEN_SECRET: &str = "access-token-secret";
pub const ARG_REFRESH_TOKEN_SECRET: &str = "refresh-token-secret";
pub const ARG_ACCESS_TOKEN_TTL_SECONDS: &str = "access-token-ttl-seconds";
pub const ARG_REFRESH_TOKEN_TTL_SECONDS: &str = "refresh-token-ttl-seconds";
pub const ARG_REFRESH_GRACE_SECONDS: &str = "refresh-grace-seconds";
pub const ARG_REVOKE_ON_EXPIRED_REFRESH: &str = "revoke-on-expired-refresh";
pub const ARG_SESSION_RETENTION_SECONDS: &str = "session-retention-seconds";
pub const ARG_SWEEP_INTERVAL_SECONDS: &str = "sweep-interval-seconds";
pub const ARG_FINGERPRINT_SECRET: &str = "fingerprint-secret";
pub const ARG_FINGERPRINT_DIVIDER: &str = "fingerprint-divider";

#[derive(Debug, Clone)]
pub struct Options {
    pub access_token_secret: SecretString,
    pub refresh_token_secret: SecretString,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub refresh_grace_seconds: i64,
    pub revoke_on_expired_refresh: bool,
    pub session_retention_seconds: i64,
    pub sweep_interval_seconds: u64,
    pub fingerprint_secret: SecretString,
    pub fingerprint_divider: String,
}

impl Options {
    /// Parse token and session arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a required secret is missing or empty.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let read_secret = |id: &str| -> Result<SecretString> {
            matches
                .get_one::<String>(id)
                .filter(|v| !v.trim().is_empty())
                .map(|v| SecretString::from(v.clone()))
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };

        Ok(Self {
            access_token_secret: read_secret(ARG_ACCESS_TOKEN_SECRET)?,
            refresh_token_secret: read_secret(ARG_REFRESH_TOKEN_SECRET)?,
            access_token_ttl_seconds: matches
                .get_one::<i64>(ARG_ACCESS_TOKEN_TTL_SECONDS)
                .copied()
                .unwrap_or(900),
            refresh_token_ttl_seconds: matches
                .get_one::<i64>(ARG_REFRESH_TOKEN_TTL_SECONDS)
                .copied()
                .unwrap_or(604_800),
            refresh_grace_seconds: matches
                .get_one::<i64>(ARG_REFRESH_GRACE_SECONDS)
                .copied()
                .unwrap_or(60),
            revoke_on_expired_refresh: matches.get_flag(ARG_REVOKE_ON_EXPIRED_REFRESH),
            session_retention_seconds: matches
                .get_one::<i64>(ARG_SESSION_RETENTION_SECONDS)
                .copied()
                .unwrap_or(604_800),
            sweep_interval_seconds: matches
                .get_one::<u64>(ARG_SWEEP_INTERVAL_SECONDS)
                .copied()
                .unwrap_or(3600),
            fingerprint_secret: read_secret(ARG_FINGERPRINT_SECRET)?,
            fingerprint_divider: matches
                .get_one::<String>(ARG_FINGERPRINT_DIVIDER)
                .cloned()
                .unwrap_or_else(|| ".".to_string()),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    let command = with_session_args(command);
    with_fingerprint_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_SECRET)
                .long(ARG_ACCESS_TOKEN_SECRET)
                .help("Secret used to sign access tokens")
                .env("QUILLGATE_ACCESS_TOKEN_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_SECRET)
                .long(ARG_REFRESH_TOKEN_SECRET)
                .help("Secret used to sign refresh tokens")
                .env("QUILLGATE_REFRESH_TOKEN_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL_SECONDS)
                .long(ARG_ACCESS_TOKEN_TTL_SECONDS)
                .help("Access token TTL in seconds")
                .env("QUILLGATE_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL_SECONDS)
                .long(ARG_REFRESH_TOKEN_TTL_SECONDS)
                .help("Refresh token TTL in seconds")
                .env("QUILLGATE_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_REFRESH_GRACE_SECONDS)
                .long(ARG_REFRESH_GRACE_SECONDS)
                .help("How long a rotated session stays around to detect replays")
                .env("QUILLGATE_REFRESH_GRACE_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_REVOKE_ON_EXPIRED_REFRESH)
                .long(ARG_REVOKE_ON_EXPIRED_REFRESH)
                .help("Revoke every session of a user that presents an expired refresh token")
                .env("QUILLGATE_REVOKE_ON_EXPIRED_REFRESH")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_SESSION_RETENTION_SECONDS)
                .long(ARG_SESSION_RETENTION_SECONDS)
                .help("Keep expired sessions and saved-account links this long")
                .env("QUILLGATE_SESSION_RETENTION_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_SWEEP_INTERVAL_SECONDS)
                .long(ARG_SWEEP_INTERVAL_SECONDS)
                .help("Interval between cleanup passes in seconds")
                .env("QUILLGATE_SWEEP_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_fingerprint_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FINGERPRINT_SECRET)
                .long(ARG_FINGERPRINT_SECRET)
                .help("Secret used to sign device fingerprints")
                .env("QUILLGATE_FINGERPRINT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_FINGERPRINT_DIVIDER)
                .long(ARG_FINGERPRINT_DIVIDER)
                .help("Separator between fingerprint signature and payload")
                .env("QUILLGATE_FINGERPRINT_DIVIDER")
                .default_value("."),
        )
}
