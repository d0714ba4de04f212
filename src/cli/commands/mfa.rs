use clap::{Arg, ArgMatches, Command};

pub const ARG_WEBAUTHN_RP_ID: &str = "webauthn-rp-id";
pub const ARG_WEBAUTHN_RP_ORIGIN: &str = "webauthn-rp-origin";
pub const ARG_WEBAUTHN_RP_NAME: &str = "webauthn-rp-name";
pub const ARG_TOTP_ISSUER: &str = "totp-issuer";
pub const ARG_MFA_CHALLENGE_TTL_SECONDS: &str = "mfa-challenge-ttl-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub rp_id: Option<String>,
    pub rp_origin: String,
    pub rp_name: String,
    pub totp_issuer: String,
    pub challenge_ttl_seconds: u64,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let get_string = |id: &str, default: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            rp_id: matches
                .get_one::<String>(ARG_WEBAUTHN_RP_ID)
                .cloned()
                .filter(|v| !v.trim().is_empty()),
            rp_origin: get_string(ARG_WEBAUTHN_RP_ORIGIN, "http://localhost:8080"),
            rp_name: get_string(ARG_WEBAUTHN_RP_NAME, "Quillgate"),
            totp_issuer: get_string(ARG_TOTP_ISSUER, "Quillgate"),
            challenge_ttl_seconds: matches
                .get_one::<u64>(ARG_MFA_CHALLENGE_TTL_SECONDS)
                .copied()
                .unwrap_or(300),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_WEBAUTHN_RP_ID)
                .long(ARG_WEBAUTHN_RP_ID)
                .help("WebAuthn relying party id (defaults to the origin host)")
                .env("QUILLGATE_WEBAUTHN_RP_ID"),
        )
        .arg(
            Arg::new(ARG_WEBAUTHN_RP_ORIGIN)
                .long(ARG_WEBAUTHN_RP_ORIGIN)
                .help("Origin the frontend is served from")
                .env("QUILLGATE_WEBAUTHN_RP_ORIGIN")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_WEBAUTHN_RP_NAME)
                .long(ARG_WEBAUTHN_RP_NAME)
                .help("Relying party name shown by authenticators")
                .env("QUILLGATE_WEBAUTHN_RP_NAME")
                .default_value("Quillgate"),
        )
        .arg(
            Arg::new(ARG_TOTP_ISSUER)
                .long(ARG_TOTP_ISSUER)
                .help("Issuer shown by authenticator apps")
                .env("QUILLGATE_TOTP_ISSUER")
                .default_value("Quillgate"),
        )
        .arg(
            Arg::new(ARG_MFA_CHALLENGE_TTL_SECONDS)
                .long(ARG_MFA_CHALLENGE_TTL_SECONDS)
                .help("How long pending TOTP and WebAuthn ceremonies are kept")
                .env("QUILLGATE_MFA_CHALLENGE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}
