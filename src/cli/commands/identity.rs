use clap::{Arg, ArgMatches, Command};

pub const ARG_AMQP_URL: &str = "amqp-url";
pub const ARG_IDENTITY_EXCHANGE: &str = "identity-exchange";
pub const ARG_GOOGLE_RPC_TIMEOUT_SECONDS: &str = "google-rpc-timeout-seconds";
pub const ARG_GITHUB_RPC_TIMEOUT_SECONDS: &str = "github-rpc-timeout-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub amqp_url: Option<String>,
    pub exchange: String,
    pub google_timeout_seconds: u64,
    pub github_timeout_seconds: u64,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            amqp_url: matches
                .get_one::<String>(ARG_AMQP_URL)
                .cloned()
                .filter(|v| !v.trim().is_empty()),
            exchange: matches
                .get_one::<String>(ARG_IDENTITY_EXCHANGE)
                .cloned()
                .unwrap_or_else(|| crate::identity::DEFAULT_IDENTITY_EXCHANGE.to_string()),
            google_timeout_seconds: matches
                .get_one::<u64>(ARG_GOOGLE_RPC_TIMEOUT_SECONDS)
                .copied()
                .unwrap_or(crate::identity::DEFAULT_GOOGLE_TIMEOUT_SECONDS),
            github_timeout_seconds: matches
                .get_one::<u64>(ARG_GITHUB_RPC_TIMEOUT_SECONDS)
                .copied()
                .unwrap_or(crate::identity::DEFAULT_GITHUB_TIMEOUT_SECONDS),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_AMQP_URL)
                .long(ARG_AMQP_URL)
                .help("Broker URL of the identity service; OAuth is disabled without it")
                .env("QUILLGATE_AMQP_URL")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_IDENTITY_EXCHANGE)
                .long(ARG_IDENTITY_EXCHANGE)
                .help("Exchange identity requests are published to")
                .env("QUILLGATE_IDENTITY_EXCHANGE")
                .default_value(crate::identity::DEFAULT_IDENTITY_EXCHANGE),
        )
        .arg(
            Arg::new(ARG_GOOGLE_RPC_TIMEOUT_SECONDS)
                .long(ARG_GOOGLE_RPC_TIMEOUT_SECONDS)
                .help("Deadline for Google identity lookups in seconds")
                .env("QUILLGATE_GOOGLE_RPC_TIMEOUT_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_GITHUB_RPC_TIMEOUT_SECONDS)
                .long(ARG_GITHUB_RPC_TIMEOUT_SECONDS)
                .help("Deadline for GitHub identity lookups in seconds")
                .env("QUILLGATE_GITHUB_RPC_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64)),
        )
}
