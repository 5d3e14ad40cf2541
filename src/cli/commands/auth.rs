use anyhow::{bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

pub const ARG_SIGNING_SECRET: &str = "signing-secret";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_EMAIL_TOKEN_TTL_SECONDS: &str = "email-token-ttl-seconds";
pub const ARG_PUBLIC_BASE_URL: &str = "public-base-url";
pub const ARG_REVOKED_PRUNE_SECONDS: &str = "revoked-prune-seconds";

/// HS256 keys shorter than the digest size are rejected.
pub const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct Options {
    pub signing_secret: SecretString,
    pub session_ttl_seconds: i64,
    pub email_token_ttl_seconds: i64,
    pub public_base_url: Url,
    pub revoked_prune_seconds: u64,
}

impl Options {
    /// Parse session and token arguments from matches.
    ///
    /// # Errors
    /// Returns an error for a short signing secret, a non-positive TTL or an
    /// unparsable base URL.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let signing_secret = matches
            .get_one::<String>(ARG_SIGNING_SECRET)
            .map(|secret| SecretString::from(secret.clone()))
            .context("missing required argument: --signing-secret")?;
        if signing_secret.expose_secret().len() < MIN_SECRET_BYTES {
            bail!("--{ARG_SIGNING_SECRET} must be at least {MIN_SECRET_BYTES} bytes");
        }

        let session_ttl_seconds = positive(matches, ARG_SESSION_TTL_SECONDS)?;
        let email_token_ttl_seconds = positive(matches, ARG_EMAIL_TOKEN_TTL_SECONDS)?;

        let base = matches
            .get_one::<String>(ARG_PUBLIC_BASE_URL)
            .context("missing required argument: --public-base-url")?;
        let public_base_url =
            Url::parse(base).with_context(|| format!("Invalid public base URL: {base}"))?;
        if public_base_url.cannot_be_a_base() {
            bail!("--{ARG_PUBLIC_BASE_URL} must be an http(s) URL: {base}");
        }

        Ok(Self {
            signing_secret,
            session_ttl_seconds,
            email_token_ttl_seconds,
            public_base_url,
            revoked_prune_seconds: matches
                .get_one::<u64>(ARG_REVOKED_PRUNE_SECONDS)
                .copied()
                .unwrap_or(600),
        })
    }
}

fn positive(matches: &ArgMatches, id: &str) -> Result<i64> {
    match matches.get_one::<i64>(id).copied() {
        Some(value) if value > 0 => Ok(value),
        Some(value) => bail!("--{id} must be positive, got {value}"),
        None => bail!("missing required argument: --{id}"),
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SIGNING_SECRET)
                .long(ARG_SIGNING_SECRET)
                .help("HS256 key used to sign session tokens (at least 32 bytes)")
                .env("TASKPASS_SIGNING_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session token TTL in seconds")
                .env("TASKPASS_SESSION_TTL_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_EMAIL_TOKEN_TTL_SECONDS)
                .long(ARG_EMAIL_TOKEN_TTL_SECONDS)
                .help("Email confirmation token TTL in seconds")
                .env("TASKPASS_EMAIL_TOKEN_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_PUBLIC_BASE_URL)
                .long(ARG_PUBLIC_BASE_URL)
                .help("Base URL used to build confirmation links")
                .env("TASKPASS_PUBLIC_BASE_URL")
                .default_value("http://127.0.0.1:8080"),
        )
        .arg(
            Arg::new(ARG_REVOKED_PRUNE_SECONDS)
                .long(ARG_REVOKED_PRUNE_SECONDS)
                .help("Interval for pruning expired entries from the session denylist")
                .env("TASKPASS_REVOKED_PRUNE_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64)),
        )
}
