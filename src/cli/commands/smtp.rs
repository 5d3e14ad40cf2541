use anyhow::{bail, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_SMTP_HOST: &str = "smtp-host";
pub const ARG_SMTP_PORT: &str = "smtp-port";
pub const ARG_SMTP_USERNAME: &str = "smtp-username";
pub const ARG_SMTP_PASSWORD: &str = "smtp-password";
pub const ARG_SMTP_FROM: &str = "smtp-from";
pub const ARG_SMTP_INSECURE: &str = "smtp-insecure";
pub const ARG_MAIL_QUEUE: &str = "mail-queue";

#[derive(Debug, Clone)]
pub struct Options {
    /// `None` means mail is only logged.
    pub host: Option<String>,
    pub port: u16,
    pub credentials: Option<(String, SecretString)>,
    pub from: String,
    pub insecure: bool,
    pub queue: bool,
}

impl Options {
    /// Parse SMTP arguments from matches.
    ///
    /// # Errors
    /// Returns an error if only one half of the credentials is set.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        // clap passes empty env values through
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let credentials = match (
            get_non_empty(ARG_SMTP_USERNAME),
            get_non_empty(ARG_SMTP_PASSWORD),
        ) {
            (Some(username), Some(password)) => Some((username, SecretString::from(password))),
            (None, None) => None,
            _ => bail!("--{ARG_SMTP_USERNAME} and --{ARG_SMTP_PASSWORD} must be set together"),
        };

        Ok(Self {
            host: get_non_empty(ARG_SMTP_HOST),
            port: matches.get_one::<u16>(ARG_SMTP_PORT).copied().unwrap_or(587),
            credentials,
            from: get_non_empty(ARG_SMTP_FROM)
                .unwrap_or_else(|| "Taskpass <no-reply@taskpass.dev>".to_string()),
            insecure: matches.get_flag(ARG_SMTP_INSECURE),
            queue: matches.get_flag(ARG_MAIL_QUEUE),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SMTP_HOST)
                .long(ARG_SMTP_HOST)
                .help("SMTP relay host; mail is only logged when unset")
                .env("TASKPASS_SMTP_HOST"),
        )
        .arg(
            Arg::new(ARG_SMTP_PORT)
                .long(ARG_SMTP_PORT)
                .help("SMTP relay port; 465 uses implicit TLS, others STARTTLS")
                .env("TASKPASS_SMTP_PORT")
                .default_value("587")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_SMTP_USERNAME)
                .long(ARG_SMTP_USERNAME)
                .help("SMTP username")
                .env("TASKPASS_SMTP_USERNAME"),
        )
        .arg(
            Arg::new(ARG_SMTP_PASSWORD)
                .long(ARG_SMTP_PASSWORD)
                .help("SMTP password")
                .env("TASKPASS_SMTP_PASSWORD")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_SMTP_FROM)
                .long(ARG_SMTP_FROM)
                .help("Sender mailbox, example: Taskpass <no-reply@taskpass.dev>")
                .env("TASKPASS_SMTP_FROM"),
        )
        .arg(
            Arg::new(ARG_SMTP_INSECURE)
                .long(ARG_SMTP_INSECURE)
                .help("Talk plain SMTP without TLS (local relays only)")
                .env("TASKPASS_SMTP_INSECURE")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_MAIL_QUEUE)
                .long(ARG_MAIL_QUEUE)
                .help("Deliver mail from a background queue with retries")
                .env("TASKPASS_MAIL_QUEUE")
                .action(ArgAction::SetTrue),
        )
}
