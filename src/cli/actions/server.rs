use crate::{
    api,
    cli::{
        commands::{auth, smtp},
        telemetry,
    },
    identity::{Argon2Hasher, Identity, OneTimeTokens, SessionIssuer},
    notify::{LogNotifier, MailQueueConfig, Notifier, QueuedNotifier, SmtpNotifier},
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub apply_schema: bool,
    pub auth: auth::Options,
    pub smtp: smtp::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the mail transport cannot be configured, the database
/// is unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let hasher = Argon2Hasher::recommended().context("Failed to set up password hashing")?;
    let notifier = build_notifier(&args.smtp)?;
    let identity = Identity::new(
        Arc::new(hasher),
        SessionIssuer::new(&args.auth.signing_secret, args.auth.session_ttl_seconds),
        OneTimeTokens::new(args.auth.email_token_ttl_seconds),
        notifier,
        args.auth.public_base_url.clone(),
    );

    let result = api::new(
        args.port,
        args.dsn,
        args.apply_schema,
        identity,
        Duration::from_secs(args.auth.revoked_prune_seconds),
    )
    .await;

    telemetry::shutdown_tracer();

    result
}

fn build_notifier(options: &smtp::Options) -> Result<Arc<dyn Notifier>> {
    let inner: Arc<dyn Notifier> = match &options.host {
        Some(host) => Arc::new(
            SmtpNotifier::new(
                host,
                options.port,
                options.credentials.clone(),
                &options.from,
                options.insecure,
            )
            .context("Failed to configure SMTP transport")?,
        ),
        None => {
            info!("No SMTP host configured, mail will only be logged");
            Arc::new(LogNotifier)
        }
    };

    if options.queue {
        // The worker stops once the last queue handle is dropped.
        let (queue, _worker) = QueuedNotifier::spawn(inner, MailQueueConfig::default());
        Ok(Arc::new(queue))
    } else {
        Ok(inner)
    }
}

fn log_startup_args(args: &Args) {
    let mail = match (&args.smtp.host, args.smtp.insecure) {
        (Some(host), false) => format!("smtp:{host}:{}", args.smtp.port),
        (Some(host), true) => format!("smtp+plain:{host}:{}", args.smtp.port),
        (None, _) => "log".to_string(),
    };
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        ("apply_schema", args.apply_schema.to_string()),
        ("public_base_url", args.auth.public_base_url.to_string()),
        (
            "session_ttl_seconds",
            args.auth.session_ttl_seconds.to_string(),
        ),
        (
            "email_token_ttl_seconds",
            args.auth.email_token_ttl_seconds.to_string(),
        ),
        (
            "revoked_prune_seconds",
            args.auth.revoked_prune_seconds.to_string(),
        ),
        ("mail", mail),
        ("mail_queue", args.smtp.queue.to_string()),
        (
            "smtp_credentials_set",
            args.smtp.credentials.is_some().to_string(),
        ),
    ];
    info!("{}", startup_message("Startup configuration", &entries));
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn startup_message(title: &str, entries: &[(&str, String)]) -> String {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    message
}

fn banner() -> String {
    let short_hash = crate::GIT_COMMIT_HASH.trim().get(..7).unwrap_or(crate::GIT_COMMIT_HASH);
    format!(
        "taskpass - {} - {short_hash}",
        env!("CARGO_PKG_VERSION")
    )
}
