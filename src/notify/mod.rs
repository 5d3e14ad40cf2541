//! Outbound mail capability.
//!
//! The identity layer only knows [`Notifier::deliver`]. Which backend sits
//! behind it is decided at startup: [`LogNotifier`] when no SMTP relay is
//! configured, [`smtp::SmtpNotifier`] otherwise, optionally wrapped in a
//! [`queue::QueuedNotifier`] so callers never wait on the relay.

use async_trait::async_trait;
use tracing::info;
use url::Url;

use crate::store::TokenPurpose;

pub mod queue;
pub mod smtp;

pub use queue::{MailQueueConfig, QueuedNotifier};
pub use smtp::SmtpNotifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub subject: String,
    pub recipient: String,
    pub body: String,
}

/// What happened to a message handed to a notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
    Failed,
}

impl Delivery {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Queued => "queued",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid mail address: {0}")]
    Address(String),
    #[error("failed to build mail: {0}")]
    Build(String),
    #[error("mail transport failed: {0}")]
    Transport(String),
    #[error("mail queue is closed")]
    QueueClosed,
    #[error("public base URL cannot carry a path: {0}")]
    BaseUrl(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, message: &MailMessage) -> Result<Delivery, NotifyError>;
}

/// Local dev notifier that logs the message instead of sending it.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, message: &MailMessage) -> Result<Delivery, NotifyError> {
        info!(
            recipient = %message.recipient,
            subject = %message.subject,
            body = %message.body,
            "mail delivery stub"
        );
        Ok(Delivery::Sent)
    }
}

/// Subject, wording and link route for one token purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailContext {
    pub purpose: TokenPurpose,
    pub subject: &'static str,
    pub action: &'static str,
    pub success_message: &'static str,
    route: [&'static str; 2],
}

impl MailContext {
    #[must_use]
    pub const fn for_purpose(purpose: TokenPurpose) -> Self {
        match purpose {
            TokenPurpose::SignupConfirmation => Self {
                purpose,
                subject: "Taskpass - complete registration",
                action: "confirm your email address and activate your account",
                success_message: "Mail with registration link has been sent to your email.",
                route: ["users", "confirm_email_reg"],
            },
            TokenPurpose::EmailChange => Self {
                purpose,
                subject: "Taskpass - complete email change",
                action: "confirm your new email address",
                success_message: "Mail with email change confirmation has been sent to your new email.",
                route: ["users", "confirm_email_change"],
            },
            TokenPurpose::PasswordReset => Self {
                purpose,
                subject: "Taskpass - complete password reset",
                action: "choose a new password",
                success_message: "Mail with password reset confirmation has been sent to your email.",
                route: ["users", "reset_password"],
            },
        }
    }

    /// `{base}/{route}/{token}/{email}`, each part percent-encoded as a path segment.
    ///
    /// # Errors
    /// Returns [`NotifyError::BaseUrl`] for a base such as `mailto:` that has no path.
    pub fn link(&self, base: &Url, token: &str, email: &str) -> Result<Url, NotifyError> {
        let mut link = base.clone();
        link.path_segments_mut()
            .map_err(|()| NotifyError::BaseUrl(base.to_string()))?
            .pop_if_empty()
            .extend(self.route)
            .push(token)
            .push(email);
        Ok(link)
    }

    /// # Errors
    /// See [`MailContext::link`].
    pub fn message(&self, base: &Url, recipient: &str, token: &str) -> Result<MailMessage, NotifyError> {
        let link = self.link(base, token, recipient)?;
        Ok(MailMessage {
            subject: self.subject.to_string(),
            recipient: recipient.to_string(),
            body: format!(
                "Hello {recipient},\n\nFollow the link below to {}:\n{link}\n\nIf you did not ask for this, ignore this message.\n",
                self.action
            ),
        })
    }
}
