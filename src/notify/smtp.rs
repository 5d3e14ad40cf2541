use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use super::{Delivery, MailMessage, Notifier, NotifyError};

/// SMTPS port; anything else negotiates STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

/// How the connection to the relay is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Security {
    Plain,
    StartTls,
    ImplicitTls,
}

impl Security {
    fn for_port(port: u16, insecure: bool) -> Self {
        if insecure {
            Self::Plain
        } else if port == IMPLICIT_TLS_PORT {
            Self::ImplicitTls
        } else {
            Self::StartTls
        }
    }
}

/// SMTP relay delivery.
pub struct SmtpNotifier {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpNotifier")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpNotifier {
    /// Build the transport; no connection is made until the first send.
    ///
    /// `insecure` disables TLS and is meant for a local relay such as mailpit.
    ///
    /// # Errors
    /// Returns an error for an unparsable sender or when TLS cannot be set up
    /// for the relay host.
    pub fn new(
        host: &str,
        port: u16,
        credentials: Option<(String, SecretString)>,
        from: &str,
        insecure: bool,
    ) -> Result<Self, NotifyError> {
        let from: Mailbox = from
            .parse()
            .map_err(|err| NotifyError::Address(format!("{from}: {err}")))?;

        let builder = match Security::for_port(port, insecure) {
            Security::Plain => {
                warn!(host, port, "using unencrypted SMTP transport");
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            }
            Security::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|err| NotifyError::Transport(err.to_string()))?,
            Security::ImplicitTls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|err| NotifyError::Transport(err.to_string()))?,
        };
        let builder = builder.port(port);

        let transport = match credentials {
            Some((username, password)) => builder
                .credentials(Credentials::new(
                    username,
                    password.expose_secret().to_string(),
                ))
                .build(),
            None => builder.build(),
        };

        Ok(Self { from, transport })
    }

    fn build(&self, message: &MailMessage) -> Result<Message, NotifyError> {
        let to: Mailbox = message
            .recipient
            .parse()
            .map_err(|err| NotifyError::Address(format!("{}: {err}", message.recipient)))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|err| NotifyError::Build(err.to_string()))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn deliver(&self, message: &MailMessage) -> Result<Delivery, NotifyError> {
        let email = self.build(message)?;
        self.transport
            .send(email)
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        info!(recipient = %message.recipient, subject = %message.subject, "mail sent");
        Ok(Delivery::Sent)
    }
}
