//! In-process mail queue.
//!
//! [`QueuedNotifier::spawn`] starts a worker that drains a bounded channel and
//! hands each message to the wrapped notifier. Failed sends are retried with
//! exponential backoff and jitter until `max_attempts`, then dropped with an
//! error log. Messages still queued at shutdown are lost; the resend endpoint
//! covers that case.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::mpsc, time::sleep};
use tracing::{error, info, warn};

use super::{Delivery, MailMessage, Notifier, NotifyError};

#[derive(Clone, Copy, Debug)]
pub struct MailQueueConfig {
    capacity: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl MailQueueConfig {
    /// Default queue config: 256 slots, 5 attempts, 5s->5m backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capacity: 256,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_millis(1)
        } else {
            self.backoff_base
        };
        Self {
            capacity: self.capacity.max(1),
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max: self.backoff_max.max(backoff_base),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for MailQueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct QueuedNotifier {
    sender: mpsc::Sender<MailMessage>,
}

impl QueuedNotifier {
    /// Start the worker; it stops once every `QueuedNotifier` clone is dropped.
    pub fn spawn(
        inner: Arc<dyn Notifier>,
        config: MailQueueConfig,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let config = config.normalize();
        let (sender, mut receiver) = mpsc::channel::<MailMessage>(config.capacity());

        let worker = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                deliver_with_retry(inner.as_ref(), &message, &config).await;
            }
            info!("mail queue drained, worker stopping");
        });

        (Self { sender }, worker)
    }
}

#[async_trait]
impl Notifier for QueuedNotifier {
    async fn deliver(&self, message: &MailMessage) -> Result<Delivery, NotifyError> {
        self.sender
            .send(message.clone())
            .await
            .map_err(|_| NotifyError::QueueClosed)?;
        Ok(Delivery::Queued)
    }
}

async fn deliver_with_retry(inner: &dyn Notifier, message: &MailMessage, config: &MailQueueConfig) {
    let max_attempts = config.max_attempts();
    for attempt in 1..=max_attempts {
        match inner.deliver(message).await {
            Ok(_) => return,
            Err(err) if attempt < max_attempts => {
                let delay = backoff_delay(attempt, config.backoff_base, config.backoff_max);
                warn!(
                    recipient = %message.recipient,
                    attempt,
                    "mail delivery failed, retrying in {delay:?}: {err}"
                );
                sleep(delay).await;
            }
            Err(err) => {
                error!(
                    recipient = %message.recipient,
                    attempt,
                    "mail delivery failed, giving up: {err}"
                );
            }
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
