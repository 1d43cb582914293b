mod feedback;

pub use feedback::{FeedbackIngest, FeedbackMessage};

use async_nats::Client;
use modelops_core::{Envelope, ModelOpsError, Notification, Notifier};
use tokio::sync::broadcast;

/// Subject for a bus event: `<prefix>.events.<topic>`.
pub fn event_subject(prefix: &str, topic: &str) -> String {
    format!("{}.events.{}", prefix, topic)
}

/// Subject for a notification channel: `<prefix>.notify.<channel>`.
pub fn notify_subject(prefix: &str, channel: &str) -> String {
    let channel: String = channel
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}.notify.{}", prefix, channel)
}

/// Publishes notifications as JSON on `<prefix>.notify.<channel>`.
///
/// Publishing happens on the current tokio runtime; calls made outside one
/// fail with a notification error.
pub struct NatsNotifier {
    client: Client,
    prefix: String,
}

impl NatsNotifier {
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }
}

impl Notifier for NatsNotifier {
    fn notify(&self, channel: &str, notification: &Notification) -> modelops_core::Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ModelOpsError::Notification(format!("no runtime for NATS publish: {}", e)))?;
        let payload = serde_json::to_vec(notification)?;
        let subject = notify_subject(&self.prefix, channel);
        let client = self.client.clone();
        handle.spawn(async move {
            if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                tracing::error!("NATS publish to {} failed: {}", subject, e);
            }
        });
        Ok(())
    }
}

/// Forwards every bus event to NATS until the bus closes.
pub struct EventBridge {
    client: Client,
    prefix: String,
}

impl EventBridge {
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub async fn run(self, mut rx: broadcast::Receiver<Envelope>) {
        tracing::info!("NATS event bridge started on {}.events.>", self.prefix);
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let subject = event_subject(&self.prefix, &envelope.topic);
                    match serde_json::to_vec(&envelope) {
                        Ok(payload) => {
                            if let Err(e) = self.client.publish(subject.clone(), payload.into()).await {
                                tracing::error!("NATS publish to {} failed: {}", subject, e);
                            }
                        }
                        Err(e) => tracing::error!("event on {} not serializable: {}", envelope.topic, e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("NATS event bridge lagged, {} event(s) dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
