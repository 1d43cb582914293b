//! Hand-off point to the notification transport (email, chat, webhook, NATS).
//!
//! Delivery guarantees belong to the transport; callers only log failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub severity: Severity,
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(subject: impl Into<String>, body: impl Into<String>, severity: Severity) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            severity,
            model_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }
}

pub trait Notifier: Send + Sync {
    /// Hand a notification to the transport registered for `channel`.
    fn notify(&self, channel: &str, notification: &Notification) -> Result<()>;
}

/// Deliver to each channel, logging failures instead of propagating them.
pub fn notify_all(notifier: &dyn Notifier, channels: &[String], notification: &Notification) {
    for channel in channels {
        if let Err(e) = notifier.notify(channel, notification) {
            log::error!(
                "notification '{}' to channel '{}' failed: {}",
                notification.subject,
                channel,
                e
            );
        }
    }
}

/// Writes notifications to the log. Default transport.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, channel: &str, n: &Notification) -> Result<()> {
        match n.severity {
            Severity::Info => log::info!("[{}] {}: {}", channel, n.subject, n.body),
            Severity::Warning => log::warn!("[{}] {}: {}", channel, n.subject, n.body),
            Severity::Critical => log::error!("[{}] {}: {}", channel, n.subject, n.body),
        }
        Ok(())
    }
}

/// Records every notification in memory. Useful for tests and the CLI dry-run.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, Notification)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count_for(&self, channel: &str) -> usize {
        self.sent().iter().filter(|(c, _)| c == channel).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, channel: &str, notification: &Notification) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel.to_string(), notification.clone()));
        Ok(())
    }
}

/// Sends every notification to several transports in order.
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, channel: &str, notification: &Notification) -> Result<()> {
        let mut first_err = None;
        for target in &self.targets {
            if let Err(e) = target.notify(channel, notification) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
