//! Typed lifecycle events published to named topics.
//!
//! Components publish through an [`EventBus`]; consumers subscribe to the
//! topics they care about (or to everything) and receive a
//! `tokio::sync::broadcast` receiver. Slow subscribers lag and lose the oldest
//! events rather than blocking publishers.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::monitor::Alert;
use crate::types::{Environment, ModelId, ModelMetrics, Version, VersionStatus};

pub mod topics {
    pub const PERFORMANCE_DEGRADED: &str = "monitor.performance_degraded";
    pub const DRIFT_DETECTED: &str = "monitor.drift_detected";
    pub const VERSION_REGISTERED: &str = "registry.version_registered";
    pub const VERSION_PROMOTED: &str = "registry.version_promoted";
    pub const RETRAIN_COMPLETED: &str = "retrain.completed";
    pub const RETRAIN_REJECTED: &str = "retrain.rejected";
    pub const APPROVAL_REQUESTED: &str = "deploy.approval_requested";
    pub const DEPLOYMENT_STARTED: &str = "deploy.started";
    pub const DEPLOYMENT_COMPLETED: &str = "deploy.completed";
    pub const DEPLOYMENT_FAILED: &str = "deploy.failed";
    pub const DEPLOYMENT_ROLLED_BACK: &str = "deploy.rolled_back";
    pub const INSTANCE_HEALTH_CHANGED: &str = "serving.instance_health_changed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelOpsEvent {
    PerformanceDegraded {
        model_id: ModelId,
        alert: Alert,
    },
    DriftDetected {
        model_id: ModelId,
        alert: Alert,
    },
    VersionRegistered {
        model_id: ModelId,
        version: Version,
        tags: Vec<String>,
    },
    VersionPromoted {
        model_id: ModelId,
        version: Version,
        from: VersionStatus,
        to: VersionStatus,
    },
    RetrainCompleted {
        model_id: ModelId,
        version: Version,
        metrics: ModelMetrics,
    },
    RetrainRejected {
        model_id: ModelId,
        metrics: ModelMetrics,
        reason: String,
    },
    ApprovalRequested {
        plan_id: Uuid,
        model_id: ModelId,
        version: Version,
        environment: Environment,
    },
    DeploymentStarted {
        execution_id: Uuid,
        plan_id: Uuid,
        model_id: ModelId,
        version: Version,
        environment: Environment,
    },
    DeploymentCompleted {
        execution_id: Uuid,
        plan_id: Uuid,
        model_id: ModelId,
        version: Version,
        environment: Environment,
    },
    DeploymentFailed {
        execution_id: Uuid,
        plan_id: Uuid,
        model_id: ModelId,
        version: Version,
        environment: Environment,
        step: String,
        error: String,
    },
    DeploymentRolledBack {
        execution_id: Uuid,
        model_id: ModelId,
        environment: Environment,
        from_version: Version,
        to_version: Option<Version>,
    },
    InstanceHealthChanged {
        instance_id: Uuid,
        model_id: ModelId,
        version: Version,
        healthy: bool,
    },
}

impl ModelOpsEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::PerformanceDegraded { .. } => topics::PERFORMANCE_DEGRADED,
            Self::DriftDetected { .. } => topics::DRIFT_DETECTED,
            Self::VersionRegistered { .. } => topics::VERSION_REGISTERED,
            Self::VersionPromoted { .. } => topics::VERSION_PROMOTED,
            Self::RetrainCompleted { .. } => topics::RETRAIN_COMPLETED,
            Self::RetrainRejected { .. } => topics::RETRAIN_REJECTED,
            Self::ApprovalRequested { .. } => topics::APPROVAL_REQUESTED,
            Self::DeploymentStarted { .. } => topics::DEPLOYMENT_STARTED,
            Self::DeploymentCompleted { .. } => topics::DEPLOYMENT_COMPLETED,
            Self::DeploymentFailed { .. } => topics::DEPLOYMENT_FAILED,
            Self::DeploymentRolledBack { .. } => topics::DEPLOYMENT_ROLLED_BACK,
            Self::InstanceHealthChanged { .. } => topics::INSTANCE_HEALTH_CHANGED,
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::PerformanceDegraded { model_id, .. }
            | Self::DriftDetected { model_id, .. }
            | Self::VersionRegistered { model_id, .. }
            | Self::VersionPromoted { model_id, .. }
            | Self::RetrainCompleted { model_id, .. }
            | Self::RetrainRejected { model_id, .. }
            | Self::ApprovalRequested { model_id, .. }
            | Self::DeploymentStarted { model_id, .. }
            | Self::DeploymentCompleted { model_id, .. }
            | Self::DeploymentFailed { model_id, .. }
            | Self::DeploymentRolledBack { model_id, .. }
            | Self::InstanceHealthChanged { model_id, .. } => model_id,
        }
    }
}

/// An event together with its topic and publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub published_at: DateTime<Utc>,
    pub event: ModelOpsEvent,
}

const DEFAULT_CAPACITY: usize = 256;

/// Topic-addressed broadcast bus. Cheap to clone; clones share channels.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    capacity: usize,
    topics: DashMap<String, broadcast::Sender<Envelope>>,
    all: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                capacity,
                topics: DashMap::new(),
                all,
            }),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        self.inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .value()
            .clone()
    }

    /// Subscribe to one topic (see [`topics`]).
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.sender(topic).subscribe()
    }

    /// Subscribe to every topic.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Envelope> {
        self.inner.all.subscribe()
    }

    /// Publish an event. Returns the number of receivers it reached.
    pub fn publish(&self, event: ModelOpsEvent) -> usize {
        let envelope = Envelope {
            topic: event.topic().to_string(),
            published_at: Utc::now(),
            event,
        };
        log::debug!("event {} for {}", envelope.topic, envelope.event.model_id());
        let topic_receivers = self
            .inner
            .topics
            .get(envelope.topic.as_str())
            .map(|tx| tx.send(envelope.clone()).unwrap_or(0))
            .unwrap_or(0);
        let all_receivers = self.inner.all.send(envelope).unwrap_or(0);
        topic_receivers + all_receivers
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(model: &str) -> ModelOpsEvent {
        ModelOpsEvent::VersionRegistered {
            model_id: model.into(),
            version: Version::INITIAL,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn topic_subscribers_only_see_their_topic() {
        let bus = EventBus::new();
        let mut registered_rx = bus.subscribe(topics::VERSION_REGISTERED);
        let mut promoted_rx = bus.subscribe(topics::VERSION_PROMOTED);

        bus.publish(registered("churn"));

        let env = registered_rx.recv().await.unwrap();
        assert_eq!(env.topic, topics::VERSION_REGISTERED);
        assert_eq!(env.event.model_id(), "churn");
        assert!(promoted_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_subscriber_sees_everything() {
        let bus = EventBus::new();
        let mut all = bus.subscribe_all();
        bus.publish(registered("a"));
        bus.publish(ModelOpsEvent::VersionPromoted {
            model_id: "a".into(),
            version: Version::INITIAL,
            from: VersionStatus::Experimental,
            to: VersionStatus::Staging,
        });
        assert_eq!(all.recv().await.unwrap().topic, topics::VERSION_REGISTERED);
        assert_eq!(all.recv().await.unwrap().topic, topics::VERSION_PROMOTED);
    }

    #[test]
    fn publish_without_subscribers_reaches_nobody() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(registered("x")), 0);
    }
}
