use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ModelId, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceHealth {
    Healthy,
    Unhealthy,
    /// Deployed but not yet through a successful probe.
    WarmingUp,
}

impl InstanceHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::WarmingUp => "warming_up",
        }
    }
}

/// Rolling request statistics of one instance or endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl RequestStats {
    pub fn record(&mut self, latency_ms: f64, ok: bool, at: DateTime<Utc>) {
        self.requests += 1;
        if !ok {
            self.errors += 1;
        }
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.requests as f64;
        self.last_request_at = Some(at);
    }

    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }

    pub fn merge(&mut self, other: &RequestStats) {
        let total = self.requests + other.requests;
        if total > 0 {
            self.avg_latency_ms = (self.avg_latency_ms * self.requests as f64
                + other.avg_latency_ms * other.requests as f64)
                / total as f64;
        }
        self.requests = total;
        self.errors += other.errors;
        self.last_request_at = self.last_request_at.max(other.last_request_at);
    }
}

/// A live runtime process serving one model version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInstance {
    pub id: Uuid,
    pub model_id: ModelId,
    pub version: Version,
    /// Deployment target the instance runs on.
    pub target: String,
    pub url: Option<String>,
    pub health_check_path: String,
    pub weight: u32,
    pub health: InstanceHealth,
    pub active_connections: u32,
    pub stats: RequestStats,
    pub started_at: DateTime<Utc>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_probe_error: Option<String>,
}

impl ModelInstance {
    pub fn key(&self) -> String {
        format!("{}@{}#{}", self.model_id, self.version, self.id)
    }

    pub fn is_healthy(&self) -> bool {
        self.health == InstanceHealth::Healthy
    }
}

/// Parameters for bringing up a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInstance {
    pub model_id: ModelId,
    pub version: Version,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_health_path")]
    pub health_check_path: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_target() -> String {
    "local".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_weight() -> u32 {
    1
}

impl NewInstance {
    pub fn new(model_id: impl Into<String>, version: Version) -> Self {
        Self {
            model_id: model_id.into(),
            version,
            target: default_target(),
            url: None,
            health_check_path: default_health_path(),
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn on_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub(crate) fn build(self, at: DateTime<Utc>) -> ModelInstance {
        ModelInstance {
            id: Uuid::now_v7(),
            model_id: self.model_id,
            version: self.version,
            target: self.target,
            url: self.url,
            health_check_path: self.health_check_path,
            weight: self.weight,
            health: InstanceHealth::WarmingUp,
            active_connections: 0,
            stats: RequestStats::default(),
            started_at: at,
            last_probe_at: None,
            last_probe_error: None,
        }
    }
}
