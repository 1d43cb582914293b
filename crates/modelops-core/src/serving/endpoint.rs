use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::balancer::LoadBalancing;
use super::instance::RequestStats;
use crate::error::{ModelOpsError, Result};
use crate::types::{ModelId, Version};

/// Binds a model to a request path and a balancing strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub model_id: ModelId,
    /// Defaults to `/models/<model_id>/predict`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub strategy: LoadBalancing,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Extra attempts on backend failure when the request sets none.
    #[serde(default)]
    pub max_retries: u32,
}

impl EndpointConfig {
    pub fn new(model_id: impl Into<String>, strategy: LoadBalancing) -> Self {
        Self {
            model_id: model_id.into(),
            path: None,
            strategy,
            timeout_ms: None,
            max_retries: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_id.is_empty() {
            return Err(ModelOpsError::Validation("endpoint model id is empty".into()));
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(ModelOpsError::Validation(format!(
                    "endpoint path '{}' must start with '/'",
                    path
                )));
            }
        }
        Ok(())
    }

    pub fn resolved_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/models/{}/predict", self.model_id))
    }
}

/// Share of unpinned traffic sent to a version other than production.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanaryRoute {
    pub version: Version,
    pub percentage: u8,
}

impl CanaryRoute {
    /// Whether a uniform `draw` in `[0, 1)` lands on the canary.
    pub fn takes(&self, draw: f64) -> bool {
        draw * 100.0 < self.percentage as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub model_id: ModelId,
    pub path: String,
    pub strategy: LoadBalancing,
    pub timeout_ms: Option<u64>,
    pub max_retries: u32,
    pub canary: Option<CanaryRoute>,
    pub stats: RequestStats,
    pub created_at: DateTime<Utc>,
}

impl ModelEndpoint {
    pub fn from_config(config: EndpointConfig) -> Self {
        Self {
            path: config.resolved_path(),
            model_id: config.model_id,
            strategy: config.strategy,
            timeout_ms: config.timeout_ms,
            max_retries: config.max_retries,
            canary: None,
            stats: RequestStats::default(),
            created_at: Utc::now(),
        }
    }
}
