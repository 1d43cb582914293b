use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instance::ModelInstance;
use crate::error::{ModelOpsError, Result};

/// Checks one instance independently of request traffic.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the instance is ready to serve.
    async fn probe(&self, instance: &ModelInstance) -> Result<()>;
}

/// Treats every in-process instance as ready.
#[derive(Debug, Default, Clone)]
pub struct InProcessProbe;

#[async_trait]
impl HealthProbe for InProcessProbe {
    async fn probe(&self, _instance: &ModelInstance) -> Result<()> {
        Ok(())
    }
}

/// Probe with a fixed verdict per instance, for tests and dry runs.
#[derive(Debug, Default)]
pub struct StaticProbe {
    failing: dashmap::DashSet<Uuid>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, id: Uuid) {
        self.failing.insert(id);
    }

    pub fn recover(&self, id: Uuid) {
        self.failing.remove(&id);
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, instance: &ModelInstance) -> Result<()> {
        if self.failing.contains(&instance.id) {
            Err(ModelOpsError::Validation(format!("{} failed its probe", instance.key())))
        } else {
            Ok(())
        }
    }
}

/// Result of a health sweep across all instances.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HealthSweepResult {
    pub instances_checked: usize,
    pub marked_healthy: Vec<Uuid>,
    pub marked_unhealthy: Vec<Uuid>,
}

impl HealthSweepResult {
    pub fn changed(&self) -> usize {
        self.marked_healthy.len() + self.marked_unhealthy.len()
    }
}
