use serde::{Deserialize, Serialize};

use crate::types::Environment;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_millis: u32,
    pub memory_mb: u32,
    pub replicas: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_millis: 1000,
            memory_mb: 2048,
            replicas: 1,
        }
    }
}

/// A named place a model version can be deployed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub name: String,
    pub environment: Environment,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default = "default_health_path")]
    pub health_check_path: String,
    /// Observed error rate above which the deployment is failed.
    #[serde(default = "default_rollback_error_rate")]
    pub rollback_error_rate: f64,
    /// Base URL instances on this target are reachable at.
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_rollback_error_rate() -> f64 {
    0.05
}

impl DeploymentTarget {
    pub fn new(name: impl Into<String>, environment: Environment) -> Self {
        Self {
            name: name.into(),
            environment,
            resources: ResourceLimits::default(),
            health_check_path: default_health_path(),
            rollback_error_rate: default_rollback_error_rate(),
            base_url: None,
        }
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.resources.replicas = replicas;
        self
    }

    pub fn with_rollback_error_rate(mut self, rate: f64) -> Self {
        self.rollback_error_rate = rate;
        self
    }
}

/// One target per environment, two in production.
pub fn default_targets() -> Vec<DeploymentTarget> {
    vec![
        DeploymentTarget::new("dev-local", Environment::Development).with_rollback_error_rate(0.2),
        DeploymentTarget::new("staging-main", Environment::Staging)
            .with_replicas(2)
            .with_rollback_error_rate(0.1),
        DeploymentTarget::new("prod-east", Environment::Production)
            .with_replicas(3)
            .with_rollback_error_rate(0.02),
        DeploymentTarget::new("prod-west", Environment::Production)
            .with_replicas(3)
            .with_rollback_error_rate(0.02),
    ]
}

/// Targets configured for `environment`, in declaration order.
pub fn targets_for(targets: &[DeploymentTarget], environment: Environment) -> Vec<DeploymentTarget> {
    targets
        .iter()
        .filter(|t| t.environment == environment)
        .cloned()
        .collect()
}
