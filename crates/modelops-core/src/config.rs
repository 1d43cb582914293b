use serde::{Deserialize, Serialize};

use crate::deploy::OrchestratorConfig;
use crate::error::{ModelOpsError, Result};
use crate::monitor::MonitorConfig;
use crate::reactor::ReactionConfig;
use crate::registry::RegistryConfig;
use crate::retrain::RetrainConfig;
use crate::serving::ServingConfig;
use crate::types::Environment;

/// Configuration of the whole control plane, one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOpsConfig {
    pub registry: RegistryConfig,
    pub monitor: MonitorConfig,
    pub retrain: RetrainConfig,
    pub orchestrator: OrchestratorConfig,
    pub serving: ServingConfig,
    pub reactions: ReactionConfig,
}

fn unit(name: &str, value: f64, problems: &mut Vec<String>) {
    if !(0.0..=1.0).contains(&value) {
        problems.push(format!("{} must be within 0..=1, got {}", name, value));
    }
}

impl ModelOpsConfig {
    /// Every problem found, empty when the configuration is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let reg = &self.registry;
        unit("registry.staging_threshold", reg.staging_threshold, &mut problems);
        unit("registry.production_threshold", reg.production_threshold, &mut problems);
        if reg.staging_threshold > reg.production_threshold {
            problems.push(format!(
                "registry.staging_threshold ({}) exceeds registry.production_threshold ({})",
                reg.staging_threshold, reg.production_threshold
            ));
        }

        let alerts = &self.monitor.default_alerts.thresholds;
        unit("monitor.default_alerts.thresholds.min_accuracy", alerts.min_accuracy, &mut problems);
        unit("monitor.default_alerts.thresholds.max_error_rate", alerts.max_error_rate, &mut problems);
        if self.monitor.rolling_window_secs == 0 {
            problems.push("monitor.rolling_window_secs must be positive".into());
        }

        let orch = &self.orchestrator;
        if orch.canary_percentage == 0 || orch.canary_percentage > 100 {
            problems.push(format!(
                "orchestrator.canary_percentage must be 1..=100, got {}",
                orch.canary_percentage
            ));
        }
        for env in Environment::ALL {
            if !orch.targets.iter().any(|t| t.environment == env) {
                problems.push(format!("no deployment target for {}", env));
            }
        }
        for target in &orch.targets {
            unit(
                &format!("target {} rollback_error_rate", target.name),
                target.rollback_error_rate,
                &mut problems,
            );
            if !target.health_check_path.starts_with('/') {
                problems.push(format!("target {} health_check_path must start with '/'", target.name));
            }
        }
        let mut names: Vec<&str> = orch.targets.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            problems.push("deployment target names must be unique".into());
        }

        let serving = &self.serving;
        unit("serving.warn_error_rate", serving.warn_error_rate, &mut problems);
        unit("serving.low_confidence", serving.low_confidence, &mut problems);

        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ModelOpsError::Validation(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::DeploymentTarget;

    #[test]
    fn defaults_are_valid() {
        ModelOpsConfig::default().validate().unwrap();
    }

    #[test]
    fn thresholds_must_be_ordered_and_in_range() {
        let mut config = ModelOpsConfig::default();
        config.registry.staging_threshold = 0.95;
        config.registry.production_threshold = 1.2;
        let problems = config.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("production_threshold must be within")));
        assert!(problems.iter().any(|p| p.contains("exceeds")));
    }

    #[test]
    fn every_environment_needs_a_target() {
        let mut config = ModelOpsConfig::default();
        config.orchestrator.targets = vec![DeploymentTarget::new("stage", Environment::Staging)];
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("no deployment target for production"));
        assert!(err.contains("no deployment target for development"));
    }

    #[test]
    fn partial_toml_sections_keep_defaults() {
        let config: ModelOpsConfig = serde_json::from_value(serde_json::json!({
            "registry": {"production_threshold": 0.97},
            "monitor": {"retention_days": 7}
        }))
        .unwrap();
        assert_eq!(config.registry.production_threshold, 0.97);
        assert_eq!(config.registry.staging_threshold, 0.85);
        assert_eq!(config.monitor.retention_days, 7);
        assert_eq!(config.orchestrator.canary_percentage, 10);
    }
}
