use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plan::DeploymentStrategy;
use super::target::DeploymentTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Where a deploy or test step acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    /// The live pool.
    Primary,
    /// The idle pool of a blue-green pair.
    Secondary,
    /// The partial-traffic pool of a canary rollout.
    Canary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Validate,
    Build,
    Test,
    /// Deploy to one target, or to every target when `target` is unset.
    Deploy { target: Option<String> },
    DeploySecondary,
    TestSecondary,
    SwitchTraffic,
    DeployCanary { percentage: u8 },
    MonitorCanary,
    PromoteToFull,
    Monitor,
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Build => "build",
            Self::Test => "test",
            Self::Deploy { .. } => "deploy",
            Self::DeploySecondary => "deploy-secondary",
            Self::TestSecondary => "test-secondary",
            Self::SwitchTraffic => "switch-traffic",
            Self::DeployCanary { .. } => "deploy-canary",
            Self::MonitorCanary => "monitor-canary",
            Self::PromoteToFull => "promote-to-full",
            Self::Monitor => "monitor",
        }
    }

    /// Steps that talk to the build/deploy platform and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Build | Self::Deploy { .. } | Self::DeploySecondary | Self::DeployCanary { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub name: String,
    pub action: StepAction,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub attempts: u32,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl DeploymentStep {
    pub fn new(action: StepAction) -> Self {
        let name = match &action {
            StepAction::Deploy { target: Some(t) } => format!("deploy:{}", t),
            other => other.name().to_string(),
        };
        Self {
            name,
            action,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            attempts: 0,
            output: None,
            error: None,
        }
    }

    pub fn start(&mut self, at: DateTime<Utc>) {
        self.status = StepStatus::Running;
        self.started_at = Some(at);
    }

    /// Pass over a step the plan makes redundant.
    pub fn skip(&mut self, at: DateTime<Utc>, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.started_at = Some(at);
        self.finished_at = Some(at);
        self.duration_ms = Some(0);
        self.output = Some(reason.into());
    }

    pub fn finish(&mut self, at: DateTime<Utc>, result: std::result::Result<String, String>) {
        self.finished_at = Some(at);
        self.duration_ms = self
            .started_at
            .map(|s| (at - s).num_milliseconds().max(0) as u64);
        match result {
            Ok(output) => {
                self.status = StepStatus::Completed;
                self.output = Some(output);
            }
            Err(error) => {
                self.status = StepStatus::Failed;
                self.error = Some(error);
            }
        }
    }
}

/// Ordered steps for `strategy` over `targets`.
pub fn generate_steps(strategy: &DeploymentStrategy, targets: &[DeploymentTarget]) -> Vec<DeploymentStep> {
    let mut actions = vec![StepAction::Validate, StepAction::Build, StepAction::Test];
    match strategy {
        DeploymentStrategy::Immediate => {
            actions.push(StepAction::Deploy { target: None });
        }
        DeploymentStrategy::Rolling => {
            actions.extend(targets.iter().map(|t| StepAction::Deploy {
                target: Some(t.name.clone()),
            }));
        }
        DeploymentStrategy::BlueGreen => {
            actions.extend([
                StepAction::DeploySecondary,
                StepAction::TestSecondary,
                StepAction::SwitchTraffic,
            ]);
        }
        DeploymentStrategy::Canary { percentage } => {
            actions.extend([
                StepAction::DeployCanary {
                    percentage: *percentage,
                },
                StepAction::MonitorCanary,
                StepAction::PromoteToFull,
            ]);
        }
    }
    actions.push(StepAction::Monitor);
    actions.into_iter().map(DeploymentStep::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;

    fn names(strategy: DeploymentStrategy, targets: &[DeploymentTarget]) -> Vec<String> {
        generate_steps(&strategy, targets).into_iter().map(|s| s.name).collect()
    }

    #[test]
    fn step_graphs_per_strategy() {
        let targets = vec![
            DeploymentTarget::new("a", Environment::Production),
            DeploymentTarget::new("b", Environment::Production),
        ];
        assert_eq!(
            names(DeploymentStrategy::Immediate, &targets),
            ["validate", "build", "test", "deploy", "monitor"]
        );
        assert_eq!(
            names(DeploymentStrategy::Rolling, &targets),
            ["validate", "build", "test", "deploy:a", "deploy:b", "monitor"]
        );
        assert_eq!(
            names(DeploymentStrategy::BlueGreen, &targets),
            [
                "validate",
                "build",
                "test",
                "deploy-secondary",
                "test-secondary",
                "switch-traffic",
                "monitor"
            ]
        );
        assert_eq!(
            names(DeploymentStrategy::Canary { percentage: 10 }, &targets),
            [
                "validate",
                "build",
                "test",
                "deploy-canary",
                "monitor-canary",
                "promote-to-full",
                "monitor"
            ]
        );
    }

    #[test]
    fn generated_steps_start_pending() {
        let steps = generate_steps(&DeploymentStrategy::Immediate, &[]);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending && s.attempts == 0));
    }

    #[test]
    fn finish_records_duration_and_outcome() {
        let mut step = DeploymentStep::new(StepAction::Build);
        let start = Utc::now();
        step.start(start);
        step.finish(start + chrono::Duration::milliseconds(250), Err("boom".into()));
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.duration_ms, Some(250));
        assert_eq!(step.error.as_deref(), Some("boom"));
    }
}
