use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::{DeploymentPlan, DeploymentStrategy};
use super::step::{generate_steps, DeploymentStep, StepStatus};
use crate::types::{Environment, ModelId, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

/// The failing step and its error text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub step: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub from_version: Version,
    /// Version restored, or none when nothing was deployed before.
    pub to_version: Option<Version>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub succeeded: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: u64,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub total_attempts: u32,
    /// Last error rate observed by a monitor step.
    pub observed_error_rate: Option<f64>,
}

/// Runtime record of one invocation of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentExecution {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub model_id: ModelId,
    pub version: Version,
    pub environment: Environment,
    pub strategy: DeploymentStrategy,
    pub steps: Vec<DeploymentStep>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<ExecutionFailure>,
    /// Set when the execution was cancelled.
    pub cancel_reason: Option<String>,
    pub rollback: Option<RollbackRecord>,
    pub metrics: ExecutionMetrics,
}

impl DeploymentExecution {
    pub fn new(plan: &DeploymentPlan) -> Self {
        Self {
            id: Uuid::now_v7(),
            plan_id: plan.id,
            model_id: plan.model_id.clone(),
            version: plan.version,
            environment: plan.environment,
            strategy: plan.strategy,
            steps: generate_steps(&plan.strategy, &plan.targets),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure: None,
            cancel_reason: None,
            rollback: None,
            metrics: ExecutionMetrics::default(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}@{}", self.model_id, self.version)
    }

    /// Mark the execution failed at `step` unless it already ended.
    pub fn fail(&mut self, step: &str, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Failed;
        self.failure = Some(ExecutionFailure {
            step: step.to_string(),
            message: message.into(),
        });
    }

    /// Close timing and step counters.
    pub fn seal(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
        self.metrics.duration_ms = self
            .started_at
            .map(|s| (at - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        self.metrics.steps_completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        self.metrics.steps_failed = self.steps.iter().filter(|s| s.status == StepStatus::Failed).count();
        self.metrics.total_attempts = self.steps.iter().map(|s| s.attempts).sum();
    }

    /// "step: error" for failed executions.
    pub fn failure_summary(&self) -> Option<String> {
        self.failure.as_ref().map(|f| format!("{}: {}", f.step, f.message))
    }
}
