//! Deployment planning, approval, and step-wise execution.

mod execution;
mod local;
mod orchestrator;
mod plan;
mod platform;
mod scripted;
mod step;
mod target;

pub use execution::{DeploymentExecution, ExecutionFailure, ExecutionMetrics, ExecutionStatus, RollbackRecord};
pub use local::RouterPlatform;
pub use orchestrator::{DeploymentOrchestrator, OrchestratorConfig, ScheduleOutcome};
pub use plan::{ApprovalRecord, DeploymentPlan, DeploymentStrategy, PlanState, PlanView, TriggerSource};
pub use platform::DeploymentPlatform;
pub use scripted::ScriptedPlatform;
pub use step::{generate_steps, DeploymentStep, Slot, StepAction, StepStatus};
pub use target::{default_targets, targets_for, DeploymentTarget, ResourceLimits};
