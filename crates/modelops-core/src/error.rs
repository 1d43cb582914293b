use thiserror::Error;
use uuid::Uuid;

use crate::types::VersionStatus;

pub type Result<T> = std::result::Result<T, ModelOpsError>;

#[derive(Debug, Error)]
pub enum ModelOpsError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Version not found: {model_id}@{version}")]
    VersionNotFound { model_id: String, version: String },

    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error(
        "Threshold not met: {model_id}@{version} accuracy {accuracy:.4} is below the {stage} threshold {threshold:.4}"
    )]
    ThresholdNotMet {
        model_id: String,
        version: String,
        stage: VersionStatus,
        accuracy: f64,
        threshold: f64,
    },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: VersionStatus,
        to: VersionStatus,
    },

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Deployment plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("Deployment execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Deployment plan {plan_id} is {state}: {reason}")]
    PlanState {
        plan_id: Uuid,
        state: String,
        reason: String,
    },

    #[error("Step '{step}' failed: {message}")]
    Execution { step: String, message: String },

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Model not available: {0}")]
    ModelNotAvailable(String),

    #[error("No healthy instance for {model_id}@{version}")]
    NoHealthyInstance { model_id: String, version: String },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Inference timed out after {0} ms")]
    Timeout(u64),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ModelOpsError {
    /// Short machine-readable label, used for metrics and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ModelNotFound(_) => "model_not_found",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::InvalidArtifact(_) => "invalid_artifact",
            Self::ThresholdNotMet { .. } => "threshold_not_met",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AlreadyRunning(_) => "already_running",
            Self::PlanNotFound(_) => "plan_not_found",
            Self::ExecutionNotFound(_) => "execution_not_found",
            Self::PlanState { .. } => "plan_state",
            Self::Execution { .. } => "execution",
            Self::Platform(_) => "platform",
            Self::Training(_) => "training",
            Self::ModelNotAvailable(_) => "model_not_available",
            Self::NoHealthyInstance { .. } => "no_healthy_instance",
            Self::Inference(_) => "inference",
            Self::Timeout(_) => "timeout",
            Self::Notification(_) => "notification",
            Self::Serialization(_) => "serialization",
        }
    }

    /// True for lookups that failed because the entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound(_)
                | Self::VersionNotFound { .. }
                | Self::PlanNotFound(_)
                | Self::ExecutionNotFound(_)
        )
    }
}
