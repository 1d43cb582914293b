use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::target::DeploymentTarget;
use crate::error::ModelOpsError;
use crate::types::{Environment, ModelId, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentStrategy {
    Immediate,
    Rolling,
    BlueGreen,
    /// Route `percentage` of traffic to the new version before full promotion.
    Canary { percentage: u8 },
}

impl DeploymentStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Rolling => "rolling",
            Self::BlueGreen => "blue-green",
            Self::Canary { .. } => "canary",
        }
    }

    /// Parse `immediate`, `rolling`, `blue-green`, `canary` or `canary:<pct>`.
    pub fn parse(s: &str, default_canary: u8) -> Result<Self, ModelOpsError> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "immediate" => Ok(Self::Immediate),
            "rolling" => Ok(Self::Rolling),
            "blue-green" | "bluegreen" | "blue_green" => Ok(Self::BlueGreen),
            "canary" => Ok(Self::Canary {
                percentage: default_canary,
            }),
            other => match other.strip_prefix("canary:") {
                Some(pct) => {
                    let percentage: u8 = pct
                        .parse()
                        .map_err(|_| ModelOpsError::Validation(format!("bad canary percentage '{}'", pct)))?;
                    if percentage == 0 || percentage > 100 {
                        return Err(ModelOpsError::Validation(format!(
                            "canary percentage must be 1..=100, got {}",
                            percentage
                        )));
                    }
                    Ok(Self::Canary { percentage })
                }
                None => Err(ModelOpsError::Validation(format!("unknown strategy '{}'", s))),
            },
        }
    }
}

impl fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canary { percentage } => write!(f, "canary:{}", percentage),
            other => f.write_str(other.name()),
        }
    }
}

/// What asked for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Scheduled,
    Retrain,
    /// Automated response to a monitor alert.
    Degradation,
}

impl TriggerSource {
    pub fn is_automated_response(self) -> bool {
        matches!(self, Self::Degradation)
    }
}

impl FromStr for TriggerSource {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "retrain" => Ok(Self::Retrain),
            "degradation" => Ok(Self::Degradation),
            other => Err(ModelOpsError::Validation(format!("unknown trigger source '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approver: String,
    pub decided_at: DateTime<Utc>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A proposed rollout. Immutable apart from its approval metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: Uuid,
    pub model_id: ModelId,
    pub version: Version,
    pub environment: Environment,
    pub strategy: DeploymentStrategy,
    pub targets: Vec<DeploymentTarget>,
    pub approval_required: bool,
    pub triggered_by: TriggerSource,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approval: Option<ApprovalRecord>,
    #[serde(default)]
    pub rejection: Option<ApprovalRecord>,
}

impl DeploymentPlan {
    pub fn key(&self) -> String {
        format!("{}@{}", self.model_id, self.version)
    }

    pub fn is_approved(&self) -> bool {
        !self.approval_required || self.approval.is_some()
    }

    /// Lowest rollback threshold among the plan's targets.
    pub fn error_rate_limit(&self) -> f64 {
        self.targets
            .iter()
            .map(|t| t.rollback_error_rate)
            .fold(f64::INFINITY, f64::min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    AwaitingApproval,
    Scheduled,
    Running,
    Completed,
    Failed,
    Rejected,
}

impl PlanState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingApproval => "awaiting_approval",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plan together with its lifecycle state, as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanView {
    pub plan: DeploymentPlan,
    pub state: PlanState,
    /// Why the plan is not running yet, if it is waiting.
    pub wait_reason: Option<String>,
    pub executions: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parsing() {
        assert_eq!(DeploymentStrategy::parse("rolling", 10).unwrap(), DeploymentStrategy::Rolling);
        assert_eq!(
            DeploymentStrategy::parse("Blue-Green", 10).unwrap(),
            DeploymentStrategy::BlueGreen
        );
        assert_eq!(
            DeploymentStrategy::parse("canary", 10).unwrap(),
            DeploymentStrategy::Canary { percentage: 10 }
        );
        assert_eq!(
            DeploymentStrategy::parse("canary:25", 10).unwrap(),
            DeploymentStrategy::Canary { percentage: 25 }
        );
        assert!(DeploymentStrategy::parse("canary:0", 10).is_err());
        assert!(DeploymentStrategy::parse("yolo", 10).is_err());
        assert_eq!(DeploymentStrategy::Canary { percentage: 5 }.to_string(), "canary:5");
    }

    #[test]
    fn strategy_serializes_tagged() {
        let json = serde_json::to_value(DeploymentStrategy::Canary { percentage: 15 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "canary", "percentage": 15}));
    }
}
