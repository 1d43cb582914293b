use async_trait::async_trait;

use super::plan::DeploymentPlan;
use super::step::Slot;
use super::target::DeploymentTarget;
use crate::error::Result;
use crate::types::Version;

/// Build/container platform the orchestrator delegates step work to.
///
/// Every call returns human-readable output that is stored on the step.
#[async_trait]
pub trait DeploymentPlatform: Send + Sync {
    /// Package the plan's model version.
    async fn build(&self, plan: &DeploymentPlan) -> Result<String>;

    async fn test(&self, plan: &DeploymentPlan, slot: Slot) -> Result<String>;

    /// Bring up the version on `target`. `traffic_percent` is the share of
    /// traffic the new instances should receive once ready.
    async fn deploy(
        &self,
        plan: &DeploymentPlan,
        target: &DeploymentTarget,
        slot: Slot,
        traffic_percent: u8,
    ) -> Result<String>;

    /// Blue-green: move all traffic to the secondary pool.
    async fn switch_traffic(&self, plan: &DeploymentPlan) -> Result<String>;

    /// Canary: move all traffic to the canary pool.
    async fn promote(&self, plan: &DeploymentPlan) -> Result<String>;

    /// Error rate currently observed for the plan's version.
    async fn error_rate(&self, plan: &DeploymentPlan) -> Result<f64>;

    /// Restore `to` (or withdraw the plan's version when `to` is none).
    async fn rollback(&self, plan: &DeploymentPlan, to: Option<Version>) -> Result<String>;

    /// Called once after every step succeeded and the deployment was recorded.
    async fn complete(&self, _plan: &DeploymentPlan) -> Result<()> {
        Ok(())
    }
}
