use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;

use super::plan::DeploymentPlan;
use super::platform::DeploymentPlatform;
use super::step::Slot;
use super::target::DeploymentTarget;
use crate::error::{ModelOpsError, Result};
use crate::types::Version;

/// Platform with scripted outcomes that records every call.
///
/// Operations succeed unless told to fail with [`ScriptedPlatform::fail_on`].
/// Useful for dry runs and for exercising the orchestrator.
#[derive(Default)]
pub struct ScriptedPlatform {
    failures: DashMap<&'static str, String>,
    error_rate: Mutex<f64>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` (`build`, `test`, `deploy`, `switch_traffic`,
    /// `promote`, `rollback`) fail with `message`.
    pub fn fail_on(&self, operation: &'static str, message: impl Into<String>) {
        self.failures.insert(operation, message.into());
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    pub fn set_error_rate(&self, rate: f64) {
        *self.error_rate.lock().unwrap_or_else(|e| e.into_inner()) = rate;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .count()
    }

    fn call(&self, operation: &'static str, detail: String) -> Result<String> {
        let line = format!("{} {}", operation, detail);
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(line.clone());
        match self.failures.get(operation) {
            Some(message) => Err(ModelOpsError::Platform(message.clone())),
            None => Ok(line),
        }
    }
}

#[async_trait]
impl DeploymentPlatform for ScriptedPlatform {
    async fn build(&self, plan: &DeploymentPlan) -> Result<String> {
        self.call("build", plan.key())
    }

    async fn test(&self, plan: &DeploymentPlan, slot: Slot) -> Result<String> {
        self.call("test", format!("{} {:?}", plan.key(), slot))
    }

    async fn deploy(
        &self,
        plan: &DeploymentPlan,
        target: &DeploymentTarget,
        slot: Slot,
        traffic_percent: u8,
    ) -> Result<String> {
        self.call(
            "deploy",
            format!("{} {} {:?} {}%", plan.key(), target.name, slot, traffic_percent),
        )
    }

    async fn switch_traffic(&self, plan: &DeploymentPlan) -> Result<String> {
        self.call("switch_traffic", plan.key())
    }

    async fn promote(&self, plan: &DeploymentPlan) -> Result<String> {
        self.call("promote", plan.key())
    }

    async fn error_rate(&self, _plan: &DeploymentPlan) -> Result<f64> {
        Ok(*self.error_rate.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn rollback(&self, plan: &DeploymentPlan, to: Option<Version>) -> Result<String> {
        let to = to.map(|v| v.to_string()).unwrap_or_else(|| "none".into());
        self.call("rollback", format!("{} -> {}", plan.key(), to))
    }
}
