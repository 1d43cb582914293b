//! Platform that deploys onto the in-process serving router.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use super::plan::DeploymentPlan;
use super::platform::DeploymentPlatform;
use super::step::Slot;
use super::target::DeploymentTarget;
use crate::error::{ModelOpsError, Result};
use crate::registry::VersionRegistry;
use crate::serving::{NewInstance, ServingRouter};
use crate::types::{Environment, Version};

/// Drives the [`ServingRouter`] for one environment.
///
/// Plans for other environments are accepted and reported as skipped, so a
/// single orchestrator can walk staging and production plans while only the
/// served environment touches live instances.
pub struct RouterPlatform {
    router: Arc<ServingRouter>,
    registry: Arc<VersionRegistry>,
    environment: Environment,
}

impl RouterPlatform {
    pub fn new(router: Arc<ServingRouter>, registry: Arc<VersionRegistry>) -> Self {
        Self {
            router,
            registry,
            environment: Environment::Production,
        }
    }

    pub fn serving(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    fn skipped(&self, plan: &DeploymentPlan) -> Option<String> {
        (plan.environment != self.environment).then(|| {
            format!(
                "{} not served here ({} only), nothing to do",
                plan.environment, self.environment
            )
        })
    }
}

#[async_trait]
impl DeploymentPlatform for RouterPlatform {
    async fn build(&self, plan: &DeploymentPlan) -> Result<String> {
        let version = self.registry.get_version(&plan.model_id, &plan.version)?;
        if !self.registry.artifacts().exists(&version.weights_ref) {
            return Err(ModelOpsError::Platform(format!(
                "artifact {} is missing",
                version.weights_ref
            )));
        }
        Ok(format!("artifact {} ready", version.weights_ref))
    }

    async fn test(&self, plan: &DeploymentPlan, slot: Slot) -> Result<String> {
        if let Some(msg) = self.skipped(plan) {
            return Ok(msg);
        }
        if !self.router.has_backend(&plan.model_id) {
            return Err(ModelOpsError::Platform(format!(
                "no inference backend registered for {}",
                plan.model_id
            )));
        }
        if slot == Slot::Secondary {
            let healthy = self.router.healthy_count(&plan.model_id, &plan.version);
            if healthy == 0 {
                return Err(ModelOpsError::Platform(format!(
                    "secondary pool of {} has no healthy instance",
                    plan.key()
                )));
            }
            return Ok(format!("{} healthy instance(s) in secondary pool", healthy));
        }
        Ok(format!("backend for {} present", plan.model_id))
    }

    async fn deploy(
        &self,
        plan: &DeploymentPlan,
        target: &DeploymentTarget,
        slot: Slot,
        traffic_percent: u8,
    ) -> Result<String> {
        if let Some(msg) = self.skipped(plan) {
            return Ok(msg);
        }
        let mut ids = Vec::new();
        for _ in 0..target.resources.replicas.max(1) {
            let mut new = NewInstance::new(plan.model_id.clone(), plan.version).on_target(target.name.clone());
            new.health_check_path = target.health_check_path.clone();
            if let Some(url) = &target.base_url {
                new = new.with_url(url.clone());
            }
            ids.push(self.router.add_instance(new)?.id);
        }
        self.router.probe_instances(&ids).await;
        let healthy = self
            .router
            .instances(&plan.model_id)
            .iter()
            .filter(|i| ids.contains(&i.id) && i.is_healthy())
            .count();
        if healthy == 0 {
            for id in &ids {
                if let Err(e) = self.router.remove_instance(*id) {
                    log::warn!("could not withdraw unhealthy instance {} of {}: {}", id, plan.key(), e);
                }
            }
            return Err(ModelOpsError::Platform(format!(
                "no instance of {} became healthy on {}",
                plan.key(),
                target.name
            )));
        }
        if slot == Slot::Canary {
            self.router.set_canary(&plan.model_id, &plan.version, traffic_percent)?;
        }
        Ok(format!(
            "{}/{} instance(s) healthy on {}",
            healthy,
            ids.len(),
            target.name
        ))
    }

    async fn switch_traffic(&self, plan: &DeploymentPlan) -> Result<String> {
        if let Some(msg) = self.skipped(plan) {
            return Ok(msg);
        }
        self.router.set_canary(&plan.model_id, &plan.version, 100)?;
        Ok(format!("all traffic on {}", plan.key()))
    }

    async fn promote(&self, plan: &DeploymentPlan) -> Result<String> {
        self.switch_traffic(plan).await
    }

    /// Share of the new version's instances failing a fresh health probe, or
    /// the error rate of the traffic they already served when that is higher.
    async fn error_rate(&self, plan: &DeploymentPlan) -> Result<f64> {
        if plan.environment != self.environment {
            return Ok(0.0);
        }
        let ids: Vec<Uuid> = self
            .router
            .instances(&plan.model_id)
            .iter()
            .filter(|i| i.version == plan.version)
            .map(|i| i.id)
            .collect();
        if ids.is_empty() {
            return Err(ModelOpsError::Platform(format!("no instance of {} to measure", plan.key())));
        }
        self.router.probe_instances(&ids).await;
        let probed: Vec<_> = self
            .router
            .instances(&plan.model_id)
            .into_iter()
            .filter(|i| ids.contains(&i.id))
            .collect();
        let failing = probed.iter().filter(|i| i.last_probe_error.is_some()).count();
        let probe_rate = failing as f64 / probed.len().max(1) as f64;
        let served = self.router.version_stats(&plan.model_id, &plan.version);
        let rate = if served.requests > 0 {
            probe_rate.max(served.error_rate())
        } else {
            probe_rate
        };
        log::debug!(
            "{}: {}/{} instance(s) failing probes, {} request(s) served, error rate {:.3}",
            plan.key(),
            failing,
            probed.len(),
            served.requests,
            rate
        );
        Ok(rate)
    }

    async fn rollback(&self, plan: &DeploymentPlan, to: Option<Version>) -> Result<String> {
        if let Some(msg) = self.skipped(plan) {
            return Ok(msg);
        }
        self.router.clear_canary(&plan.model_id);
        if to == Some(plan.version) {
            return Ok(format!("{} kept, it is the restored version", plan.key()));
        }
        let removed = self.router.remove_version_instances(&plan.model_id, &plan.version);
        match to {
            Some(v) => {
                let healthy = self.router.healthy_count(&plan.model_id, &v);
                if healthy == 0 {
                    log::warn!("rollback target {}@{} has no healthy instance", plan.model_id, v);
                }
                Ok(format!(
                    "withdrew {} instance(s) of {}, traffic back on {} ({} healthy)",
                    removed.len(),
                    plan.version,
                    v,
                    healthy
                ))
            }
            None => Ok(format!(
                "withdrew {} instance(s) of {}, no earlier deployment to restore",
                removed.len(),
                plan.version
            )),
        }
    }

    async fn complete(&self, plan: &DeploymentPlan) -> Result<()> {
        if plan.environment == self.environment {
            self.router.clear_canary(&plan.model_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServiceContext;
    use crate::deploy::{
        DeploymentExecution, DeploymentOrchestrator, DeploymentStrategy, ExecutionStatus, OrchestratorConfig,
        StepStatus, TriggerSource,
    };
    use crate::events::EventBus;
    use crate::monitor::{MonitorConfig, PerformanceMonitor};
    use crate::notify::LogNotifier;
    use crate::registry::{InMemoryArtifactStore, RegistryConfig};
    use crate::serving::{HealthProbe, InferenceBackend, ModelInstance, Prediction, ServingConfig};
    use crate::types::{ModelArtifact, ModelMetrics, ModelVersion, VersionMetadata};
    use dashmap::DashMap;
    use serde_json::{json, Value};

    /// Passes each instance's first probe; later probes fail once `crashed` is set.
    /// `dead` instances never pass.
    #[derive(Default)]
    struct CrashAfterStart {
        crashed: bool,
        dead: bool,
        seen: DashMap<Uuid, u32>,
    }

    #[async_trait]
    impl HealthProbe for CrashAfterStart {
        async fn probe(&self, instance: &ModelInstance) -> Result<()> {
            let mut n = self.seen.entry(instance.id).or_insert(0);
            *n += 1;
            if self.dead || (self.crashed && *n > 1) {
                return Err(ModelOpsError::Platform(format!("{} exited", instance.key())));
            }
            Ok(())
        }
    }

    struct Constant;

    #[async_trait]
    impl InferenceBackend for Constant {
        async fn predict(
            &self,
            _version: &ModelVersion,
            _instance: &ModelInstance,
            _input: &Value,
            _explain: bool,
        ) -> Result<Prediction> {
            Ok(Prediction::new(json!(1)))
        }
    }

    struct Fixture {
        registry: Arc<VersionRegistry>,
        router: Arc<ServingRouter>,
        orchestrator: DeploymentOrchestrator,
    }

    fn fixture(probe: CrashAfterStart) -> Fixture {
        let events = EventBus::new();
        let ctx = ServiceContext::new(events.clone(), Arc::new(LogNotifier));
        let registry = Arc::new(VersionRegistry::new(
            RegistryConfig::default(),
            Arc::new(InMemoryArtifactStore::new()),
            events,
        ));
        let monitor = Arc::new(PerformanceMonitor::new(MonitorConfig::default(), ctx.clone()));
        let router = Arc::new(ServingRouter::new(
            ServingConfig::default(),
            registry.clone(),
            monitor,
            Arc::new(probe),
            ctx.clone(),
        ));
        router.register_backend("churn", Arc::new(Constant));
        let orchestrator = DeploymentOrchestrator::new(
            OrchestratorConfig::default(),
            registry.clone(),
            Arc::new(RouterPlatform::new(router.clone(), registry.clone())),
            ctx,
        );
        Fixture {
            registry,
            router,
            orchestrator,
        }
    }

    async fn release(f: &Fixture) -> (Version, DeploymentExecution) {
        let v = f
            .registry
            .register(
                "churn",
                ModelArtifact {
                    config: json!({}),
                    weights: vec![3; 8],
                    metrics: ModelMetrics::new(0.95, 0.1, 0.95),
                },
                VersionMetadata::new("test"),
            )
            .unwrap()
            .version;
        let plan = f
            .orchestrator
            .create_deployment_plan(
                "churn",
                v,
                Environment::Production,
                DeploymentStrategy::Immediate,
                TriggerSource::Manual,
                "release",
            )
            .unwrap();
        f.orchestrator.approve_deployment(plan.id, "dana").unwrap();
        (v, f.orchestrator.execute_deployment(plan.id).await.unwrap())
    }

    #[tokio::test]
    async fn healthy_release_reports_zero_error_rate() {
        let f = fixture(CrashAfterStart::default());
        let (v, exec) = release(&f).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.metrics.observed_error_rate, Some(0.0));
        assert_eq!(f.router.healthy_count("churn", &v), 6);
    }

    #[tokio::test]
    async fn crashing_instances_fail_the_monitor_step() {
        let f = fixture(CrashAfterStart {
            crashed: true,
            ..Default::default()
        });
        let (v, exec) = release(&f).await;

        let monitor = exec.steps.iter().find(|s| s.name == "monitor").unwrap();
        assert_eq!(monitor.status, StepStatus::Failed);
        assert!(monitor.error.as_deref().unwrap().contains("above rollback threshold"));
        assert_eq!(exec.failure.as_ref().unwrap().step, "monitor");
        assert_eq!(exec.metrics.observed_error_rate, Some(1.0));
        assert_eq!(exec.status, ExecutionStatus::RolledBack);
        assert!(f.registry.current_deployment("churn", Environment::Production).is_none());
        assert_eq!(f.router.healthy_count("churn", &v), 0);
    }

    #[tokio::test]
    async fn unhealthy_instances_are_withdrawn_when_deploy_fails() {
        let f = fixture(CrashAfterStart {
            dead: true,
            ..Default::default()
        });
        let (_, exec) = release(&f).await;

        assert_eq!(exec.failure.as_ref().unwrap().step, "deploy");
        assert!(exec.failure_summary().unwrap().contains("became healthy"));
        assert!(f.router.instances("churn").is_empty());
    }
}
