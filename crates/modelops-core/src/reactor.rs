//! Automated responses to lifecycle events.
//!
//! The reactor subscribes to the event bus and turns monitor alerts into
//! emergency rollback plans and retraining runs, and finished retraining into
//! deployment plans.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::deploy::{DeploymentOrchestrator, DeploymentStrategy, ScheduleOutcome, TriggerSource};
use crate::error::Result;
use crate::events::{Envelope, ModelOpsEvent};
use crate::retrain::RetrainTrigger;
use crate::types::Environment;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactionConfig {
    /// Plan a return to the previous production version on performance alerts.
    pub rollback_on_degradation: bool,
    /// Start a (non-forced) retrain on performance and drift alerts.
    pub retrain_on_alert: bool,
    /// Plan a deployment of every auto-trained version.
    pub deploy_after_retrain: bool,
    pub retrain_environment: Environment,
    pub retrain_strategy: DeploymentStrategy,
}

impl Default for ReactionConfig {
    fn default() -> Self {
        Self {
            rollback_on_degradation: true,
            retrain_on_alert: true,
            deploy_after_retrain: false,
            retrain_environment: Environment::Staging,
            retrain_strategy: DeploymentStrategy::Immediate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reaction", rename_all = "snake_case")]
pub enum Reaction {
    RollbackPlanned { plan_id: Uuid, outcome: ScheduleOutcome },
    DeploymentPlanned { plan_id: Uuid, outcome: ScheduleOutcome },
    RetrainStarted { model_id: String },
}

pub struct Reactor {
    orchestrator: Arc<DeploymentOrchestrator>,
    retrain: Option<Arc<RetrainTrigger>>,
    config: ReactionConfig,
}

impl Reactor {
    pub fn new(config: ReactionConfig, orchestrator: Arc<DeploymentOrchestrator>) -> Self {
        Self {
            orchestrator,
            retrain: None,
            config,
        }
    }

    pub fn with_retrain(mut self, retrain: Arc<RetrainTrigger>) -> Self {
        self.retrain = Some(retrain);
        self
    }

    /// React to one event. Events without a configured response yield nothing.
    pub fn handle(&self, envelope: &Envelope) -> Result<Vec<Reaction>> {
        let mut reactions = Vec::new();
        match &envelope.event {
            ModelOpsEvent::PerformanceDegraded { model_id, alert } => {
                if self.config.rollback_on_degradation {
                    let reason = format!("automatic rollback: {}", alert.message);
                    if let Some(plan) = self.orchestrator.create_rollback_plan(model_id, &reason)? {
                        let outcome = self.orchestrator.schedule_deployment(&plan)?;
                        log::warn!("{}: rollback plan {} ({:?})", model_id, plan.id, outcome);
                        reactions.push(Reaction::RollbackPlanned {
                            plan_id: plan.id,
                            outcome,
                        });
                    }
                }
                reactions.extend(self.spawn_retrain(model_id));
            }
            ModelOpsEvent::DriftDetected { model_id, .. } => {
                reactions.extend(self.spawn_retrain(model_id));
            }
            ModelOpsEvent::RetrainCompleted {
                model_id, version, ..
            } if self.config.deploy_after_retrain => {
                let plan = self.orchestrator.create_deployment_plan(
                    model_id,
                    *version,
                    self.config.retrain_environment,
                    self.config.retrain_strategy,
                    TriggerSource::Retrain,
                    "auto-trained version",
                )?;
                let outcome = self.orchestrator.schedule_deployment(&plan)?;
                log::info!("{}@{}: deployment plan {} ({:?})", model_id, version, plan.id, outcome);
                reactions.push(Reaction::DeploymentPlanned {
                    plan_id: plan.id,
                    outcome,
                });
            }
            _ => {}
        }
        Ok(reactions)
    }

    fn spawn_retrain(&self, model_id: &str) -> Option<Reaction> {
        if !self.config.retrain_on_alert {
            return None;
        }
        let retrain = self.retrain.as_ref()?;
        if retrain.policy(model_id).is_none() || retrain.is_running(model_id) {
            return None;
        }
        let retrain = Arc::clone(retrain);
        let model = model_id.to_string();
        tokio::spawn(async move {
            match retrain.trigger(&model, false).await {
                Ok(outcome) => log::info!("alert-driven retrain of {}: {}", model, outcome.status.as_str()),
                Err(e) => log::warn!("alert-driven retrain of {} not run: {}", model, e),
            }
        });
        Some(Reaction::RetrainStarted {
            model_id: model_id.to_string(),
        })
    }

    /// Consume events until the bus closes.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<Envelope>) {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if let Err(e) = self.handle(&envelope) {
                        log::error!("reaction to {} for {} failed: {}", envelope.topic, envelope.event.model_id(), e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("reactor lagged, {} event(s) dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServiceContext;
    use crate::deploy::{ExecutionStatus, OrchestratorConfig, PlanState, ScriptedPlatform};
    use crate::events::EventBus;
    use crate::monitor::{Alert, AlertKind};
    use crate::notify::LogNotifier;
    use crate::registry::{InMemoryArtifactStore, RegistryConfig, VersionRegistry};
    use crate::types::{ModelArtifact, ModelMetrics, Version, VersionMetadata};
    use chrono::Utc;

    fn setup(config: ReactionConfig) -> (Arc<VersionRegistry>, Arc<DeploymentOrchestrator>, Reactor) {
        let events = EventBus::new();
        let registry = Arc::new(VersionRegistry::new(
            RegistryConfig::default(),
            Arc::new(InMemoryArtifactStore::new()),
            events.clone(),
        ));
        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            OrchestratorConfig::default(),
            registry.clone(),
            Arc::new(ScriptedPlatform::new()),
            ServiceContext::new(events, Arc::new(LogNotifier)),
        ));
        let reactor = Reactor::new(config, orchestrator.clone());
        (registry, orchestrator, reactor)
    }

    fn register(registry: &VersionRegistry) -> Version {
        registry
            .register(
                "m",
                ModelArtifact {
                    config: serde_json::json!({}),
                    weights: vec![1; 4],
                    metrics: ModelMetrics::new(0.95, 0.1, 0.9),
                },
                VersionMetadata::new("t"),
            )
            .unwrap()
            .version
    }

    fn envelope(event: ModelOpsEvent) -> Envelope {
        Envelope {
            topic: event.topic().to_string(),
            published_at: Utc::now(),
            event,
        }
    }

    fn degraded() -> Envelope {
        envelope(ModelOpsEvent::PerformanceDegraded {
            model_id: "m".into(),
            alert: Alert {
                id: Uuid::now_v7(),
                model_id: "m".into(),
                kind: AlertKind::Accuracy,
                value: 0.4,
                threshold: 0.8,
                message: "accuracy 0.40 below 0.80".into(),
                raised_at: Utc::now(),
            },
        })
    }

    async fn deploy(orchestrator: &Arc<DeploymentOrchestrator>, v: Version) {
        let plan = orchestrator
            .create_deployment_plan(
                "m",
                v,
                Environment::Production,
                DeploymentStrategy::Immediate,
                TriggerSource::Manual,
                "",
            )
            .unwrap();
        orchestrator.approve_deployment(plan.id, "ops").unwrap();
        let exec = orchestrator.execute_deployment(plan.id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn degradation_starts_rollback_without_approval() {
        let (registry, orchestrator, reactor) = setup(ReactionConfig::default());
        let v1 = register(&registry);
        let v2 = register(&registry);
        deploy(&orchestrator, v1).await;
        deploy(&orchestrator, v2).await;

        let reactions = reactor.handle(&degraded()).unwrap();
        let plan_id = match &reactions[..] {
            [Reaction::RollbackPlanned {
                plan_id,
                outcome: ScheduleOutcome::Started { .. },
            }] => *plan_id,
            other => panic!("unexpected reactions {:?}", other),
        };
        let view = orchestrator.get_plan(plan_id).unwrap();
        assert_eq!(view.plan.version, v1);
        assert!(!view.plan.approval_required);

        for _ in 0..200 {
            if orchestrator.get_plan(plan_id).unwrap().state == PlanState::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            registry.current_deployment("m", Environment::Production).unwrap().version,
            v1
        );
    }

    #[tokio::test]
    async fn nothing_to_roll_back_to_is_a_no_op() {
        let (_registry, _orchestrator, reactor) = setup(ReactionConfig::default());
        assert!(reactor.handle(&degraded()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn retrained_versions_are_planned_when_enabled() {
        let (registry, orchestrator, reactor) = setup(ReactionConfig {
            deploy_after_retrain: true,
            ..Default::default()
        });
        let v = register(&registry);
        let event = envelope(ModelOpsEvent::RetrainCompleted {
            model_id: "m".into(),
            version: v,
            metrics: ModelMetrics::new(0.95, 0.1, 0.9),
        });
        let reactions = reactor.handle(&event).unwrap();
        assert_eq!(reactions.len(), 1);
        let plans = orchestrator.list_plans();
        assert_eq!(plans[0].plan.environment, Environment::Staging);
        assert_eq!(plans[0].plan.triggered_by, TriggerSource::Retrain);
    }

    #[tokio::test]
    async fn retrain_completion_ignored_by_default() {
        let (registry, orchestrator, reactor) = setup(ReactionConfig::default());
        let v = register(&registry);
        let event = envelope(ModelOpsEvent::RetrainCompleted {
            model_id: "m".into(),
            version: v,
            metrics: ModelMetrics::new(0.95, 0.1, 0.9),
        });
        assert!(reactor.handle(&event).unwrap().is_empty());
        assert!(orchestrator.list_plans().is_empty());
    }
}
