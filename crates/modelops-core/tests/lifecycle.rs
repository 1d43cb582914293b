//! End-to-end lifecycle through the wired control plane.

use async_trait::async_trait;
use modelops_core::deploy::PlanState;
use modelops_core::serving::InferenceRequest;
use modelops_core::{
    DeploymentStrategy, Environment, InferenceBackend, ModelArtifact, ModelInstance, ModelMetrics, ModelOps,
    ModelOpsConfig, ModelVersion, Notifier, Prediction, PredictionSample, RecordingNotifier, ScheduleOutcome, Version,
    VersionMetadata, VersionStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct VersionEcho;

#[async_trait]
impl InferenceBackend for VersionEcho {
    async fn predict(
        &self,
        version: &ModelVersion,
        _instance: &ModelInstance,
        _input: &Value,
        _explain: bool,
    ) -> modelops_core::Result<Prediction> {
        Ok(Prediction::new(json!(version.version.to_string())).with_confidence(0.9))
    }
}

fn artifact(accuracy: f64) -> ModelArtifact {
    ModelArtifact {
        config: json!({"layers": 3}),
        weights: vec![7; 32],
        metrics: ModelMetrics::new(accuracy, 0.2, accuracy - 0.02),
    }
}

async fn wait_for(ops: &ModelOps, plan_id: Uuid, state: PlanState) {
    for _ in 0..400 {
        if ops.orchestrator().get_plan(plan_id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "plan {} never reached {:?}: {:?}",
        plan_id,
        state,
        ops.orchestrator().get_plan(plan_id).unwrap().state
    );
}

async fn deploy_to_production(ops: &ModelOps, version: Version) {
    let (plan, outcome) = ops
        .deploy("churn", version, Environment::Production, DeploymentStrategy::Immediate, "release")
        .unwrap();
    assert_eq!(outcome, ScheduleOutcome::AwaitingApproval);
    let started = ops.orchestrator().approve_and_schedule(plan.id, "release-manager").unwrap();
    assert!(matches!(started, ScheduleOutcome::Started { .. }));
    wait_for(ops, plan.id, PlanState::Completed).await;
}

#[tokio::test]
async fn release_serve_degrade_and_roll_back() {
    let notifier = Arc::new(RecordingNotifier::new());
    let ops = ModelOps::builder(ModelOpsConfig::default())
        .notifier(notifier.clone() as Arc<dyn Notifier>)
        .build()
        .unwrap();
    let tasks = ops.spawn_background();
    ops.router().register_backend("churn", Arc::new(VersionEcho));

    let v1 = ops
        .registry()
        .register("churn", artifact(0.93), VersionMetadata::new("nightly"))
        .unwrap()
        .version;
    let v2 = ops
        .registry()
        .register("churn", artifact(0.95), VersionMetadata::new("nightly"))
        .unwrap()
        .version;

    // Nothing deployed yet.
    let err = ops.predict(InferenceRequest::new("churn", json!({"tenure": 4}))).await.unwrap_err();
    assert_eq!(err.kind(), "model_not_available");

    deploy_to_production(&ops, v1).await;
    assert_eq!(
        ops.registry().get_version("churn", &v1).unwrap().status,
        VersionStatus::Production
    );
    let served = ops.predict(InferenceRequest::new("churn", json!({"tenure": 4}))).await.unwrap();
    assert_eq!(served.model_version, v1);
    assert_eq!(served.prediction, json!(v1.to_string()));

    deploy_to_production(&ops, v2).await;
    let served = ops.predict(InferenceRequest::new("churn", json!({"tenure": 5}))).await.unwrap();
    assert_eq!(served.model_version, v2);

    // Ground truth arrives and v2 turns out to be wrong every time.
    for i in 0..ops.config().monitor.min_samples_for_alert {
        let sample = PredictionSample::new(json!({"tenure": i}), json!(1), 20.0).with_ground_truth(json!(0));
        ops.monitor().record_prediction("churn", sample).unwrap();
    }
    assert!(!ops.monitor().alerts("churn").is_empty());

    let mut rollback = None;
    for _ in 0..400 {
        rollback = ops
            .orchestrator()
            .list_plans()
            .into_iter()
            .find(|p| p.plan.version == v1 && p.state == PlanState::Completed && !p.plan.approval_required);
        if rollback.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(rollback.is_some(), "no automatic rollback completed");
    let restored = ops.registry().current_deployment("churn", Environment::Production).unwrap();
    assert_eq!(restored.version, v1);
    assert_eq!(restored.rolled_back_from, Some(v2));
    let served = ops.predict(InferenceRequest::new("churn", json!({"tenure": 6}))).await.unwrap();
    assert_eq!(served.model_version, v1);
    assert!(notifier.count_for("ml-alerts") > 0);

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn staging_release_needs_no_approval() {
    let ops = ModelOps::builder(ModelOpsConfig::default()).build().unwrap();
    ops.router().register_backend("churn", Arc::new(VersionEcho));
    let v1 = ops
        .registry()
        .register("churn", artifact(0.88), VersionMetadata::new("nightly"))
        .unwrap()
        .version;

    let (plan, outcome) = ops
        .deploy("churn", v1, Environment::Staging, DeploymentStrategy::Immediate, "smoke")
        .unwrap();
    assert!(!plan.approval_required);
    assert!(matches!(outcome, ScheduleOutcome::Started { .. }));
    wait_for(&ops, plan.id, PlanState::Completed).await;
    assert_eq!(
        ops.registry().get_version("churn", &v1).unwrap().status,
        VersionStatus::Staging
    );
    // Staging deployments do not serve production traffic.
    assert!(ops.predict(InferenceRequest::new("churn", json!({}))).await.is_err());
}

#[tokio::test]
async fn production_release_below_threshold_fails_validation() {
    let ops = ModelOps::builder(ModelOpsConfig::default()).build().unwrap();
    ops.router().register_backend("churn", Arc::new(VersionEcho));
    let v1 = ops
        .registry()
        .register("churn", artifact(0.86), VersionMetadata::new("nightly"))
        .unwrap()
        .version;

    let (plan, _) = ops
        .deploy("churn", v1, Environment::Production, DeploymentStrategy::Immediate, "too early")
        .unwrap();
    ops.orchestrator().approve_deployment(plan.id, "ops").unwrap();
    let exec = ops.orchestrator().execute_deployment(plan.id).await.unwrap();
    let failure = exec.failure.unwrap();
    assert_eq!(failure.step, "validate");
    assert!(failure.message.contains("0.86"));
    assert_eq!(ops.orchestrator().get_plan(plan.id).unwrap().state, PlanState::Failed);
    assert!(ops.registry().current_deployment("churn", Environment::Production).is_none());
}
