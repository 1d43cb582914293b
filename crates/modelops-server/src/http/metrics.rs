use modelops_core::serving::InstanceHealth;
use modelops_core::{Envelope, ModelOps, ModelOpsEvent};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::collections::HashMap;

// ── Label types ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InferenceLabel {
    pub model: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModelLabel {
    pub model: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AlertLabel {
    pub model: String,
    pub kind: String,
}

// ── Metrics registry ───────────────────────────────────────────────────────────

pub struct ModelOpsMetrics {
    pub registry: Registry,

    // Serving
    pub inference_requests: Family<InferenceLabel, Counter>,
    pub inference_duration: Family<ModelLabel, Histogram>,
    pub healthy_instances: Family<ModelLabel, Gauge>,

    // Lifecycle, fed from the event bus
    pub deployments: Family<StatusLabel, Counter>,
    pub alerts: Family<AlertLabel, Counter>,
    pub retrain_runs: Family<StatusLabel, Counter>,
    pub versions_registered: Counter,

    pub model_count: Gauge,
    pub uptime_seconds: Gauge,
}

impl ModelOpsMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let inference_requests: Family<InferenceLabel, Counter> = Family::default();
        registry.register(
            "modelops_inference_requests_total",
            "Inference requests by model and outcome",
            inference_requests.clone(),
        );

        let inference_duration: Family<ModelLabel, Histogram> = Family::new_with_constructor(|| {
            Histogram::new([0.005_f64, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0].into_iter())
        });
        registry.register(
            "modelops_inference_duration_seconds",
            "End-to-end inference latency in seconds",
            inference_duration.clone(),
        );

        let healthy_instances: Family<ModelLabel, Gauge> = Family::default();
        registry.register(
            "modelops_healthy_instances",
            "Healthy serving instances per model",
            healthy_instances.clone(),
        );

        let deployments: Family<StatusLabel, Counter> = Family::default();
        registry.register(
            "modelops_deployments_total",
            "Deployment executions by terminal status",
            deployments.clone(),
        );

        let alerts: Family<AlertLabel, Counter> = Family::default();
        registry.register(
            "modelops_alerts_total",
            "Monitor alerts by model and kind",
            alerts.clone(),
        );

        let retrain_runs: Family<StatusLabel, Counter> = Family::default();
        registry.register(
            "modelops_retrain_runs_total",
            "Retraining runs by outcome",
            retrain_runs.clone(),
        );

        let versions_registered: Counter = Counter::default();
        registry.register(
            "modelops_versions_registered_total",
            "Model versions registered",
            versions_registered.clone(),
        );

        let model_count: Gauge = Gauge::default();
        registry.register("modelops_models", "Models known to the registry", model_count.clone());

        let uptime_seconds: Gauge = Gauge::default();
        registry.register(
            "modelops_uptime_seconds",
            "Server uptime in seconds",
            uptime_seconds.clone(),
        );

        Self {
            registry,
            inference_requests,
            inference_duration,
            healthy_instances,
            deployments,
            alerts,
            retrain_runs,
            versions_registered,
            model_count,
            uptime_seconds,
        }
    }

    pub fn record_inference(&self, model: &str, outcome: &str, seconds: f64) {
        self.inference_requests
            .get_or_create(&InferenceLabel {
                model: model.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.inference_duration
            .get_or_create(&ModelLabel {
                model: model.to_string(),
            })
            .observe(seconds);
    }

    /// Count one bus event.
    pub fn observe(&self, envelope: &Envelope) {
        let status = |s: &str| StatusLabel { status: s.to_string() };
        match &envelope.event {
            ModelOpsEvent::DeploymentCompleted { .. } => {
                self.deployments.get_or_create(&status("completed")).inc();
            }
            ModelOpsEvent::DeploymentFailed { .. } => {
                self.deployments.get_or_create(&status("failed")).inc();
            }
            ModelOpsEvent::DeploymentRolledBack { .. } => {
                self.deployments.get_or_create(&status("rolled_back")).inc();
            }
            ModelOpsEvent::PerformanceDegraded { model_id, alert } | ModelOpsEvent::DriftDetected { model_id, alert } => {
                self.alerts
                    .get_or_create(&AlertLabel {
                        model: model_id.clone(),
                        kind: alert.kind.as_str().to_string(),
                    })
                    .inc();
            }
            ModelOpsEvent::RetrainCompleted { .. } => {
                self.retrain_runs.get_or_create(&status("completed")).inc();
            }
            ModelOpsEvent::RetrainRejected { .. } => {
                self.retrain_runs.get_or_create(&status("rejected")).inc();
            }
            ModelOpsEvent::VersionRegistered { .. } => {
                self.versions_registered.inc();
            }
            _ => {}
        }
    }

    /// Refresh scrape-time gauges and encode the registry as text.
    pub fn render(&self, ops: &ModelOps, uptime_secs: u64) -> anyhow::Result<String> {
        let models = ops.registry().list_models();
        self.model_count.set(models.len() as i64);
        self.uptime_seconds.set(uptime_secs as i64);

        let mut healthy: HashMap<String, i64> = models.into_iter().map(|m| (m, 0)).collect();
        for instance in ops.router().all_instances() {
            let count = healthy.entry(instance.model_id.clone()).or_insert(0);
            if instance.health == InstanceHealth::Healthy {
                *count += 1;
            }
        }
        for (model, count) in healthy {
            self.healthy_instances.get_or_create(&ModelLabel { model }).set(count);
        }

        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }
}
