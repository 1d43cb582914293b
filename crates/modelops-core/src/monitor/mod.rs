//! Performance and drift monitoring with cooldown-limited alerting.

mod alerts;
mod drift;
mod metrics;

pub use alerts::{breaches, Alert, AlertConfig, AlertKind, AlertThresholds};
pub use drift::{extract_features, FeatureStats, FeatureVector, ReferenceDistribution};
pub use metrics::{
    aggregate, score_prediction, DriftPoint, MetricPoint, ModelPerformance, PredictionSample, TimeRange,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::context::ServiceContext;
use crate::error::{ModelOpsError, Result};
use crate::events::ModelOpsEvent;
use crate::notify::notify_all;
use crate::store::KeyedStore;
use crate::types::ModelId;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Window used for alert evaluation and default performance queries.
    pub rolling_window_secs: u64,
    /// Samples older than this are purged by the retention sweep.
    pub retention_days: u64,
    /// How often the retention sweep runs.
    pub retention_sweep_secs: u64,
    /// Hard cap on stored samples per model; the oldest are dropped first.
    pub max_samples_per_model: usize,
    /// Number of recent inputs compared against the reference distribution.
    pub drift_window: usize,
    /// Inputs captured as the reference when none was set explicitly.
    pub reference_sample_size: usize,
    /// Minimum samples in the rolling window before alert rules run.
    pub min_samples_for_alert: usize,
    /// Relative tolerance under which a numeric prediction counts as correct.
    pub regression_tolerance: f64,
    pub alert_history_limit: usize,
    /// Alert rules for models without an explicit configuration.
    pub default_alerts: AlertConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            rolling_window_secs: 3600,
            retention_days: 30,
            retention_sweep_secs: 3600,
            max_samples_per_model: 10_000,
            drift_window: 100,
            reference_sample_size: 100,
            min_samples_for_alert: 10,
            regression_tolerance: 0.05,
            alert_history_limit: 200,
            default_alerts: AlertConfig::default(),
        }
    }
}

// ── Per-model state ───────────────────────────────────────────────────────────

#[derive(Default)]
struct ModelState {
    points: VecDeque<MetricPoint>,
    drift: VecDeque<DriftPoint>,
    reference: Option<ReferenceDistribution>,
    /// Inputs collected while no reference exists yet.
    pending_reference: Vec<FeatureVector>,
    recent_inputs: VecDeque<FeatureVector>,
    alert_config: Option<AlertConfig>,
    last_alert_at: Option<DateTime<Utc>>,
    alerts: VecDeque<Alert>,
}

impl ModelState {
    fn latest_drift(&self) -> f64 {
        self.drift.back().map(|d| d.score).unwrap_or(0.0)
    }
}

// ── Monitor ───────────────────────────────────────────────────────────────────

pub struct PerformanceMonitor {
    models: KeyedStore<ModelId, ModelState>,
    config: MonitorConfig,
    ctx: ServiceContext,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig, ctx: ServiceContext) -> Self {
        Self {
            models: KeyedStore::new(),
            config,
            ctx,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn rolling_window(&self, now: DateTime<Utc>) -> TimeRange {
        TimeRange::new(now - secs(self.config.rolling_window_secs), now)
    }

    /// Record one prediction and evaluate alert rules. Returns the alerts raised.
    pub fn record_prediction(&self, model_id: &str, sample: PredictionSample) -> Result<Vec<Alert>> {
        self.record_prediction_at(model_id, sample, Utc::now())
    }

    pub fn record_prediction_at(
        &self,
        model_id: &str,
        sample: PredictionSample,
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        if model_id.is_empty() {
            return Err(ModelOpsError::Validation("model id is empty".into()));
        }
        let (mut accuracy, mut loss) = if sample.is_failure() {
            (0.0, 1.0)
        } else {
            score_prediction(
                &sample.output,
                sample.ground_truth.as_ref(),
                self.config.regression_tolerance,
            )
        };
        if !loss.is_finite() || !accuracy.is_finite() {
            log::warn!(
                "non-finite metrics for {} (accuracy {}, loss {}); recording as incorrect",
                model_id,
                accuracy,
                loss
            );
            accuracy = 0.0;
            loss = 1.0;
        }
        let features = extract_features(&sample.input);
        if features.is_empty() {
            log::debug!("input for {} has no numeric features; drift not updated", model_id);
        }

        let window = self.rolling_window(now);
        let config = &self.config;
        let raised = self.models.with_or_insert(model_id.to_string(), ModelState::default, |state| {
            state.points.push_back(MetricPoint {
                recorded_at: now,
                accuracy,
                loss,
                latency_ms: sample.latency_ms,
                memory_bytes: sample.memory_bytes,
                failed: sample.is_failure(),
            });
            while state.points.len() > config.max_samples_per_model {
                state.points.pop_front();
            }

            if !features.is_empty() {
                update_drift(state, features, config, now);
            }

            // Threshold check and cooldown update happen under the model lock.
            let alert_config = state
                .alert_config
                .clone()
                .unwrap_or_else(|| config.default_alerts.clone());
            let perf = aggregate(model_id, state.points.iter(), state.latest_drift(), window);
            if perf.sample_count < config.min_samples_for_alert {
                return Vec::new();
            }
            let alerts = breaches(&perf, &alert_config.thresholds, now);
            if alerts.is_empty() {
                return Vec::new();
            }
            if let Some(last) = state.last_alert_at {
                if now - last < alert_config.cooldown() {
                    log::debug!("alerts for {} suppressed by cooldown", model_id);
                    return Vec::new();
                }
            }
            state.last_alert_at = Some(now);
            for alert in &alerts {
                state.alerts.push_back(alert.clone());
            }
            while state.alerts.len() > config.alert_history_limit {
                state.alerts.pop_front();
            }
            alerts
                .into_iter()
                .map(|a| (a, alert_config.channels.clone()))
                .collect::<Vec<_>>()
        });

        let mut out = Vec::with_capacity(raised.len());
        for (alert, channels) in raised {
            log::warn!("alert for {}: {}", model_id, alert.message);
            notify_all(self.ctx.notifier.as_ref(), &channels, &alert.notification());
            let event = if alert.kind.is_performance() {
                ModelOpsEvent::PerformanceDegraded {
                    model_id: model_id.to_string(),
                    alert: alert.clone(),
                }
            } else {
                ModelOpsEvent::DriftDetected {
                    model_id: model_id.to_string(),
                    alert: alert.clone(),
                }
            };
            self.ctx.events.publish(event);
            out.push(alert);
        }
        Ok(out)
    }

    /// Averaged metrics over `range`, or over the rolling window when `None`.
    pub fn get_model_performance(&self, model_id: &str, range: Option<TimeRange>) -> ModelPerformance {
        self.get_model_performance_at(model_id, range, Utc::now())
    }

    pub fn get_model_performance_at(
        &self,
        model_id: &str,
        range: Option<TimeRange>,
        now: DateTime<Utc>,
    ) -> ModelPerformance {
        let window = range.unwrap_or_else(|| self.rolling_window(now));
        self.models
            .with(&model_id.to_string(), |state| {
                aggregate(model_id, state.points.iter(), state.latest_drift(), window)
            })
            .unwrap_or_else(|| ModelPerformance::empty(model_id, window))
    }

    /// Most recent drift score, 0 when none has been computed.
    pub fn get_data_drift(&self, model_id: &str) -> f64 {
        self.models
            .with(&model_id.to_string(), |state| state.latest_drift())
            .unwrap_or(0.0)
    }

    pub fn drift_history(&self, model_id: &str) -> Vec<DriftPoint> {
        self.models
            .with(&model_id.to_string(), |state| state.drift.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn set_alert_config(&self, model_id: &str, config: AlertConfig) {
        self.models.with_or_insert(model_id.to_string(), ModelState::default, |state| {
            state.alert_config = Some(config);
        });
    }

    pub fn alert_config(&self, model_id: &str) -> AlertConfig {
        self.models
            .with(&model_id.to_string(), |state| state.alert_config.clone())
            .flatten()
            .unwrap_or_else(|| self.config.default_alerts.clone())
    }

    /// Replace the reference distribution drift is measured against.
    pub fn set_reference(&self, model_id: &str, reference: ReferenceDistribution) {
        self.models.with_or_insert(model_id.to_string(), ModelState::default, |state| {
            state.reference = Some(reference);
            state.pending_reference.clear();
        });
    }

    pub fn reference(&self, model_id: &str) -> Option<ReferenceDistribution> {
        self.models
            .with(&model_id.to_string(), |state| state.reference.clone())
            .flatten()
    }

    /// Alerts raised for a model, oldest first.
    pub fn alerts(&self, model_id: &str) -> Vec<Alert> {
        self.models
            .with(&model_id.to_string(), |state| state.alerts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn models(&self) -> Vec<ModelId> {
        let mut ids = self.models.keys();
        ids.sort();
        ids
    }

    /// Drop samples older than the retention window. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(self.config.retention_days.min(36_500) as i64);
        let mut removed = 0;
        for model_id in self.models.keys() {
            removed += self
                .models
                .with(&model_id, |state| {
                    let before = state.points.len() + state.drift.len();
                    state.points.retain(|p| p.recorded_at >= cutoff);
                    state.drift.retain(|d| d.recorded_at >= cutoff);
                    before - state.points.len() - state.drift.len()
                })
                .unwrap_or(0);
        }
        if removed > 0 {
            log::info!("retention sweep removed {} monitor samples", removed);
        }
        removed
    }

    /// Run `purge_expired` on the configured interval until aborted.
    pub async fn run_retention_loop(self: std::sync::Arc<Self>) {
        let period = std::time::Duration::from_secs(self.config.retention_sweep_secs.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.purge_expired(Utc::now());
        }
    }
}

fn update_drift(state: &mut ModelState, features: FeatureVector, config: &MonitorConfig, now: DateTime<Utc>) {
    state.recent_inputs.push_back(features.clone());
    while state.recent_inputs.len() > config.drift_window.max(1) {
        state.recent_inputs.pop_front();
    }

    match &state.reference {
        Some(reference) => {
            let score = reference.score(state.recent_inputs.iter());
            if score.is_finite() {
                state.drift.push_back(DriftPoint { recorded_at: now, score });
                while state.drift.len() > config.max_samples_per_model {
                    state.drift.pop_front();
                }
            } else {
                log::warn!("drift score is not finite; sample skipped");
            }
        }
        None => {
            state.pending_reference.push(features);
            if state.pending_reference.len() >= config.reference_sample_size.max(1) {
                let reference = ReferenceDistribution::from_samples(&state.pending_reference);
                log::info!(
                    "captured reference distribution over {} features from {} inputs",
                    reference.features.len(),
                    reference.sample_count
                );
                state.reference = Some(reference);
                state.pending_reference.clear();
            }
        }
    }
}

fn secs(s: u64) -> Duration {
    Duration::seconds(s.min(i64::MAX as u64 / 1000) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::topics;
    use crate::notify::RecordingNotifier;
    use serde_json::json;
    use std::sync::Arc;

    fn monitor(config: MonitorConfig) -> (PerformanceMonitor, RecordingNotifier, ServiceContext) {
        let notifier = RecordingNotifier::new();
        let ctx = ServiceContext::new(crate::events::EventBus::new(), Arc::new(notifier.clone()));
        (PerformanceMonitor::new(config, ctx.clone()), notifier, ctx)
    }

    fn wrong() -> PredictionSample {
        PredictionSample::new(json!({"x": 1.0}), json!("yes"), 12.0).with_ground_truth(json!("no"))
    }

    fn right() -> PredictionSample {
        PredictionSample::new(json!({"x": 1.0}), json!("yes"), 12.0).with_ground_truth(json!("yes"))
    }

    #[test]
    fn unknown_model_reports_zeroed_metrics() {
        let (m, _, _) = monitor(MonitorConfig::default());
        let perf = m.get_model_performance("nope", None);
        assert_eq!(perf.sample_count, 0);
        assert_eq!(perf.accuracy, 0.0);
        assert_eq!(m.get_data_drift("nope"), 0.0);
    }

    #[test]
    fn samples_without_truth_are_assumed_correct() {
        let (m, _, _) = monitor(MonitorConfig::default());
        for _ in 0..5 {
            m.record_prediction("m", PredictionSample::new(json!(1), json!(2), 10.0))
                .unwrap();
        }
        let perf = m.get_model_performance("m", None);
        assert_eq!(perf.sample_count, 5);
        assert_eq!(perf.accuracy, 1.0);
        assert_eq!(perf.latency_ms, 10.0);
    }

    #[test]
    fn alerts_wait_for_minimum_samples() {
        let (m, notifier, _) = monitor(MonitorConfig::default());
        let now = Utc::now();
        for i in 0..9 {
            let raised = m.record_prediction_at("m", wrong(), now + Duration::seconds(i)).unwrap();
            assert!(raised.is_empty());
        }
        let raised = m.record_prediction_at("m", wrong(), now + Duration::seconds(9)).unwrap();
        assert_eq!(raised.len(), 2); // accuracy and loss
        assert_eq!(notifier.count_for("ml-alerts"), 2);
    }

    #[tokio::test]
    async fn persistent_breach_alerts_once_per_cooldown() {
        let (m, _, ctx) = monitor(MonitorConfig {
            min_samples_for_alert: 1,
            ..Default::default()
        });
        let mut degraded = ctx.events.subscribe(topics::PERFORMANCE_DEGRADED);
        m.set_alert_config(
            "m",
            AlertConfig {
                thresholds: AlertThresholds {
                    min_accuracy: 0.9,
                    max_loss: 10.0,
                    ..Default::default()
                },
                channels: vec!["ops".into()],
                cooldown_secs: 600,
            },
        );

        let start = Utc::now();
        let mut bursts = 0;
        for i in 0..100 {
            let at = start + Duration::seconds(i * 5);
            if !m.record_prediction_at("m", wrong(), at).unwrap().is_empty() {
                bursts += 1;
            }
        }
        // 500 seconds of breaches inside one 600 second cooldown.
        assert_eq!(bursts, 1);
        assert_eq!(m.alerts("m").len(), 1);

        let later = start + Duration::seconds(1200);
        assert_eq!(m.record_prediction_at("m", wrong(), later).unwrap().len(), 1);
        assert_eq!(m.alerts("m").len(), 2);

        let first = degraded.recv().await.unwrap();
        assert_eq!(first.event.model_id(), "m");
    }

    #[test]
    fn concurrent_recording_raises_a_single_burst() {
        let (m, _, _) = monitor(MonitorConfig {
            min_samples_for_alert: 1,
            ..Default::default()
        });
        let m = Arc::new(m);
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    let mut n = 0;
                    for _ in 0..50 {
                        n += m.record_prediction_at("m", wrong(), now).unwrap().len();
                    }
                    n
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn healthy_traffic_raises_nothing() {
        let (m, notifier, _) = monitor(MonitorConfig::default());
        for _ in 0..50 {
            assert!(m.record_prediction("m", right()).unwrap().is_empty());
        }
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn reference_is_captured_then_drift_measured() {
        let (m, _, _) = monitor(MonitorConfig {
            reference_sample_size: 20,
            drift_window: 10,
            ..Default::default()
        });
        for i in 0..20 {
            let x = if i % 2 == 0 { 0.0 } else { 2.0 };
            m.record_prediction("m", PredictionSample::new(json!({"x": x}), json!(1), 1.0))
                .unwrap();
        }
        assert!(m.reference("m").is_some());
        assert_eq!(m.get_data_drift("m"), 0.0);

        for _ in 0..10 {
            m.record_prediction("m", PredictionSample::new(json!({"x": 5.0}), json!(1), 1.0))
                .unwrap();
        }
        assert!((m.get_data_drift("m") - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn drift_breach_publishes_drift_event() {
        let (m, _, ctx) = monitor(MonitorConfig {
            min_samples_for_alert: 1,
            drift_window: 1,
            ..Default::default()
        });
        let mut drift_rx = ctx.events.subscribe(topics::DRIFT_DETECTED);
        m.set_reference(
            "m",
            ReferenceDistribution::from_samples(&[
                [("x".to_string(), 0.0)].into_iter().collect(),
                [("x".to_string(), 2.0)].into_iter().collect(),
            ]),
        );
        let raised = m
            .record_prediction("m", PredictionSample::new(json!({"x": 10.0}), json!(1), 1.0))
            .unwrap();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::Drift);
        assert_eq!(drift_rx.recv().await.unwrap().topic, topics::DRIFT_DETECTED);
    }

    #[test]
    fn explicit_range_and_retention() {
        let (m, _, _) = monitor(MonitorConfig {
            retention_days: 30,
            ..Default::default()
        });
        let now = Utc::now();
        m.record_prediction_at("m", right(), now - Duration::days(40)).unwrap();
        m.record_prediction_at("m", right(), now - Duration::days(10)).unwrap();
        m.record_prediction_at("m", right(), now).unwrap();

        let range = TimeRange::new(now - Duration::days(50), now);
        assert_eq!(m.get_model_performance_at("m", Some(range), now).sample_count, 3);
        assert_eq!(m.get_model_performance_at("m", None, now).sample_count, 1);

        assert_eq!(m.purge_expired(now), 1);
        assert_eq!(m.get_model_performance_at("m", Some(range), now).sample_count, 2);
    }

    #[test]
    fn sample_cap_drops_oldest() {
        let (m, _, _) = monitor(MonitorConfig {
            max_samples_per_model: 5,
            ..Default::default()
        });
        for _ in 0..12 {
            m.record_prediction("m", right()).unwrap();
        }
        assert_eq!(m.get_model_performance("m", None).sample_count, 5);
    }

    #[test]
    fn empty_model_id_is_rejected() {
        let (m, _, _) = monitor(MonitorConfig::default());
        assert!(m.record_prediction("", right()).is_err());
    }

    #[test]
    fn failed_requests_raise_error_rate_alert() {
        let (m, notifier, _) = monitor(MonitorConfig::default());
        let now = Utc::now();
        for i in 0..8 {
            m.record_prediction_at("m", right(), now + Duration::seconds(i)).unwrap();
        }
        m.record_prediction_at("m", PredictionSample::failed(json!({"x": 1.0}), 30.0, "timeout"), now + Duration::seconds(8))
            .unwrap();
        let raised = m
            .record_prediction_at("m", PredictionSample::failed(json!({"x": 1.0}), 30.0, "timeout"), now + Duration::seconds(9))
            .unwrap();
        let kinds: Vec<AlertKind> = raised.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::ErrorRate]);
        assert_eq!(notifier.count_for("ml-alerts"), 1);

        let perf = m.get_model_performance_at("m", None, now + Duration::seconds(10));
        assert_eq!(perf.sample_count, 10);
        assert!((perf.error_rate - 0.2).abs() < 1e-9);
        assert_eq!(perf.accuracy, 1.0);
    }
}
