//! Scheduled and on-demand retraining driven by monitor output.

mod policy;
mod tuning;

pub use policy::{AcceptanceCriteria, Frequency, RetrainCriteria, RetrainPolicy, RetrainSchedule};
pub use tuning::{apply_params, Objective, ParamRange, SearchStrategy, TuningConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::context::ServiceContext;
use crate::error::{ModelOpsError, Result};
use crate::events::ModelOpsEvent;
use crate::monitor::PerformanceMonitor;
use crate::registry::VersionRegistry;
use crate::store::KeyedStore;
use crate::types::{ModelArtifact, ModelId, ModelMetrics, Version, VersionMetadata, VersionStatus};

/// Tag attached to every version registered by the trigger.
pub const AUTO_TRAINED_TAG: &str = "auto-trained";

/// External training collaborator.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(&self, model_id: &str, config: &Value) -> Result<ModelArtifact>;

    async fn evaluate(&self, model_id: &str, artifact: &ModelArtifact) -> Result<ModelMetrics>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrainConfig {
    /// Outcomes kept per model.
    pub history_limit: usize,
    /// How often the scheduler checks for due policies.
    pub tick_secs: u64,
    /// Trainer name recorded in version metadata.
    pub trainer_name: String,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            tick_secs: 60,
            trainer_name: "auto-retrain".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainStatus {
    Registered,
    CriteriaNotMet,
    Rejected,
    Failed,
}

impl RetrainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::CriteriaNotMet => "criteria_not_met",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainOutcome {
    pub model_id: ModelId,
    pub status: RetrainStatus,
    pub forced: bool,
    /// Why retraining ran (empty when forced).
    pub triggers: Vec<String>,
    pub reason: Option<String>,
    pub metrics: Option<ModelMetrics>,
    pub version: Option<Version>,
    pub trials: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RetrainOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RetrainStatus::Registered
    }
}

struct PolicyEntry {
    policy: RetrainPolicy,
    next_run_at: Option<DateTime<Utc>>,
}

/// Marks a model as training; removes the mark when dropped.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<ModelId, DateTime<Utc>>,
    model_id: ModelId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(in_flight: &'a DashMap<ModelId, DateTime<Utc>>, model_id: &str) -> Result<Self> {
        match in_flight.entry(model_id.to_string()) {
            Entry::Occupied(e) => Err(ModelOpsError::AlreadyRunning(format!(
                "training for {} started at {}",
                model_id,
                e.get().to_rfc3339()
            ))),
            Entry::Vacant(v) => {
                v.insert(Utc::now());
                Ok(Self {
                    in_flight,
                    model_id: model_id.to_string(),
                })
            }
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.model_id);
    }
}

pub struct RetrainTrigger {
    registry: Arc<VersionRegistry>,
    monitor: Arc<PerformanceMonitor>,
    trainer: Arc<dyn Trainer>,
    policies: KeyedStore<ModelId, PolicyEntry>,
    in_flight: DashMap<ModelId, DateTime<Utc>>,
    history: KeyedStore<ModelId, VecDeque<RetrainOutcome>>,
    config: RetrainConfig,
    ctx: ServiceContext,
}

impl RetrainTrigger {
    pub fn new(
        config: RetrainConfig,
        registry: Arc<VersionRegistry>,
        monitor: Arc<PerformanceMonitor>,
        trainer: Arc<dyn Trainer>,
        ctx: ServiceContext,
    ) -> Self {
        Self {
            registry,
            monitor,
            trainer,
            policies: KeyedStore::new(),
            in_flight: DashMap::new(),
            history: KeyedStore::new(),
            config,
            ctx,
        }
    }

    /// Store a policy and arm its timer at the configured frequency.
    pub fn register_config(&self, model_id: &str, policy: RetrainPolicy) -> Result<()> {
        self.register_config_at(model_id, policy, Utc::now())
    }

    pub fn register_config_at(&self, model_id: &str, policy: RetrainPolicy, now: DateTime<Utc>) -> Result<()> {
        if model_id.is_empty() {
            return Err(ModelOpsError::Validation("model id is empty".into()));
        }
        policy.validate()?;
        let next_run_at = policy
            .schedule
            .enabled
            .then(|| now + policy.schedule.frequency.interval());
        log::info!(
            "retrain policy for {} registered ({:?}, next run {:?})",
            model_id,
            policy.schedule.frequency,
            next_run_at
        );
        self.policies
            .insert(model_id.to_string(), PolicyEntry { policy, next_run_at });
        Ok(())
    }

    pub fn policy(&self, model_id: &str) -> Option<RetrainPolicy> {
        self.policies
            .with(&model_id.to_string(), |e| e.policy.clone())
    }

    pub fn next_run_at(&self, model_id: &str) -> Option<DateTime<Utc>> {
        self.policies
            .with(&model_id.to_string(), |e| e.next_run_at)
            .flatten()
    }

    pub fn is_running(&self, model_id: &str) -> bool {
        self.in_flight.contains_key(model_id)
    }

    /// Whether the monitor's view of the model satisfies the policy's criteria.
    /// Returns the reasons that hold.
    pub fn should_retrain(&self, model_id: &str) -> Result<Vec<String>> {
        let policy = self
            .policy(model_id)
            .ok_or_else(|| ModelOpsError::Validation(format!("no retrain policy for {}", model_id)))?;
        let perf = self.monitor.get_model_performance(model_id, None);
        let drift = self.monitor.get_data_drift(model_id);
        Ok(policy.criteria.reasons(&perf, drift))
    }

    /// Retrain `model_id` if its criteria hold (or unconditionally when forced).
    ///
    /// Two trainings of one model never overlap; a second call while one is in
    /// flight fails with `AlreadyRunning` whether forced or not.
    pub async fn trigger(&self, model_id: &str, force: bool) -> Result<RetrainOutcome> {
        let policy = self
            .policy(model_id)
            .ok_or_else(|| ModelOpsError::Validation(format!("no retrain policy for {}", model_id)))?;
        let _guard = InFlightGuard::acquire(&self.in_flight, model_id)?;
        let started_at = Utc::now();

        let triggers = if force {
            Vec::new()
        } else {
            let perf = self.monitor.get_model_performance(model_id, None);
            let drift = self.monitor.get_data_drift(model_id);
            let reasons = policy.criteria.reasons(&perf, drift);
            if reasons.is_empty() {
                log::debug!("retrain criteria not met for {}", model_id);
                let outcome = RetrainOutcome {
                    model_id: model_id.to_string(),
                    status: RetrainStatus::CriteriaNotMet,
                    forced: false,
                    triggers: Vec::new(),
                    reason: Some("criteria not met".to_string()),
                    metrics: None,
                    version: None,
                    trials: 0,
                    started_at,
                    finished_at: Utc::now(),
                };
                self.remember(&outcome);
                return Ok(outcome);
            }
            reasons
        };

        log::info!(
            "retraining {} ({})",
            model_id,
            if force { "forced".to_string() } else { triggers.join(", ") }
        );

        let trained = self.train_best(model_id, &policy).await;
        let (artifact, metrics, trials) = match trained {
            Ok(t) => t,
            Err(e) => {
                log::error!("retraining {} failed: {}", model_id, e);
                self.remember(&RetrainOutcome {
                    model_id: model_id.to_string(),
                    status: RetrainStatus::Failed,
                    forced: force,
                    triggers,
                    reason: Some(e.to_string()),
                    metrics: None,
                    version: None,
                    trials: 0,
                    started_at,
                    finished_at: Utc::now(),
                });
                return Err(e);
            }
        };

        let production = self
            .registry
            .get_latest_version(model_id, Some(VersionStatus::Production))
            .map(|v| v.metrics);
        let mut outcome = RetrainOutcome {
            model_id: model_id.to_string(),
            status: RetrainStatus::Rejected,
            forced: force,
            triggers,
            reason: None,
            metrics: Some(metrics),
            version: None,
            trials,
            started_at,
            finished_at: started_at,
        };

        match policy.acceptance.check(&metrics, production.as_ref()) {
            Err(reason) => {
                log::warn!("retrained {} rejected: {}", model_id, reason);
                self.ctx.events.publish(ModelOpsEvent::RetrainRejected {
                    model_id: model_id.to_string(),
                    metrics,
                    reason: reason.clone(),
                });
                outcome.reason = Some(reason);
            }
            Ok(()) => {
                let artifact = ModelArtifact { metrics, ..artifact };
                let metadata = VersionMetadata::new(self.config.trainer_name.clone()).with_tag(AUTO_TRAINED_TAG);
                let registered = match self.registry.register(model_id, artifact, metadata) {
                    Ok(v) => v,
                    Err(e) => {
                        outcome.status = RetrainStatus::Failed;
                        outcome.reason = Some(e.to_string());
                        outcome.finished_at = Utc::now();
                        self.remember(&outcome);
                        return Err(e);
                    }
                };
                self.ctx.events.publish(ModelOpsEvent::RetrainCompleted {
                    model_id: model_id.to_string(),
                    version: registered.version,
                    metrics,
                });
                outcome.status = RetrainStatus::Registered;
                outcome.version = Some(registered.version);
            }
        }
        outcome.finished_at = Utc::now();
        self.remember(&outcome);
        Ok(outcome)
    }

    /// Train once, or run the hyperparameter search and keep the best trial.
    async fn train_best(&self, model_id: &str, policy: &RetrainPolicy) -> Result<(ModelArtifact, ModelMetrics, usize)> {
        let Some(tuning) = &policy.tuning else {
            let artifact = self.trainer.train(model_id, &policy.base_config).await?;
            let metrics = self.trainer.evaluate(model_id, &artifact).await?;
            return Ok((artifact, metrics, 1));
        };

        let candidates = tuning.candidates();
        let mut best: Option<(ModelArtifact, ModelMetrics)> = None;
        let mut trials = 0;
        for params in &candidates {
            let config = apply_params(&policy.base_config, params);
            trials += 1;
            let result = async {
                let artifact = self.trainer.train(model_id, &config).await?;
                let metrics = self.trainer.evaluate(model_id, &artifact).await?;
                Ok::<_, ModelOpsError>((artifact, metrics))
            }
            .await;
            match result {
                Ok((artifact, metrics)) => {
                    log::debug!("trial {} for {}: accuracy {:.4}", trials, model_id, metrics.accuracy);
                    let better = best
                        .as_ref()
                        .map_or(true, |(_, m)| tuning.objective.better(&metrics, m));
                    if better {
                        best = Some((artifact, metrics));
                    }
                }
                Err(e) => log::warn!("trial {} for {} failed: {}", trials, model_id, e),
            }
        }
        best.map(|(a, m)| (a, m, trials)).ok_or_else(|| {
            ModelOpsError::Training(format!("all {} tuning trials failed for {}", trials, model_id))
        })
    }

    fn remember(&self, outcome: &RetrainOutcome) {
        let limit = self.config.history_limit.max(1);
        self.history
            .with_or_insert(outcome.model_id.clone(), VecDeque::new, |h| {
                h.push_back(outcome.clone());
                while h.len() > limit {
                    h.pop_front();
                }
            });
    }

    /// Past outcomes for a model, oldest first.
    pub fn history(&self, model_id: &str) -> Vec<RetrainOutcome> {
        self.history
            .get(&model_id.to_string())
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Run every enabled policy whose timer has elapsed and re-arm it.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<RetrainOutcome> {
        let mut due = Vec::new();
        for model_id in self.policies.keys() {
            let is_due = self.policies.with(&model_id, |e| match e.next_run_at {
                Some(at) if at <= now && e.policy.schedule.enabled => {
                    e.next_run_at = Some(now + e.policy.schedule.frequency.interval());
                    true
                }
                _ => false,
            });
            if is_due == Some(true) {
                due.push(model_id);
            }
        }

        let runs = due.iter().map(|model_id| self.trigger(model_id, false));
        let mut out = Vec::new();
        for (model_id, result) in due.iter().zip(futures::future::join_all(runs).await) {
            match result {
                Ok(outcome) => out.push(outcome),
                Err(ModelOpsError::AlreadyRunning(_)) => {
                    log::debug!("scheduled retrain of {} skipped: already running", model_id)
                }
                Err(e) => log::error!("scheduled retrain of {} failed: {}", model_id, e),
            }
        }
        out
    }

    /// Drive `run_due` on a fixed tick until the task is aborted.
    pub async fn run_scheduler(self: Arc<Self>) {
        let mut tick = tokio::time::interval(StdDuration::from_secs(self.config.tick_secs.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let outcomes = self.run_due(Utc::now()).await;
            if !outcomes.is_empty() {
                log::info!("scheduler ran {} retrain(s)", outcomes.len());
            }
        }
    }
}
