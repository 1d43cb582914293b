use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use uuid::Uuid;

use super::balancer::InstanceSelector;
use super::endpoint::{CanaryRoute, EndpointConfig, ModelEndpoint};
use super::health::{HealthProbe, HealthSweepResult};
use super::inference::{
    InferenceBackend, InferenceError, InferenceRequest, InferenceResponse, Prediction, ResponseMetadata,
};
use super::instance::{InstanceHealth, ModelInstance, NewInstance, RequestStats};
use super::ServingConfig;
use crate::context::ServiceContext;
use crate::error::{ModelOpsError, Result};
use crate::events::ModelOpsEvent;
use crate::monitor::{PerformanceMonitor, PredictionSample};
use crate::registry::VersionRegistry;
use crate::store::KeyedStore;
use crate::types::{ModelId, ModelVersion, Version, VersionStatus};

struct EndpointState {
    endpoint: ModelEndpoint,
    selector: Arc<dyn InstanceSelector>,
}

impl EndpointState {
    fn new(config: EndpointConfig) -> Self {
        let selector: Arc<dyn InstanceSelector> = Arc::from(config.strategy.selector());
        Self {
            endpoint: ModelEndpoint::from_config(config),
            selector,
        }
    }
}

/// Decrements the instance's active connection count when dropped.
struct ConnectionLease<'a> {
    pools: &'a KeyedStore<ModelId, Vec<ModelInstance>>,
    instance: ModelInstance,
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        let id = self.instance.id;
        self.pools.with(&self.instance.model_id, |pool| {
            if let Some(i) = pool.iter_mut().find(|i| i.id == id) {
                i.active_connections = i.active_connections.saturating_sub(1);
            }
        });
    }
}

/// Resolves versions, balances across healthy instances, and runs inference.
pub struct ServingRouter {
    registry: Arc<VersionRegistry>,
    monitor: Arc<PerformanceMonitor>,
    endpoints: KeyedStore<ModelId, EndpointState>,
    pools: KeyedStore<ModelId, Vec<ModelInstance>>,
    backends: DashMap<ModelId, Arc<dyn InferenceBackend>>,
    probe: Arc<dyn HealthProbe>,
    config: ServingConfig,
    ctx: ServiceContext,
}

impl ServingRouter {
    pub fn new(
        config: ServingConfig,
        registry: Arc<VersionRegistry>,
        monitor: Arc<PerformanceMonitor>,
        probe: Arc<dyn HealthProbe>,
        ctx: ServiceContext,
    ) -> Self {
        Self {
            registry,
            monitor,
            endpoints: KeyedStore::new(),
            pools: KeyedStore::new(),
            backends: DashMap::new(),
            probe,
            config,
            ctx,
        }
    }

    pub fn config(&self) -> &ServingConfig {
        &self.config
    }

    // ── Endpoints ─────────────────────────────────────────────────────────────

    /// Register (or replace) the endpoint of a model.
    pub fn register_endpoint(&self, config: EndpointConfig) -> Result<ModelEndpoint> {
        config.validate()?;
        let path = config.resolved_path();
        let clash = self
            .endpoints()
            .into_iter()
            .any(|e| e.path == path && e.model_id != config.model_id);
        if clash {
            return Err(ModelOpsError::Validation(format!("path {} is already bound", path)));
        }
        let state = EndpointState::new(config);
        let endpoint = state.endpoint.clone();
        self.endpoints.insert(endpoint.model_id.clone(), state);
        log::info!(
            "endpoint {} -> {} ({:?})",
            endpoint.path,
            endpoint.model_id,
            endpoint.strategy
        );
        Ok(endpoint)
    }

    pub fn endpoint(&self, model_id: &str) -> Option<ModelEndpoint> {
        self.endpoints
            .with(&model_id.to_string(), |s| s.endpoint.clone())
    }

    pub fn endpoints(&self) -> Vec<ModelEndpoint> {
        let mut out: Vec<ModelEndpoint> = self
            .endpoints
            .keys()
            .iter()
            .filter_map(|k| self.endpoints.with(k, |s| s.endpoint.clone()))
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    pub fn endpoint_for_path(&self, path: &str) -> Option<ModelEndpoint> {
        self.endpoints().into_iter().find(|e| e.path == path)
    }

    pub fn remove_endpoint(&self, model_id: &str) -> bool {
        self.endpoints.remove(&model_id.to_string())
    }

    /// Endpoint snapshot and selector, creating a default endpoint on first use.
    fn endpoint_handle(&self, model_id: &str) -> (ModelEndpoint, Arc<dyn InstanceSelector>) {
        let strategy = self.config.default_strategy;
        self.endpoints.with_or_insert(
            model_id.to_string(),
            || EndpointState::new(EndpointConfig::new(model_id, strategy)),
            |s| (s.endpoint.clone(), s.selector.clone()),
        )
    }

    pub fn set_canary(&self, model_id: &str, version: &Version, percentage: u8) -> Result<()> {
        if percentage == 0 || percentage > 100 {
            return Err(ModelOpsError::Validation(format!(
                "canary percentage must be 1..=100, got {}",
                percentage
            )));
        }
        self.registry.get_version(model_id, version)?;
        self.endpoint_handle(model_id);
        self.endpoints.with(&model_id.to_string(), |s| {
            s.endpoint.canary = Some(CanaryRoute {
                version: *version,
                percentage,
            });
        });
        log::info!("canary route {}@{} at {}%", model_id, version, percentage);
        Ok(())
    }

    pub fn clear_canary(&self, model_id: &str) -> Option<CanaryRoute> {
        self.endpoints
            .with(&model_id.to_string(), |s| s.endpoint.canary.take())
            .flatten()
    }

    // ── Backends ──────────────────────────────────────────────────────────────

    pub fn register_backend(&self, model_id: &str, backend: Arc<dyn InferenceBackend>) {
        self.backends.insert(model_id.to_string(), backend);
    }

    pub fn has_backend(&self, model_id: &str) -> bool {
        self.backends.contains_key(model_id)
    }

    // ── Instances ─────────────────────────────────────────────────────────────

    /// Bring up an instance in the warming-up state.
    pub fn add_instance(&self, new: NewInstance) -> Result<ModelInstance> {
        self.registry.get_version(&new.model_id, &new.version)?;
        let instance = new.build(Utc::now());
        self.pools.with_or_insert(instance.model_id.clone(), Vec::new, |pool| {
            pool.push(instance.clone())
        });
        log::info!("instance {} added on {}", instance.key(), instance.target);
        Ok(instance)
    }

    pub fn remove_instance(&self, id: Uuid) -> Result<ModelInstance> {
        for model_id in self.pools.keys() {
            let removed = self.pools.with(&model_id, |pool| {
                let idx = pool.iter().position(|i| i.id == id)?;
                Some(pool.remove(idx))
            });
            if let Some(Some(instance)) = removed {
                log::info!("instance {} removed", instance.key());
                return Ok(instance);
            }
        }
        Err(ModelOpsError::Validation(format!("instance {} not found", id)))
    }

    /// Remove every instance of `model_id@version`.
    pub fn remove_version_instances(&self, model_id: &str, version: &Version) -> Vec<ModelInstance> {
        self.pools
            .with(&model_id.to_string(), |pool| {
                let (gone, kept): (Vec<_>, Vec<_>) = pool.drain(..).partition(|i| &i.version == version);
                *pool = kept;
                gone
            })
            .unwrap_or_default()
    }

    pub fn set_instance_health(&self, id: Uuid, health: InstanceHealth) -> Result<()> {
        for model_id in self.pools.keys() {
            let changed = self.pools.with(&model_id, |pool| {
                pool.iter_mut().find(|i| i.id == id).map(|i| {
                    let was = i.health;
                    i.health = health;
                    (was != health).then(|| i.clone())
                })
            });
            match changed {
                Some(Some(Some(instance))) => {
                    self.publish_health(&instance);
                    return Ok(());
                }
                Some(Some(None)) => return Ok(()),
                _ => {}
            }
        }
        Err(ModelOpsError::Validation(format!("instance {} not found", id)))
    }

    pub fn instances(&self, model_id: &str) -> Vec<ModelInstance> {
        self.pools.get(&model_id.to_string()).unwrap_or_default()
    }

    pub fn all_instances(&self) -> Vec<ModelInstance> {
        self.pools.values().into_iter().flatten().collect()
    }

    pub fn healthy_count(&self, model_id: &str, version: &Version) -> usize {
        self.instances(model_id)
            .iter()
            .filter(|i| &i.version == version && i.is_healthy())
            .count()
    }

    /// Request statistics of every instance of a version, combined.
    pub fn version_stats(&self, model_id: &str, version: &Version) -> RequestStats {
        let mut total = RequestStats::default();
        for i in self.instances(model_id).iter().filter(|i| &i.version == version) {
            total.merge(&i.stats);
        }
        total
    }

    // ── Health ────────────────────────────────────────────────────────────────

    /// Probe every instance and update its health.
    pub async fn health_sweep(&self) -> HealthSweepResult {
        self.sweep(self.all_instances(), Utc::now()).await
    }

    /// Probe only the given instances.
    pub async fn probe_instances(&self, ids: &[Uuid]) -> HealthSweepResult {
        let subset = self
            .all_instances()
            .into_iter()
            .filter(|i| ids.contains(&i.id))
            .collect();
        self.sweep(subset, Utc::now()).await
    }

    async fn sweep(&self, instances: Vec<ModelInstance>, now: DateTime<Utc>) -> HealthSweepResult {
        let probes = instances.iter().map(|i| self.probe.probe(i));
        let verdicts = futures::future::join_all(probes).await;
        let grace = Duration::seconds(self.config.warmup_grace_secs as i64);

        let mut result = HealthSweepResult {
            instances_checked: instances.len(),
            ..Default::default()
        };
        for (instance, verdict) in instances.iter().zip(verdicts) {
            let updated = self.pools.with(&instance.model_id, |pool| {
                let live = pool.iter_mut().find(|i| i.id == instance.id)?;
                let was = live.health;
                live.last_probe_at = Some(now);
                live.health = match &verdict {
                    Ok(()) => {
                        live.last_probe_error = None;
                        InstanceHealth::Healthy
                    }
                    Err(e) => {
                        live.last_probe_error = Some(e.to_string());
                        if was == InstanceHealth::WarmingUp && now - live.started_at < grace {
                            InstanceHealth::WarmingUp
                        } else {
                            InstanceHealth::Unhealthy
                        }
                    }
                };
                (was != live.health).then(|| live.clone())
            });
            if let Some(Some(changed)) = updated {
                match changed.health {
                    InstanceHealth::Healthy => result.marked_healthy.push(changed.id),
                    _ => {
                        log::warn!(
                            "instance {} marked {} ({})",
                            changed.key(),
                            changed.health.as_str(),
                            changed.last_probe_error.as_deref().unwrap_or("no detail")
                        );
                        result.marked_unhealthy.push(changed.id);
                    }
                }
                self.publish_health(&changed);
            }
        }
        result
    }

    fn publish_health(&self, instance: &ModelInstance) {
        self.ctx.events.publish(ModelOpsEvent::InstanceHealthChanged {
            instance_id: instance.id,
            model_id: instance.model_id.clone(),
            version: instance.version,
            healthy: instance.is_healthy(),
        });
    }

    /// Run `health_sweep` on a fixed interval until the task is aborted.
    pub async fn run_health_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(StdDuration::from_secs(self.config.health_interval_secs.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let result = self.health_sweep().await;
            if result.changed() > 0 {
                log::info!(
                    "health sweep: {} checked, {} healthy, {} unhealthy",
                    result.instances_checked,
                    result.marked_healthy.len(),
                    result.marked_unhealthy.len()
                );
            }
        }
    }

    // ── Inference ─────────────────────────────────────────────────────────────

    fn resolve_version(
        &self,
        request: &InferenceRequest,
        endpoint: &ModelEndpoint,
        warnings: &mut Vec<String>,
    ) -> Result<ModelVersion> {
        let model_id = &request.model_id;
        if let Some(requested) = &request.model_version {
            match self.registry.get_version(model_id, requested) {
                Ok(v) if v.status != VersionStatus::Archived => return Ok(v),
                Ok(_) => warnings.push(format!("requested version {} is archived", requested)),
                Err(e) if e.is_not_found() => warnings.push(format!("requested version {} not found", requested)),
                Err(e) => return Err(e),
            }
        }
        if let Some(canary) = &endpoint.canary {
            if canary.takes(rand::thread_rng().gen::<f64>()) {
                match self.registry.get_version(model_id, &canary.version) {
                    Ok(v) => return Ok(v),
                    Err(e) => log::warn!("canary route for {} is stale: {}", model_id, e),
                }
            }
        }
        self.registry
            .production_version(model_id)
            .ok_or_else(|| ModelOpsError::ModelNotAvailable(format!("{} has no production version", model_id)))
    }

    /// Select a healthy instance and take a connection on it.
    fn lease(
        &self,
        model_id: &str,
        version: Version,
        selector: &dyn InstanceSelector,
    ) -> Result<ConnectionLease<'_>> {
        let picked = self.pools.with(&model_id.to_string(), |pool| {
            let healthy: Vec<usize> = pool
                .iter()
                .enumerate()
                .filter(|(_, i)| i.version == version && i.is_healthy())
                .map(|(idx, _)| idx)
                .collect();
            let candidates: Vec<&ModelInstance> = healthy.iter().map(|idx| &pool[*idx]).collect();
            let chosen = selector.select(version, &candidates)?;
            let instance = &mut pool[healthy[chosen]];
            instance.active_connections += 1;
            Some(instance.clone())
        });
        match picked.flatten() {
            Some(instance) => Ok(ConnectionLease {
                pools: &self.pools,
                instance,
            }),
            None => Err(ModelOpsError::NoHealthyInstance {
                model_id: model_id.to_string(),
                version: version.to_string(),
            }),
        }
    }

    fn record_instance(&self, instance: &ModelInstance, latency_ms: f64, ok: bool, at: DateTime<Utc>) {
        self.pools.with(&instance.model_id, |pool| {
            if let Some(i) = pool.iter_mut().find(|i| i.id == instance.id) {
                i.stats.record(latency_ms, ok, at);
            }
        });
    }

    fn record_endpoint(&self, model_id: &str, latency_ms: f64, ok: bool, at: DateTime<Utc>) -> RequestStats {
        self.endpoints
            .with(&model_id.to_string(), |s| {
                s.endpoint.stats.record(latency_ms, ok, at);
                s.endpoint.stats.clone()
            })
            .unwrap_or_default()
    }

    /// Resolve, balance, execute, and report one inference request.
    pub async fn process_inference(
        &self,
        request: InferenceRequest,
    ) -> std::result::Result<InferenceResponse, InferenceError> {
        let started = Instant::now();
        let timestamp = Utc::now();
        let request_id = request
            .request_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let model_id = request.model_id.clone();

        let fail = |source: ModelOpsError, version: Option<Version>| {
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            self.record_endpoint(&model_id, elapsed, false, Utc::now());
            log::warn!("inference {} for {} failed: {}", request_id, model_id, source);
            // Requests that never resolved a version say nothing about a model.
            if version.is_some() {
                let sample = PredictionSample::failed(request.input.clone(), elapsed, source.to_string());
                if let Err(e) = self.monitor.record_prediction(&model_id, sample) {
                    log::error!("failed to report inference failure for {} to the monitor: {}", model_id, e);
                }
            }
            InferenceError {
                source,
                request_id: request_id.clone(),
                model_id: model_id.clone(),
                model_version: version,
                processing_time_ms: elapsed,
                timestamp,
            }
        };

        if model_id.is_empty() {
            return Err(fail(ModelOpsError::Validation("model id is empty".into()), None));
        }
        let (endpoint, selector) = self.endpoint_handle(&model_id);
        let mut warnings = Vec::new();
        let version = self
            .resolve_version(&request, &endpoint, &mut warnings)
            .map_err(|e| fail(e, None))?;
        let backend = match self.backends.get(&model_id) {
            Some(b) => b.value().clone(),
            None => {
                return Err(fail(
                    ModelOpsError::ModelNotAvailable(format!("no inference backend for {}", model_id)),
                    Some(version.version),
                ))
            }
        };

        let options = request.options.clone().unwrap_or_default();
        let timeout_ms = options
            .timeout
            .or(endpoint.timeout_ms)
            .unwrap_or(self.config.default_timeout_ms)
            .max(1);
        let retries = options
            .retries
            .unwrap_or(endpoint.max_retries)
            .min(self.config.max_retries);
        let explain = request.explain();

        let mut attempts = 0;
        let (prediction, instance_id, latency_ms): (Prediction, Uuid, f64) = loop {
            attempts += 1;
            let lease = self
                .lease(&model_id, version.version, selector.as_ref())
                .map_err(|e| fail(e, Some(version.version)))?;
            let call_started = Instant::now();
            let call = backend.predict(&version, &lease.instance, &request.input, explain);
            let outcome = match tokio::time::timeout(StdDuration::from_millis(timeout_ms), call).await {
                Ok(r) => r,
                Err(_) => Err(ModelOpsError::Timeout(timeout_ms)),
            };
            let latency = call_started.elapsed().as_secs_f64() * 1000.0;
            self.record_instance(&lease.instance, latency, outcome.is_ok(), Utc::now());
            let instance_id = lease.instance.id;
            drop(lease);

            match outcome {
                Ok(p) => break (p, instance_id, latency),
                Err(e) if attempts <= retries => {
                    log::warn!(
                        "inference attempt {} for {}@{} failed, retrying: {}",
                        attempts,
                        model_id,
                        version.version,
                        e
                    );
                }
                Err(e) => return Err(fail(e, Some(version.version))),
            }
        };

        let processing_time = started.elapsed().as_secs_f64() * 1000.0;
        let stats = self.record_endpoint(&model_id, processing_time, true, Utc::now());

        let sample = PredictionSample::new(request.input.clone(), prediction.value.clone(), latency_ms)
            .with_memory(prediction.memory_bytes);
        if let Err(e) = self.monitor.record_prediction(&model_id, sample) {
            log::error!("failed to report inference for {} to the monitor: {}", model_id, e);
        }

        if stats.requests >= self.config.min_requests_for_error_warning
            && stats.error_rate() > self.config.warn_error_rate
        {
            warnings.push(format!(
                "elevated error rate {:.1}% on {}",
                stats.error_rate() * 100.0,
                endpoint.path
            ));
        }
        if latency_ms > self.config.warn_latency_ms {
            warnings.push(format!("high latency {:.0}ms", latency_ms));
        }
        if let Some(c) = prediction.confidence {
            if c < self.config.low_confidence {
                warnings.push(format!("low confidence {:.2}", c));
            }
        }

        Ok(InferenceResponse {
            request_id,
            model_id: model_id.clone(),
            model_version: version.version,
            prediction: prediction.value,
            confidence: prediction.confidence,
            explanation: if explain { prediction.explanation } else { None },
            metadata: ResponseMetadata {
                processing_time,
                timestamp,
                model_performance: Some(self.monitor.get_model_performance(&model_id, None)),
                instance_id: Some(instance_id),
                attempts,
            },
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{topics, EventBus};
    use crate::monitor::MonitorConfig;
    use crate::notify::LogNotifier;
    use crate::registry::{InMemoryArtifactStore, RegistryConfig};
    use crate::serving::balancer::LoadBalancing;
    use crate::serving::health::StaticProbe;
    use crate::serving::inference::InferenceOptions;
    use crate::types::{ModelArtifact, ModelMetrics, VersionMetadata};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes its instance id; fails while `failures` is positive.
    #[derive(Default)]
    struct EchoBackend {
        failures: AtomicUsize,
        delay_ms: u64,
        confidence: Option<f64>,
        memory_bytes: Option<u64>,
    }

    #[async_trait]
    impl InferenceBackend for EchoBackend {
        async fn predict(
            &self,
            version: &ModelVersion,
            instance: &ModelInstance,
            _input: &Value,
            explain: bool,
        ) -> Result<Prediction> {
            if self.delay_ms > 0 {
                tokio::time::sleep(StdDuration::from_millis(self.delay_ms)).await;
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ModelOpsError::Inference("backend unavailable".into()));
            }
            let mut p = Prediction::new(json!({"instance": instance.id, "version": version.version}));
            p.confidence = self.confidence;
            p.memory_bytes = self.memory_bytes;
            if explain {
                p.explanation = Some(json!({"top_feature": "recency"}));
            }
            Ok(p)
        }
    }

    struct Fixture {
        registry: Arc<VersionRegistry>,
        monitor: Arc<PerformanceMonitor>,
        router: ServingRouter,
        probe: Arc<StaticProbe>,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let events = EventBus::new();
        let ctx = ServiceContext::new(events.clone(), Arc::new(LogNotifier));
        let registry = Arc::new(VersionRegistry::new(
            RegistryConfig::default(),
            Arc::new(InMemoryArtifactStore::new()),
            events.clone(),
        ));
        let monitor = Arc::new(PerformanceMonitor::new(MonitorConfig::default(), ctx.clone()));
        let probe = Arc::new(StaticProbe::new());
        let router = ServingRouter::new(
            ServingConfig::default(),
            registry.clone(),
            monitor.clone(),
            probe.clone(),
            ctx,
        );
        Fixture {
            registry,
            monitor,
            router,
            probe,
            events,
        }
    }

    fn register(registry: &VersionRegistry, model: &str, accuracy: f64) -> Version {
        registry
            .register(
                model,
                ModelArtifact {
                    config: json!({}),
                    weights: vec![7; 8],
                    metrics: ModelMetrics::new(accuracy, 0.1, accuracy),
                },
                VersionMetadata::new("test"),
            )
            .unwrap()
            .version
    }

    fn production(f: &Fixture, model: &str) -> Version {
        let v = register(&f.registry, model, 0.95);
        f.registry.promote(model, &v, VersionStatus::Production).unwrap();
        v
    }

    async fn healthy_instances(f: &Fixture, model: &str, version: Version, n: usize) -> Vec<Uuid> {
        let ids: Vec<Uuid> = (0..n)
            .map(|_| f.router.add_instance(NewInstance::new(model, version)).unwrap().id)
            .collect();
        f.router.probe_instances(&ids).await;
        ids
    }

    fn served_by(resp: &InferenceResponse) -> Uuid {
        serde_json::from_value(resp.prediction["instance"].clone()).unwrap()
    }

    #[tokio::test]
    async fn model_without_production_version_is_unavailable() {
        let f = fixture();
        f.router.register_backend("segment-model", Arc::new(EchoBackend::default()));
        let v = register(&f.registry, "segment-model", 0.95);

        let err = f
            .router
            .process_inference(InferenceRequest::new("segment-model", json!({"recency": 3})))
            .await
            .unwrap_err();
        assert!(matches!(err.source, ModelOpsError::ModelNotAvailable(_)));
        assert_eq!(err.model_id, "segment-model");

        f.registry.promote("segment-model", &v, VersionStatus::Production).unwrap();
        healthy_instances(&f, "segment-model", v, 1).await;
        let resp = f
            .router
            .process_inference(InferenceRequest::new("segment-model", json!({"recency": 3})))
            .await
            .unwrap();
        assert_eq!(resp.model_version, v);
        assert!(resp.metadata.model_performance.is_some());
    }

    #[tokio::test]
    async fn warming_instances_do_not_receive_traffic() {
        let f = fixture();
        f.router.register_backend("m", Arc::new(EchoBackend::default()));
        let v = production(&f, "m");
        f.router.add_instance(NewInstance::new("m", v)).unwrap();

        let err = f
            .router
            .process_inference(InferenceRequest::new("m", json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err.source, ModelOpsError::NoHealthyInstance { .. }));
    }

    #[tokio::test]
    async fn round_robin_spreads_requests_over_healthy_instances() {
        let f = fixture();
        f.router.register_backend("m", Arc::new(EchoBackend::default()));
        let v = production(&f, "m");
        let ids = healthy_instances(&f, "m", v, 3).await;

        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for _ in 0..9 {
            let resp = f.router.process_inference(InferenceRequest::new("m", json!(1))).await.unwrap();
            *counts.entry(served_by(&resp)).or_default() += 1;
        }
        for id in ids {
            assert_eq!(counts.get(&id), Some(&3));
        }
        for i in f.router.instances("m") {
            assert_eq!(i.active_connections, 0);
            assert_eq!(i.stats.requests, 3);
        }
    }

    #[tokio::test]
    async fn failed_probe_removes_instance_from_rotation() {
        let f = fixture();
        f.router.register_backend("m", Arc::new(EchoBackend::default()));
        let v = production(&f, "m");
        let ids = healthy_instances(&f, "m", v, 2).await;
        let mut changes = f.events.subscribe(topics::INSTANCE_HEALTH_CHANGED);

        f.probe.fail(ids[0]);
        let sweep = f.router.health_sweep().await;
        assert_eq!(sweep.instances_checked, 2);
        assert_eq!(sweep.marked_unhealthy, vec![ids[0]]);
        assert!(changes.try_recv().is_ok());

        for _ in 0..4 {
            let resp = f.router.process_inference(InferenceRequest::new("m", json!(1))).await.unwrap();
            assert_eq!(served_by(&resp), ids[1]);
        }

        f.probe.recover(ids[0]);
        assert_eq!(f.router.health_sweep().await.marked_healthy, vec![ids[0]]);
        assert_eq!(f.router.healthy_count("m", &v), 2);
    }

    #[tokio::test]
    async fn warming_instance_keeps_state_within_grace() {
        let f = fixture();
        let v = production(&f, "m");
        let id = f.router.add_instance(NewInstance::new("m", v)).unwrap().id;
        f.probe.fail(id);
        let sweep = f.router.health_sweep().await;
        assert_eq!(sweep.changed(), 0);
        assert_eq!(f.router.instances("m")[0].health, InstanceHealth::WarmingUp);
    }

    #[tokio::test]
    async fn missing_pinned_version_falls_back_with_warning() {
        let f = fixture();
        f.router.register_backend("m", Arc::new(EchoBackend::default()));
        let v = production(&f, "m");
        healthy_instances(&f, "m", v, 1).await;

        let resp = f
            .router
            .process_inference(InferenceRequest::new("m", json!(1)).pinned(Version::new(9, 9, 9)))
            .await
            .unwrap();
        assert_eq!(resp.model_version, v);
        assert!(resp.warnings.iter().any(|w| w.contains("9.9.9")));
    }

    #[tokio::test]
    async fn pinned_version_bypasses_production() {
        let f = fixture();
        f.router.register_backend("m", Arc::new(EchoBackend::default()));
        let prod = production(&f, "m");
        let candidate = register(&f.registry, "m", 0.9);
        healthy_instances(&f, "m", prod, 1).await;
        healthy_instances(&f, "m", candidate, 1).await;

        let resp = f
            .router
            .process_inference(InferenceRequest::new("m", json!(1)).pinned(candidate))
            .await
            .unwrap();
        assert_eq!(resp.model_version, candidate);
        assert!(resp.warnings.is_empty());
    }

    #[tokio::test]
    async fn full_canary_route_takes_unpinned_traffic() {
        let f = fixture();
        f.router.register_backend("m", Arc::new(EchoBackend::default()));
        let prod = production(&f, "m");
        let candidate = register(&f.registry, "m", 0.9);
        healthy_instances(&f, "m", prod, 1).await;
        healthy_instances(&f, "m", candidate, 1).await;

        f.router.set_canary("m", &candidate, 100).unwrap();
        let resp = f.router.process_inference(InferenceRequest::new("m", json!(1))).await.unwrap();
        assert_eq!(resp.model_version, candidate);

        assert!(f.router.set_canary("m", &candidate, 0).is_err());
        f.router.clear_canary("m");
        let resp = f.router.process_inference(InferenceRequest::new("m", json!(1))).await.unwrap();
        assert_eq!(resp.model_version, prod);
    }

    #[tokio::test]
    async fn retries_reselect_and_succeed() {
        let f = fixture();
        f.router.register_backend(
            "m",
            Arc::new(EchoBackend {
                failures: AtomicUsize::new(1),
                ..Default::default()
            }),
        );
        let v = production(&f, "m");
        healthy_instances(&f, "m", v, 2).await;

        let options = InferenceOptions {
            retries: Some(1),
            ..Default::default()
        };
        let resp = f
            .router
            .process_inference(InferenceRequest::new("m", json!(1)).with_options(options))
            .await
            .unwrap();
        assert_eq!(resp.metadata.attempts, 2);
        let endpoint = f.router.endpoint("m").unwrap();
        assert_eq!(endpoint.stats.requests, 1);
        assert_eq!(endpoint.stats.errors, 0);
    }

    #[tokio::test]
    async fn failed_inferences_raise_monitored_error_rate() {
        let f = fixture();
        f.router.register_backend(
            "m",
            Arc::new(EchoBackend {
                failures: AtomicUsize::new(3),
                memory_bytes: Some(4096),
                ..Default::default()
            }),
        );
        let v = production(&f, "m");
        healthy_instances(&f, "m", v, 1).await;

        let options = InferenceOptions {
            retries: Some(0),
            ..Default::default()
        };
        let mut failed = 0;
        for i in 0..6 {
            let request = InferenceRequest::new("m", json!({"x": i})).with_options(options.clone());
            if f.router.process_inference(request).await.is_err() {
                failed += 1;
            }
        }
        assert_eq!(failed, 3);

        let perf = f.monitor.get_model_performance("m", None);
        assert_eq!(perf.sample_count, 6);
        assert!((perf.error_rate - 0.5).abs() < 1e-9);
        assert_eq!(perf.accuracy, 1.0);
        assert_eq!(perf.memory_bytes, 4096.0);
    }

    #[tokio::test]
    async fn unresolved_requests_are_not_monitored() {
        let f = fixture();
        f.router.register_backend("m", Arc::new(EchoBackend::default()));
        register(&f.registry, "m", 0.95);
        assert!(f.router.process_inference(InferenceRequest::new("m", json!(1))).await.is_err());
        assert_eq!(f.monitor.get_model_performance("m", None).sample_count, 0);
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let f = fixture();
        f.router.register_backend(
            "m",
            Arc::new(EchoBackend {
                delay_ms: 200,
                ..Default::default()
            }),
        );
        let v = production(&f, "m");
        healthy_instances(&f, "m", v, 1).await;

        let options = InferenceOptions {
            timeout: Some(20),
            ..Default::default()
        };
        let err = f
            .router
            .process_inference(InferenceRequest::new("m", json!(1)).with_options(options))
            .await
            .unwrap_err();
        assert!(matches!(err.source, ModelOpsError::Timeout(20)));
        assert_eq!(err.model_version, Some(v));
        assert_eq!(f.router.instances("m")[0].active_connections, 0);
        assert_eq!(f.router.endpoint("m").unwrap().stats.errors, 1);
    }

    #[tokio::test]
    async fn low_confidence_and_explanations_are_reported() {
        let f = fixture();
        f.router.register_backend(
            "m",
            Arc::new(EchoBackend {
                confidence: Some(0.2),
                ..Default::default()
            }),
        );
        let v = production(&f, "m");
        healthy_instances(&f, "m", v, 1).await;

        let options = InferenceOptions {
            explain_prediction: true,
            ..Default::default()
        };
        let resp = f
            .router
            .process_inference(InferenceRequest::new("m", json!(1)).with_options(options))
            .await
            .unwrap();
        assert!(resp.explanation.is_some());
        assert!(resp.warnings.iter().any(|w| w.contains("low confidence")));
    }

    #[tokio::test]
    async fn least_connections_endpoint_prefers_idle_instance() {
        let f = fixture();
        f.router.register_backend("m", Arc::new(EchoBackend::default()));
        let v = production(&f, "m");
        f.router
            .register_endpoint(EndpointConfig::new("m", LoadBalancing::LeastConnections))
            .unwrap();
        let ids = healthy_instances(&f, "m", v, 2).await;

        f.router.pools.with(&"m".to_string(), |pool| {
            pool.iter_mut().find(|i| i.id == ids[0]).unwrap().active_connections = 5;
        });
        let resp = f.router.process_inference(InferenceRequest::new("m", json!(1))).await.unwrap();
        assert_eq!(served_by(&resp), ids[1]);
    }

    #[test]
    fn endpoint_paths_are_unique_per_model() {
        let f = fixture();
        let mut a = EndpointConfig::new("a", LoadBalancing::RoundRobin);
        a.path = Some("/score".into());
        f.router.register_endpoint(a).unwrap();
        let mut b = EndpointConfig::new("b", LoadBalancing::RoundRobin);
        b.path = Some("/score".into());
        assert!(f.router.register_endpoint(b).is_err());
        assert_eq!(f.router.endpoint_for_path("/score").unwrap().model_id, "a");
    }

    #[test]
    fn unknown_versions_cannot_get_instances() {
        let f = fixture();
        assert!(f.router.add_instance(NewInstance::new("ghost", Version::INITIAL)).is_err());
    }
}
