//! Inference routing across model instances.
//!
//! A request is resolved to a version (explicit, canary route, or the
//! production version), balanced onto a healthy instance of that version,
//! executed against the model's [`InferenceBackend`], and reported back to the
//! performance monitor.

mod balancer;
mod endpoint;
mod health;
mod inference;
mod instance;
mod router;

pub use balancer::{
    least_connections, pick_weighted, InstanceSelector, LeastConnectionsSelector, LoadBalancing,
    RoundRobinSelector, WeightedSelector,
};
pub use endpoint::{CanaryRoute, EndpointConfig, ModelEndpoint};
pub use health::{HealthProbe, HealthSweepResult, InProcessProbe, StaticProbe};
pub use inference::{
    InferenceBackend, InferenceError, InferenceOptions, InferenceRequest, InferenceResponse, Prediction,
    RequestMetadata, ResponseMetadata,
};
pub use instance::{InstanceHealth, ModelInstance, NewInstance, RequestStats};
pub use router::ServingRouter;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Strategy of endpoints created implicitly on first request.
    pub default_strategy: LoadBalancing,
    pub health_interval_secs: u64,
    /// A warming-up instance that fails probes stays warming this long.
    pub warmup_grace_secs: u64,
    pub default_timeout_ms: u64,
    /// Upper bound on per-request retries, whatever the request asks for.
    pub max_retries: u32,
    pub warn_error_rate: f64,
    pub min_requests_for_error_warning: u64,
    pub warn_latency_ms: f64,
    pub low_confidence: f64,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            default_strategy: LoadBalancing::RoundRobin,
            health_interval_secs: 15,
            warmup_grace_secs: 120,
            default_timeout_ms: 30_000,
            max_retries: 3,
            warn_error_rate: 0.05,
            min_requests_for_error_warning: 20,
            warn_latency_ms: 1_000.0,
            low_confidence: 0.5,
        }
    }
}
