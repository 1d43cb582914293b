pub mod api;
pub mod config;
pub mod context;
pub mod deploy;
pub mod error;
pub mod events;
pub mod monitor;
pub mod notify;
pub mod reactor;
pub mod registry;
pub mod retrain;
pub mod serving;
pub mod store;
pub mod types;

pub use api::{ModelOps, ModelOpsBuilder};
pub use config::ModelOpsConfig;
pub use context::ServiceContext;
pub use error::{ModelOpsError, Result};
pub use events::{topics, Envelope, EventBus, ModelOpsEvent};
pub use notify::{notify_all, FanoutNotifier, LogNotifier, Notification, Notifier, RecordingNotifier, Severity};
pub use reactor::{Reaction, ReactionConfig, Reactor};
pub use types::*;

pub use deploy::{
    DeploymentExecution, DeploymentOrchestrator, DeploymentPlan, DeploymentPlatform, DeploymentStrategy,
    DeploymentTarget, ExecutionStatus, OrchestratorConfig, PlanState, PlanView, RouterPlatform, ScheduleOutcome,
    ScriptedPlatform, StepStatus, TriggerSource,
};
pub use monitor::{Alert, AlertConfig, AlertKind, ModelPerformance, MonitorConfig, PerformanceMonitor, PredictionSample};
pub use registry::{ArtifactStore, InMemoryArtifactStore, RegistryConfig, VersionRegistry};
pub use retrain::{RetrainConfig, RetrainOutcome, RetrainPolicy, RetrainStatus, RetrainTrigger, Trainer};
pub use serving::{
    EndpointConfig, HealthProbe, InferenceBackend, InferenceError, InferenceRequest, InferenceResponse,
    LoadBalancing, ModelInstance, NewInstance, Prediction, ServingConfig, ServingRouter,
};
