use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::ModelOpsConfig;
use crate::context::ServiceContext;
use crate::deploy::{
    DeploymentOrchestrator, DeploymentPlan, DeploymentPlatform, DeploymentStrategy, RouterPlatform, ScheduleOutcome,
    TriggerSource,
};
use crate::error::Result;
use crate::events::EventBus;
use crate::monitor::PerformanceMonitor;
use crate::notify::{LogNotifier, Notifier};
use crate::reactor::Reactor;
use crate::registry::{ArtifactStore, InMemoryArtifactStore, VersionRegistry};
use crate::retrain::{RetrainTrigger, Trainer};
use crate::serving::{HealthProbe, InProcessProbe, InferenceError, InferenceRequest, InferenceResponse, ServingRouter};
use crate::types::{Environment, Version};

/// Collaborators for [`ModelOps::build`]. Anything left unset gets the
/// in-process default.
#[derive(Default)]
pub struct ModelOpsBuilder {
    config: ModelOpsConfig,
    events: Option<EventBus>,
    notifier: Option<Arc<dyn Notifier>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    probe: Option<Arc<dyn HealthProbe>>,
    platform: Option<Arc<dyn DeploymentPlatform>>,
    trainer: Option<Arc<dyn Trainer>>,
}

impl ModelOpsBuilder {
    pub fn new(config: ModelOpsConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Replaces the router-backed platform.
    pub fn platform(mut self, platform: Arc<dyn DeploymentPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Enables the retrain trigger.
    pub fn trainer(mut self, trainer: Arc<dyn Trainer>) -> Self {
        self.trainer = Some(trainer);
        self
    }

    pub fn build(self) -> Result<ModelOps> {
        self.config.validate()?;
        let config = self.config;
        let ctx = ServiceContext::new(
            self.events.unwrap_or_default(),
            self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
        );

        let registry = Arc::new(VersionRegistry::new(
            config.registry.clone(),
            self.artifacts.unwrap_or_else(|| Arc::new(InMemoryArtifactStore::new())),
            ctx.events.clone(),
        ));
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone(), ctx.clone()));
        let router = Arc::new(ServingRouter::new(
            config.serving.clone(),
            registry.clone(),
            monitor.clone(),
            self.probe.unwrap_or_else(|| Arc::new(InProcessProbe)),
            ctx.clone(),
        ));
        let platform = self
            .platform
            .unwrap_or_else(|| Arc::new(RouterPlatform::new(router.clone(), registry.clone())));
        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            config.orchestrator.clone(),
            registry.clone(),
            platform,
            ctx.clone(),
        ));
        let retrain = self.trainer.map(|trainer| {
            Arc::new(RetrainTrigger::new(
                config.retrain.clone(),
                registry.clone(),
                monitor.clone(),
                trainer,
                ctx.clone(),
            ))
        });
        let mut reactor = Reactor::new(config.reactions.clone(), orchestrator.clone());
        if let Some(r) = &retrain {
            reactor = reactor.with_retrain(r.clone());
        }

        Ok(ModelOps {
            config,
            ctx,
            registry,
            monitor,
            router,
            orchestrator,
            retrain,
            reactor: Arc::new(reactor),
        })
    }
}

/// The wired control plane: registry, monitor, retrain trigger, orchestrator,
/// and serving router sharing one event bus and notifier.
///
/// # Example
/// ```rust,no_run
/// use modelops_core::{ModelOps, ModelOpsConfig};
///
/// # async fn run() -> modelops_core::Result<()> {
/// let ops = ModelOps::builder(ModelOpsConfig::default()).build()?;
/// let tasks = ops.spawn_background();
/// // ... register versions, deploy, serve ...
/// for task in tasks {
///     task.abort();
/// }
/// # Ok(())
/// # }
/// ```
pub struct ModelOps {
    config: ModelOpsConfig,
    ctx: ServiceContext,
    registry: Arc<VersionRegistry>,
    monitor: Arc<PerformanceMonitor>,
    router: Arc<ServingRouter>,
    orchestrator: Arc<DeploymentOrchestrator>,
    retrain: Option<Arc<RetrainTrigger>>,
    reactor: Arc<Reactor>,
}

impl ModelOps {
    pub fn builder(config: ModelOpsConfig) -> ModelOpsBuilder {
        ModelOpsBuilder::new(config)
    }

    pub fn config(&self) -> &ModelOpsConfig {
        &self.config
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn registry(&self) -> &Arc<VersionRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn router(&self) -> &Arc<ServingRouter> {
        &self.router
    }

    pub fn orchestrator(&self) -> &Arc<DeploymentOrchestrator> {
        &self.orchestrator
    }

    pub fn retrain(&self) -> Option<&Arc<RetrainTrigger>> {
        self.retrain.as_ref()
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Create a manual plan and schedule it in one call.
    pub fn deploy(
        &self,
        model_id: &str,
        version: Version,
        environment: Environment,
        strategy: DeploymentStrategy,
        reason: &str,
    ) -> Result<(DeploymentPlan, ScheduleOutcome)> {
        let plan = self.orchestrator.create_deployment_plan(
            model_id,
            version,
            environment,
            strategy,
            TriggerSource::Manual,
            reason,
        )?;
        let outcome = self.orchestrator.schedule_deployment(&plan)?;
        Ok((plan, outcome))
    }

    pub async fn predict(&self, request: InferenceRequest) -> std::result::Result<InferenceResponse, InferenceError> {
        self.router.process_inference(request).await
    }

    /// Spawn the deployment scan, health sweep, retention sweep, retrain
    /// scheduler, and event reactor. Abort the handles to stop them.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            tokio::spawn(self.orchestrator.clone().run_scan_loop()),
            tokio::spawn(self.router.clone().run_health_loop()),
            tokio::spawn(self.monitor.clone().run_retention_loop()),
            tokio::spawn(self.reactor.clone().run(self.ctx.events.subscribe_all())),
        ];
        if let Some(retrain) = &self.retrain {
            tasks.push(tokio::spawn(retrain.clone().run_scheduler()));
        }
        log::info!("started {} background task(s)", tasks.len());
        tasks
    }
}
