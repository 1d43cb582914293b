use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use uuid::Uuid;

use super::execution::{DeploymentExecution, ExecutionStatus, RollbackRecord};
use super::plan::{ApprovalRecord, DeploymentPlan, DeploymentStrategy, PlanState, PlanView, TriggerSource};
use super::platform::DeploymentPlatform;
use super::step::{Slot, StepAction, StepStatus};
use super::target::{default_targets, targets_for, DeploymentTarget};
use crate::context::ServiceContext;
use crate::error::{ModelOpsError, Result};
use crate::events::ModelOpsEvent;
use crate::notify::{notify_all, Notification, Severity};
use crate::registry::VersionRegistry;
use crate::store::KeyedStore;
use crate::types::{Environment, Version, VersionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scan_interval_secs: u64,
    /// Traffic share of `canary` plans that do not name one.
    pub canary_percentage: u8,
    /// Finished executions kept for status queries.
    pub history_limit: usize,
    pub approval_channels: Vec<String>,
    pub notification_channels: Vec<String>,
    /// Extra attempts for build and deploy steps.
    pub step_retries: u32,
    pub retry_backoff_ms: u64,
    pub step_timeout_secs: u64,
    pub targets: Vec<DeploymentTarget>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            canary_percentage: 10,
            history_limit: 200,
            approval_channels: vec!["deployments".to_string()],
            notification_channels: vec!["deployments".to_string()],
            step_retries: 0,
            retry_backoff_ms: 500,
            step_timeout_secs: 600,
            targets: default_targets(),
        }
    }
}

/// What `schedule_deployment` did with a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    AwaitingApproval,
    Scheduled { at: DateTime<Utc> },
    Started { execution_id: Uuid },
}

struct PlanEntry {
    plan: DeploymentPlan,
    state: PlanState,
    executions: Vec<Uuid>,
}

/// Holds the active-execution slot of a plan; frees it when dropped.
struct ActiveGuard {
    active: Arc<DashMap<Uuid, Uuid>>,
    plan_id: Uuid,
}

impl ActiveGuard {
    fn acquire(active: Arc<DashMap<Uuid, Uuid>>, plan_id: Uuid, execution_id: Uuid) -> Result<Self> {
        match active.entry(plan_id) {
            Entry::Occupied(e) => {
                return Err(ModelOpsError::AlreadyRunning(format!(
                    "plan {} is executing as {}",
                    plan_id,
                    e.get()
                )))
            }
            Entry::Vacant(v) => {
                v.insert(execution_id);
            }
        }
        Ok(Self { active, plan_id })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.remove(&self.plan_id);
    }
}

enum StepRun {
    Done,
    Failed { step: String, message: String },
    Abandoned,
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Steps the plan makes redundant.
fn skip_reason(plan: &DeploymentPlan, action: &StepAction) -> Option<String> {
    match (action, plan.strategy) {
        (StepAction::PromoteToFull, DeploymentStrategy::Canary { percentage: 100 }) => {
            Some("canary already carries all traffic".to_string())
        }
        _ => None,
    }
}

fn status_for(environment: Environment) -> Option<VersionStatus> {
    match environment {
        Environment::Development => None,
        Environment::Staging => Some(VersionStatus::Staging),
        Environment::Production => Some(VersionStatus::Production),
    }
}

/// Plans, approves, and executes deployments step by step.
pub struct DeploymentOrchestrator {
    registry: Arc<VersionRegistry>,
    platform: Arc<dyn DeploymentPlatform>,
    plans: KeyedStore<Uuid, PlanEntry>,
    executions: KeyedStore<Uuid, DeploymentExecution>,
    /// Finished execution ids, oldest first.
    finished: Mutex<VecDeque<Uuid>>,
    /// plan id -> running execution id
    active: Arc<DashMap<Uuid, Uuid>>,
    cancels: DashMap<Uuid, watch::Sender<bool>>,
    config: OrchestratorConfig,
    ctx: ServiceContext,
}

impl DeploymentOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<VersionRegistry>,
        platform: Arc<dyn DeploymentPlatform>,
        ctx: ServiceContext,
    ) -> Self {
        Self {
            registry,
            platform,
            plans: KeyedStore::new(),
            executions: KeyedStore::new(),
            finished: Mutex::new(VecDeque::new()),
            active: Arc::new(DashMap::new()),
            cancels: DashMap::new(),
            config,
            ctx,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ── Plans ─────────────────────────────────────────────────────────────────

    pub fn create_deployment_plan(
        &self,
        model_id: &str,
        version: Version,
        environment: Environment,
        strategy: DeploymentStrategy,
        triggered_by: TriggerSource,
        reason: impl Into<String>,
    ) -> Result<DeploymentPlan> {
        self.registry.get_version(model_id, &version)?;
        if let DeploymentStrategy::Canary { percentage } = strategy {
            if percentage == 0 || percentage > 100 {
                return Err(ModelOpsError::Validation(format!(
                    "canary percentage must be 1..=100, got {}",
                    percentage
                )));
            }
        }
        let targets = targets_for(&self.config.targets, environment);
        if targets.is_empty() {
            return Err(ModelOpsError::Validation(format!(
                "no deployment target configured for {}",
                environment
            )));
        }

        let approval_required = environment == Environment::Production && !triggered_by.is_automated_response();
        let plan = DeploymentPlan {
            id: Uuid::now_v7(),
            model_id: model_id.to_string(),
            version,
            environment,
            strategy,
            targets,
            approval_required,
            triggered_by,
            reason: reason.into(),
            created_at: Utc::now(),
            scheduled_at: None,
            approval: None,
            rejection: None,
        };
        let state = if approval_required {
            PlanState::AwaitingApproval
        } else {
            PlanState::Scheduled
        };
        self.plans.insert(
            plan.id,
            PlanEntry {
                plan: plan.clone(),
                state,
                executions: Vec::new(),
            },
        );
        log::info!(
            "plan {} created: {} to {} via {} ({:?}, approval {})",
            plan.id,
            plan.key(),
            environment,
            strategy,
            triggered_by,
            if approval_required { "required" } else { "not required" }
        );
        Ok(plan)
    }

    /// Park, defer, or start a plan. `plan.scheduled_at` is taken from the argument.
    pub fn schedule_deployment(self: &Arc<Self>, plan: &DeploymentPlan) -> Result<ScheduleOutcome> {
        let now = Utc::now();
        let (stored, parked) = self
            .plans
            .with(&plan.id, |entry| -> Result<(DeploymentPlan, bool)> {
                if matches!(
                    entry.state,
                    PlanState::Running | PlanState::Completed | PlanState::Rejected
                ) {
                    return Err(ModelOpsError::PlanState {
                        plan_id: plan.id,
                        state: entry.state.to_string(),
                        reason: "cannot be scheduled".into(),
                    });
                }
                entry.plan.scheduled_at = plan.scheduled_at;
                let parked = !entry.plan.is_approved();
                entry.state = if parked {
                    PlanState::AwaitingApproval
                } else {
                    PlanState::Scheduled
                };
                Ok((entry.plan.clone(), parked))
            })
            .ok_or(ModelOpsError::PlanNotFound(plan.id))??;

        if parked {
            self.request_approval(&stored);
            return Ok(ScheduleOutcome::AwaitingApproval);
        }
        if let Some(at) = stored.scheduled_at.filter(|at| *at > now) {
            log::info!("plan {} deferred until {}", stored.id, at);
            return Ok(ScheduleOutcome::Scheduled { at });
        }
        let execution_id = self.start_deployment(stored.id)?;
        Ok(ScheduleOutcome::Started { execution_id })
    }

    fn request_approval(&self, plan: &DeploymentPlan) {
        let notification = Notification::new(
            format!("Approval required: {} to {}", plan.key(), plan.environment),
            format!(
                "Plan {} ({} strategy, triggered by {:?}): {}",
                plan.id, plan.strategy, plan.triggered_by, plan.reason
            ),
            Severity::Warning,
        )
        .for_model(plan.model_id.clone());
        notify_all(self.ctx.notifier.as_ref(), &self.config.approval_channels, &notification);
        self.ctx.events.publish(ModelOpsEvent::ApprovalRequested {
            plan_id: plan.id,
            model_id: plan.model_id.clone(),
            version: plan.version,
            environment: plan.environment,
        });
        log::info!("plan {} awaiting approval", plan.id);
    }

    pub fn approve_deployment(&self, plan_id: Uuid, approver: &str) -> Result<DeploymentPlan> {
        if approver.trim().is_empty() {
            return Err(ModelOpsError::Validation("approver is empty".into()));
        }
        let plan = self
            .plans
            .with(&plan_id, |entry| -> Result<DeploymentPlan> {
                if entry.state != PlanState::AwaitingApproval {
                    return Err(ModelOpsError::PlanState {
                        plan_id,
                        state: entry.state.to_string(),
                        reason: "not awaiting approval".into(),
                    });
                }
                entry.plan.approval = Some(ApprovalRecord {
                    approver: approver.to_string(),
                    decided_at: Utc::now(),
                    comment: None,
                });
                entry.state = PlanState::Scheduled;
                Ok(entry.plan.clone())
            })
            .ok_or(ModelOpsError::PlanNotFound(plan_id))??;
        log::info!("plan {} approved by {}", plan_id, approver);
        Ok(plan)
    }

    /// Approve and hand the plan straight to scheduling.
    pub fn approve_and_schedule(self: &Arc<Self>, plan_id: Uuid, approver: &str) -> Result<ScheduleOutcome> {
        let plan = self.approve_deployment(plan_id, approver)?;
        self.schedule_deployment(&plan)
    }

    pub fn reject_deployment(&self, plan_id: Uuid, approver: &str, reason: &str) -> Result<DeploymentPlan> {
        let plan = self
            .plans
            .with(&plan_id, |entry| -> Result<DeploymentPlan> {
                if entry.state != PlanState::AwaitingApproval {
                    return Err(ModelOpsError::PlanState {
                        plan_id,
                        state: entry.state.to_string(),
                        reason: "not awaiting approval".into(),
                    });
                }
                entry.plan.rejection = Some(ApprovalRecord {
                    approver: approver.to_string(),
                    decided_at: Utc::now(),
                    comment: Some(reason.to_string()),
                });
                entry.state = PlanState::Rejected;
                Ok(entry.plan.clone())
            })
            .ok_or(ModelOpsError::PlanNotFound(plan_id))??;
        log::info!("plan {} rejected by {}: {}", plan_id, approver, reason);
        Ok(plan)
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    fn begin(&self, plan_id: Uuid) -> Result<(DeploymentPlan, Uuid, ActiveGuard)> {
        let plan = self
            .plans
            .with(&plan_id, |entry| -> Result<DeploymentPlan> {
                let blocked = match entry.state {
                    PlanState::Rejected | PlanState::Completed => Some("cannot be executed again"),
                    _ if !entry.plan.is_approved() => Some("awaiting approval"),
                    _ => None,
                };
                match blocked {
                    Some(reason) => Err(ModelOpsError::PlanState {
                        plan_id,
                        state: entry.state.to_string(),
                        reason: reason.into(),
                    }),
                    None => Ok(entry.plan.clone()),
                }
            })
            .ok_or(ModelOpsError::PlanNotFound(plan_id))??;

        let execution = DeploymentExecution::new(&plan);
        let execution_id = execution.id;
        let guard = ActiveGuard::acquire(self.active.clone(), plan_id, execution_id)?;
        self.executions.insert(execution_id, execution);
        self.cancels.insert(execution_id, watch::channel(false).0);
        self.plans.with(&plan_id, |entry| {
            entry.state = PlanState::Running;
            entry.executions.push(execution_id);
        });
        Ok((plan, execution_id, guard))
    }

    /// Run a plan to a terminal status on the current task.
    pub async fn execute_deployment(&self, plan_id: Uuid) -> Result<DeploymentExecution> {
        let (plan, execution_id, guard) = self.begin(plan_id)?;
        Ok(self.run(plan, execution_id, guard).await)
    }

    /// Run a plan on a background task; returns the execution id at once.
    pub fn start_deployment(self: &Arc<Self>, plan_id: Uuid) -> Result<Uuid> {
        let (plan, execution_id, guard) = self.begin(plan_id)?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(plan, execution_id, guard).await;
        });
        Ok(execution_id)
    }

    /// Apply `f` unless the execution already reached a terminal status.
    fn update_live(&self, id: Uuid, f: impl FnOnce(&mut DeploymentExecution)) -> bool {
        self.executions
            .with(&id, |e| {
                if e.status.is_terminal() {
                    false
                } else {
                    f(e);
                    true
                }
            })
            .unwrap_or(false)
    }

    fn is_terminal(&self, id: Uuid) -> bool {
        self.executions
            .with(&id, |e| e.status.is_terminal())
            .unwrap_or(true)
    }

    async fn run(&self, plan: DeploymentPlan, execution_id: Uuid, _guard: ActiveGuard) -> DeploymentExecution {
        let mut cancel_rx = match self.cancels.get(&execution_id) {
            Some(tx) => tx.subscribe(),
            None => watch::channel(false).1,
        };

        let started = Utc::now();
        let actions: Vec<StepAction> = self
            .executions
            .with(&execution_id, |e| {
                if e.status == ExecutionStatus::Pending {
                    e.status = ExecutionStatus::Running;
                    e.started_at = Some(started);
                }
                e.steps.iter().map(|s| s.action.clone()).collect()
            })
            .unwrap_or_default();
        self.ctx.events.publish(ModelOpsEvent::DeploymentStarted {
            execution_id,
            plan_id: plan.id,
            model_id: plan.model_id.clone(),
            version: plan.version,
            environment: plan.environment,
        });
        log::info!(
            "execution {} started: {} to {} ({})",
            execution_id,
            plan.key(),
            plan.environment,
            plan.strategy
        );

        for (idx, action) in actions.iter().enumerate() {
            if self.is_terminal(execution_id) {
                break;
            }
            if let Some(reason) = skip_reason(&plan, action) {
                log::info!("execution {} skips {}: {}", execution_id, action.name(), reason);
                self.update_live(execution_id, |e| e.steps[idx].skip(Utc::now(), reason));
                continue;
            }
            match self.run_step(&plan, execution_id, idx, action, &mut cancel_rx).await {
                StepRun::Done => {}
                StepRun::Failed { step, message } => {
                    log::warn!("execution {} failed at {}: {}", execution_id, step, message);
                    self.update_live(execution_id, |e| e.fail(&step, message));
                    break;
                }
                StepRun::Abandoned => break,
            }
        }

        if !self.is_terminal(execution_id) {
            let replaced = self
                .registry
                .current_deployment(&plan.model_id, plan.environment)
                .map(|r| r.version)
                .filter(|v| *v != plan.version);
            let recorded = match replaced {
                Some(from) if plan.triggered_by == TriggerSource::Degradation => self.registry.record_rollback(
                    &plan.model_id,
                    plan.environment,
                    &plan.version,
                    &from,
                    Some(execution_id),
                ),
                _ => self
                    .registry
                    .record_deployment(&plan.model_id, plan.environment, &plan.version, Some(execution_id)),
            };
            match recorded {
                Ok(_) => {
                    self.update_live(execution_id, |e| e.status = ExecutionStatus::Completed);
                }
                Err(e) => {
                    self.update_live(execution_id, |ex| ex.fail("record", e.to_string()));
                }
            }
        }

        let succeeded = self
            .executions
            .with(&execution_id, |e| e.status == ExecutionStatus::Completed)
            .unwrap_or(false);
        if succeeded {
            self.finish_success(&plan, execution_id).await;
        } else {
            self.finish_failure(&plan, execution_id).await;
        }

        let snapshot = self
            .executions
            .with(&execution_id, |e| {
                e.seal(Utc::now());
                e.clone()
            })
            .unwrap_or_else(|| DeploymentExecution::new(&plan));
        self.plans.with(&plan.id, |entry| {
            entry.state = if succeeded {
                PlanState::Completed
            } else {
                PlanState::Failed
            };
        });
        self.cancels.remove(&execution_id);
        self.retire(execution_id);
        snapshot
    }

    async fn run_step(
        &self,
        plan: &DeploymentPlan,
        execution_id: Uuid,
        idx: usize,
        action: &StepAction,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> StepRun {
        let max_attempts = if action.is_retryable() {
            1 + self.config.step_retries
        } else {
            1
        };
        let timeout = StdDuration::from_secs(self.config.step_timeout_secs.max(1));
        let mut attempt = 0;
        loop {
            attempt += 1;
            let at = Utc::now();
            let mut name = String::new();
            let live = self.update_live(execution_id, |e| {
                let step = &mut e.steps[idx];
                step.start(at);
                step.attempts = attempt;
                name = step.name.clone();
            });
            if !live {
                return StepRun::Abandoned;
            }

            let result = tokio::select! {
                r = tokio::time::timeout(timeout, self.perform(plan, execution_id, action)) => match r {
                    Ok(r) => r,
                    Err(_) => Err(ModelOpsError::Platform(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    ))),
                },
                _ = cancelled(cancel_rx) => return StepRun::Abandoned,
            };

            match result {
                Ok(output) => {
                    log::debug!("execution {} step {}: {}", execution_id, name, output);
                    let live = self.update_live(execution_id, |e| e.steps[idx].finish(Utc::now(), Ok(output)));
                    return if live { StepRun::Done } else { StepRun::Abandoned };
                }
                Err(e) if attempt < max_attempts => {
                    let backoff = self
                        .config
                        .retry_backoff_ms
                        .saturating_mul(1u64 << (attempt - 1).min(16));
                    log::warn!(
                        "execution {} step {} attempt {} failed, retrying in {}ms: {}",
                        execution_id,
                        name,
                        attempt,
                        backoff,
                        e
                    );
                    tokio::time::sleep(StdDuration::from_millis(backoff)).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.update_live(execution_id, |ex| {
                        ex.steps[idx].finish(Utc::now(), Err(message.clone()))
                    });
                    return StepRun::Failed { step: name, message };
                }
            }
        }
    }

    async fn perform(&self, plan: &DeploymentPlan, execution_id: Uuid, action: &StepAction) -> Result<String> {
        match action {
            StepAction::Validate => self.validate(plan),
            StepAction::Build => self.platform.build(plan).await,
            StepAction::Test => self.platform.test(plan, Slot::Primary).await,
            StepAction::Deploy { target: Some(name) } => {
                let target = plan
                    .targets
                    .iter()
                    .find(|t| &t.name == name)
                    .ok_or_else(|| ModelOpsError::Validation(format!("unknown target {}", name)))?;
                self.platform.deploy(plan, target, Slot::Primary, 100).await
            }
            StepAction::Deploy { target: None } => self.deploy_all(plan, Slot::Primary, 100).await,
            StepAction::DeploySecondary => self.deploy_all(plan, Slot::Secondary, 0).await,
            StepAction::TestSecondary => self.platform.test(plan, Slot::Secondary).await,
            StepAction::SwitchTraffic => self.platform.switch_traffic(plan).await,
            StepAction::DeployCanary { percentage } => self.deploy_all(plan, Slot::Canary, *percentage).await,
            StepAction::PromoteToFull => self.platform.promote(plan).await,
            StepAction::MonitorCanary | StepAction::Monitor => {
                let rate = self.platform.error_rate(plan).await?;
                self.executions.with(&execution_id, |e| e.metrics.observed_error_rate = Some(rate));
                let limit = plan.error_rate_limit();
                if rate > limit {
                    return Err(ModelOpsError::Platform(format!(
                        "error rate {:.2}% above rollback threshold {:.2}%",
                        rate * 100.0,
                        limit * 100.0
                    )));
                }
                Ok(format!("error rate {:.2}% within {:.2}%", rate * 100.0, limit * 100.0))
            }
        }
    }

    async fn deploy_all(&self, plan: &DeploymentPlan, slot: Slot, traffic: u8) -> Result<String> {
        let mut outputs = Vec::with_capacity(plan.targets.len());
        for target in &plan.targets {
            outputs.push(self.platform.deploy(plan, target, slot, traffic).await?);
        }
        Ok(outputs.join("; "))
    }

    fn validate(&self, plan: &DeploymentPlan) -> Result<String> {
        let version = self.registry.get_version(&plan.model_id, &plan.version)?;
        if version.status == VersionStatus::Archived {
            return Err(ModelOpsError::Validation(format!("{} is archived", plan.key())));
        }
        if let Some(threshold) = status_for(plan.environment).and_then(|s| self.registry.config().threshold_for(s)) {
            if version.metrics.accuracy < threshold {
                return Err(ModelOpsError::Validation(format!(
                    "accuracy {:.3} below {} threshold {:.3}",
                    version.metrics.accuracy, plan.environment, threshold
                )));
            }
        }
        if plan.targets.is_empty() {
            return Err(ModelOpsError::Validation("plan has no targets".into()));
        }
        Ok(format!(
            "{} ({}) accuracy {:.3}, {} target(s)",
            plan.key(),
            version.status,
            version.metrics.accuracy,
            plan.targets.len()
        ))
    }

    async fn finish_success(&self, plan: &DeploymentPlan, execution_id: Uuid) {
        if let Some(target) = status_for(plan.environment) {
            match self.registry.get_version(&plan.model_id, &plan.version) {
                Ok(v) if v.status.rank() < target.rank() => {
                    if let Err(e) = self.registry.promote(&plan.model_id, &plan.version, target) {
                        log::warn!("deployed {} but could not promote it to {}: {}", plan.key(), target, e);
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("deployed {} but could not read it back: {}", plan.key(), e),
            }
        }
        if let Err(e) = self.platform.complete(plan).await {
            log::error!("platform completion for {} failed: {}", plan.key(), e);
        }
        self.ctx.events.publish(ModelOpsEvent::DeploymentCompleted {
            execution_id,
            plan_id: plan.id,
            model_id: plan.model_id.clone(),
            version: plan.version,
            environment: plan.environment,
        });
        let notification = Notification::new(
            format!("Deployed {} to {}", plan.key(), plan.environment),
            format!("Execution {} completed ({})", execution_id, plan.strategy),
            Severity::Info,
        )
        .for_model(plan.model_id.clone());
        notify_all(self.ctx.notifier.as_ref(), &self.config.notification_channels, &notification);
        log::info!("execution {} completed: {} on {}", execution_id, plan.key(), plan.environment);
    }

    async fn finish_failure(&self, plan: &DeploymentPlan, execution_id: Uuid) {
        let (summary, cancel_reason) = self
            .executions
            .with(&execution_id, |e| (e.failure.clone(), e.cancel_reason.clone()))
            .unwrap_or_default();
        let (step, error) = summary
            .map(|f| (f.step, f.message))
            .unwrap_or_else(|| ("unknown".to_string(), "execution failed".to_string()));
        self.ctx.events.publish(ModelOpsEvent::DeploymentFailed {
            execution_id,
            plan_id: plan.id,
            model_id: plan.model_id.clone(),
            version: plan.version,
            environment: plan.environment,
            step: step.clone(),
            error: error.clone(),
        });

        let mut body = format!("Execution {} failed at {}: {}", execution_id, step, error);
        if let Some(reason) = cancel_reason {
            log::info!("execution {} was cancelled ({}); no rollback", execution_id, reason);
        } else if plan.environment == Environment::Production {
            let rollback = self.rollback(plan, execution_id).await;
            body.push_str(&format!(
                "; rollback to {} {}",
                rollback
                    .to_version
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "nothing".into()),
                if rollback.succeeded { "succeeded" } else { "failed" }
            ));
        }
        let notification = Notification::new(
            format!("Deployment of {} to {} failed", plan.key(), plan.environment),
            body,
            Severity::Critical,
        )
        .for_model(plan.model_id.clone());
        notify_all(self.ctx.notifier.as_ref(), &self.config.notification_channels, &notification);
    }

    /// Restore the version last recorded as deployed to the plan's environment.
    async fn rollback(&self, plan: &DeploymentPlan, execution_id: Uuid) -> RollbackRecord {
        let to = self
            .registry
            .current_deployment(&plan.model_id, plan.environment)
            .map(|r| r.version);
        let started_at = Utc::now();
        log::warn!(
            "rolling back {} on {} to {:?}",
            plan.key(),
            plan.environment,
            to.map(|v| v.to_string())
        );
        let result = self.platform.rollback(plan, to).await;
        let record = RollbackRecord {
            from_version: plan.version,
            to_version: to,
            started_at,
            finished_at: Some(Utc::now()),
            succeeded: result.is_ok(),
            output: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        self.executions.with(&execution_id, |e| {
            e.rollback = Some(record.clone());
            if record.succeeded {
                e.status = ExecutionStatus::RolledBack;
            }
        });
        match &result {
            Ok(_) => {
                self.ctx.events.publish(ModelOpsEvent::DeploymentRolledBack {
                    execution_id,
                    model_id: plan.model_id.clone(),
                    environment: plan.environment,
                    from_version: plan.version,
                    to_version: to,
                });
            }
            Err(e) => log::error!("rollback of {} failed: {}", plan.key(), e),
        }
        record
    }

    /// Move a finished execution into bounded history.
    fn retire(&self, execution_id: Uuid) {
        let evicted: Vec<Uuid> = {
            let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
            finished.push_back(execution_id);
            let excess = finished.len().saturating_sub(self.config.history_limit.max(1));
            finished.drain(..excess).collect()
        };
        for id in evicted {
            self.executions.remove(&id);
        }
    }

    /// Mark a running execution failed; the in-flight step is abandoned.
    pub fn cancel_deployment(&self, execution_id: Uuid, reason: &str) -> Result<DeploymentExecution> {
        let now = Utc::now();
        let snapshot = self
            .executions
            .with(&execution_id, |e| -> Result<DeploymentExecution> {
                if e.status.is_terminal() {
                    return Err(ModelOpsError::Validation(format!(
                        "execution {} already {}",
                        execution_id,
                        e.status.as_str()
                    )));
                }
                for step in e.steps.iter_mut().filter(|s| s.status == StepStatus::Running) {
                    step.finish(now, Err("abandoned: execution cancelled".into()));
                }
                let at = e
                    .steps
                    .iter()
                    .find(|s| s.status == StepStatus::Failed)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| "cancel".to_string());
                e.cancel_reason = Some(reason.to_string());
                e.fail(&at, format!("cancelled: {}", reason));
                Ok(e.clone())
            })
            .ok_or(ModelOpsError::ExecutionNotFound(execution_id))??;
        if let Some(tx) = self.cancels.get(&execution_id) {
            let _ = tx.send(true);
        }
        log::warn!("execution {} cancelled: {}", execution_id, reason);
        Ok(snapshot)
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn get_execution(&self, execution_id: Uuid) -> Result<DeploymentExecution> {
        self.executions
            .get(&execution_id)
            .ok_or(ModelOpsError::ExecutionNotFound(execution_id))
    }

    pub fn get_plan(&self, plan_id: Uuid) -> Result<PlanView> {
        self.plans
            .with(&plan_id, |entry| self.view(entry))
            .ok_or(ModelOpsError::PlanNotFound(plan_id))
    }

    fn view(&self, entry: &PlanEntry) -> PlanView {
        let wait_reason = match entry.state {
            PlanState::AwaitingApproval => Some(format!(
                "awaiting approval on {}",
                self.config.approval_channels.join(", ")
            )),
            PlanState::Scheduled => Some(match entry.plan.scheduled_at {
                Some(at) if at > Utc::now() => format!("scheduled for {}", at.to_rfc3339()),
                Some(_) => "due, waiting for the next scan".to_string(),
                None => "not scheduled".to_string(),
            }),
            PlanState::Rejected => entry
                .plan
                .rejection
                .as_ref()
                .map(|r| format!("rejected by {}: {}", r.approver, r.comment.as_deref().unwrap_or(""))),
            _ => None,
        };
        PlanView {
            plan: entry.plan.clone(),
            state: entry.state,
            wait_reason,
            executions: entry.executions.clone(),
        }
    }

    /// Every plan, oldest first.
    pub fn list_plans(&self) -> Vec<PlanView> {
        let mut views: Vec<PlanView> = self
            .plans
            .keys()
            .iter()
            .filter_map(|id| self.plans.with(id, |e| self.view(e)))
            .collect();
        views.sort_by_key(|v| v.plan.created_at);
        views
    }

    /// Finished executions, newest first.
    pub fn history(&self, limit: usize) -> Vec<DeploymentExecution> {
        let ids: Vec<Uuid> = {
            let finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
            finished.iter().rev().take(limit).copied().collect()
        };
        ids.iter().filter_map(|id| self.executions.get(id)).collect()
    }

    pub fn active_executions(&self) -> Vec<DeploymentExecution> {
        let ids: Vec<Uuid> = self.active.iter().map(|e| *e.value()).collect();
        ids.iter().filter_map(|id| self.executions.get(id)).collect()
    }

    // ── Background scan ───────────────────────────────────────────────────────

    /// Start every approved plan whose `scheduled_at` has passed.
    pub fn scan_due(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<Uuid> = self
            .plans
            .keys()
            .into_iter()
            .filter(|id| {
                self.plans
                    .with(id, |e| {
                        e.state == PlanState::Scheduled
                            && e.plan.is_approved()
                            && e.plan.scheduled_at.map_or(false, |at| at <= now)
                    })
                    .unwrap_or(false)
                    && !self.active.contains_key(id)
            })
            .collect();

        let mut started = Vec::new();
        for plan_id in due {
            match self.start_deployment(plan_id) {
                Ok(execution_id) => started.push(execution_id),
                Err(ModelOpsError::AlreadyRunning(_)) => {}
                Err(e) => log::warn!("scheduled plan {} not started: {}", plan_id, e),
            }
        }
        started
    }

    pub async fn run_scan_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(StdDuration::from_secs(self.config.scan_interval_secs.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let started = self.scan_due(Utc::now());
            if !started.is_empty() {
                log::info!("deployment scan started {} execution(s)", started.len());
            }
        }
    }

    // ── Automated responses ───────────────────────────────────────────────────

    /// Plan a return to the previously deployed production version.
    ///
    /// Returns `None` when there is nothing to return to or a rollback plan
    /// for the model is already pending.
    pub fn create_rollback_plan(&self, model_id: &str, reason: &str) -> Result<Option<DeploymentPlan>> {
        let Some(previous) = self.registry.previous_deployment(model_id, Environment::Production) else {
            log::info!("no earlier production deployment of {} to roll back to", model_id);
            return Ok(None);
        };
        let pending = self.plans.keys().iter().any(|id| {
            self.plans
                .with(id, |e| {
                    e.plan.model_id == model_id
                        && e.plan.triggered_by == TriggerSource::Degradation
                        && matches!(e.state, PlanState::Scheduled | PlanState::Running)
                })
                .unwrap_or(false)
        });
        if pending {
            log::info!("rollback of {} already pending", model_id);
            return Ok(None);
        }
        let plan = self.create_deployment_plan(
            model_id,
            previous.version,
            Environment::Production,
            DeploymentStrategy::Immediate,
            TriggerSource::Degradation,
            reason,
        )?;
        Ok(Some(plan))
    }
}
