//! Version registry: immutable model version records, promotion gates,
//! retention, and the per-environment deployment record.

mod artifact;

pub use artifact::{ArtifactStore, InMemoryArtifactStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ModelOpsError, Result};
use crate::events::{EventBus, ModelOpsEvent};
use crate::store::KeyedStore;
use crate::types::{
    Environment, ModelArtifact, ModelId, ModelVersion, Version, VersionIncrement, VersionMetadata,
    VersionStatus,
};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Minimum accuracy to enter staging.
    pub staging_threshold: f64,
    /// Minimum accuracy to enter production.
    pub production_threshold: f64,
    /// Non-production versions kept per model by `cleanup`.
    pub retain_versions: usize,
    /// Version part bumped on each registration.
    pub increment: VersionIncrement,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staging_threshold: 0.85,
            production_threshold: 0.90,
            retain_versions: 10,
            increment: VersionIncrement::Minor,
        }
    }
}

impl RegistryConfig {
    pub fn threshold_for(&self, status: VersionStatus) -> Option<f64> {
        match status {
            VersionStatus::Staging => Some(self.staging_threshold),
            VersionStatus::Production => Some(self.production_threshold),
            VersionStatus::Experimental | VersionStatus::Archived => None,
        }
    }
}

// ── Deployment record ─────────────────────────────────────────────────────────

/// One entry in an environment's deployment history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub version: Version,
    pub execution_id: Option<Uuid>,
    pub deployed_at: DateTime<Utc>,
    /// Set when this deployment replaced a degraded version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_from: Option<Version>,
}

#[derive(Default)]
struct ModelEntry {
    versions: Vec<ModelVersion>,
    /// Highest version ever allocated. Survives cleanup so numbers never repeat.
    high_water: Option<Version>,
    deployments: HashMap<Environment, Vec<DeploymentRecord>>,
}

impl ModelEntry {
    fn find(&self, version: &Version) -> Option<&ModelVersion> {
        self.versions.iter().find(|v| &v.version == version)
    }

    fn latest(&self, status: Option<VersionStatus>) -> Option<&ModelVersion> {
        self.versions
            .iter()
            .filter(|v| status.map_or(true, |s| v.status == s))
            .max_by(|a, b| {
                a.metadata
                    .created_at
                    .cmp(&b.metadata.created_at)
                    .then(a.version.cmp(&b.version))
            })
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct VersionRegistry {
    models: KeyedStore<ModelId, ModelEntry>,
    artifacts: Arc<dyn ArtifactStore>,
    config: RegistryConfig,
    events: EventBus,
}

impl VersionRegistry {
    pub fn new(config: RegistryConfig, artifacts: Arc<dyn ArtifactStore>, events: EventBus) -> Self {
        Self {
            models: KeyedStore::new(),
            artifacts,
            config,
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Register a trained artifact as the next version of `model_id`.
    ///
    /// The new version starts as `experimental`. Malformed artifacts are
    /// rejected before a version number is consumed.
    pub fn register(
        &self,
        model_id: &str,
        artifact: ModelArtifact,
        metadata: VersionMetadata,
    ) -> Result<ModelVersion> {
        self.register_with(model_id, artifact, metadata, self.config.increment)
    }

    /// `register`, bumping `increment` instead of the configured policy.
    pub fn register_with(
        &self,
        model_id: &str,
        artifact: ModelArtifact,
        metadata: VersionMetadata,
        increment: VersionIncrement,
    ) -> Result<ModelVersion> {
        validate_model_id(model_id)?;
        if artifact.weights.is_empty() {
            return Err(ModelOpsError::InvalidArtifact("weights are empty".into()));
        }
        artifact.metrics.validate()?;

        let artifacts = self.artifacts.clone();
        let registered = self.models.with_or_insert(
            model_id.to_string(),
            ModelEntry::default,
            |entry| -> Result<ModelVersion> {
                let version = match entry.high_water {
                    Some(v) => v.bump(increment),
                    None => Version::INITIAL,
                };
                let weights_ref = artifacts.put(model_id, &version, &artifact.weights)?;
                let record = ModelVersion {
                    model_id: model_id.to_string(),
                    version,
                    config: artifact.config,
                    weights_ref,
                    metrics: artifact.metrics,
                    metadata,
                    status: VersionStatus::Experimental,
                };
                entry.high_water = Some(version);
                entry.versions.push(record.clone());
                Ok(record)
            },
        )?;

        log::info!(
            "registered {} (accuracy {:.4}, trainer {})",
            registered.key(),
            registered.metrics.accuracy,
            registered.metadata.trainer
        );
        self.events.publish(ModelOpsEvent::VersionRegistered {
            model_id: registered.model_id.clone(),
            version: registered.version,
            tags: registered.metadata.tags.clone(),
        });
        Ok(registered)
    }

    /// Move a version forward to `target`.
    ///
    /// Fails with `ThresholdNotMet` when accuracy is below the target stage's
    /// threshold; the stored status is left untouched in that case.
    pub fn promote(&self, model_id: &str, version: &Version, target: VersionStatus) -> Result<ModelVersion> {
        let config = &self.config;
        let (promoted, from) = self
            .models
            .with(&model_id.to_string(), |entry| -> Result<(ModelVersion, VersionStatus)> {
                let record = entry
                    .versions
                    .iter_mut()
                    .find(|v| &v.version == version)
                    .ok_or_else(|| not_found(model_id, version))?;
                let from = record.status;
                if from == target {
                    return Ok((record.clone(), from));
                }
                if from == VersionStatus::Archived || target.rank() < from.rank() {
                    return Err(ModelOpsError::InvalidTransition { from, to: target });
                }
                if let Some(threshold) = config.threshold_for(target) {
                    if record.metrics.accuracy < threshold {
                        return Err(ModelOpsError::ThresholdNotMet {
                            model_id: model_id.to_string(),
                            version: version.to_string(),
                            stage: target,
                            accuracy: record.metrics.accuracy,
                            threshold,
                        });
                    }
                }
                record.status = target;
                Ok((record.clone(), from))
            })
            .ok_or_else(|| ModelOpsError::ModelNotFound(model_id.to_string()))??;

        if from != target {
            log::info!("promoted {} {} -> {}", promoted.key(), from, target);
            self.events.publish(ModelOpsEvent::VersionPromoted {
                model_id: promoted.model_id.clone(),
                version: promoted.version,
                from,
                to: target,
            });
        }
        Ok(promoted)
    }

    pub fn get_version(&self, model_id: &str, version: &Version) -> Result<ModelVersion> {
        self.models
            .with(&model_id.to_string(), |entry| entry.find(version).cloned())
            .ok_or_else(|| ModelOpsError::ModelNotFound(model_id.to_string()))?
            .ok_or_else(|| not_found(model_id, version))
    }

    /// Most recently created version, optionally restricted to one status.
    pub fn get_latest_version(&self, model_id: &str, status: Option<VersionStatus>) -> Option<ModelVersion> {
        self.models
            .with(&model_id.to_string(), |entry| entry.latest(status).cloned())
            .flatten()
    }

    /// All versions of a model, oldest version number first.
    pub fn list_versions(&self, model_id: &str) -> Result<Vec<ModelVersion>> {
        let mut versions = self
            .models
            .with(&model_id.to_string(), |entry| entry.versions.clone())
            .ok_or_else(|| ModelOpsError::ModelNotFound(model_id.to_string()))?;
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(versions)
    }

    pub fn list_models(&self) -> Vec<ModelId> {
        let mut ids = self.models.keys();
        ids.sort();
        ids
    }

    /// Keep every production version plus the `retain_versions` most recent
    /// non-production versions. Returns the versions that were dropped.
    pub fn cleanup(&self, model_id: &str) -> Result<Vec<ModelVersion>> {
        let retain = self.config.retain_versions;
        let removed = self
            .models
            .with(&model_id.to_string(), |entry| {
                let mut candidates: Vec<(DateTime<Utc>, Version)> = entry
                    .versions
                    .iter()
                    .filter(|v| v.status != VersionStatus::Production)
                    .map(|v| (v.metadata.created_at, v.version))
                    .collect();
                // Newest first.
                candidates.sort_by(|a, b| b.cmp(a));
                let doomed: Vec<Version> = candidates.into_iter().skip(retain).map(|(_, v)| v).collect();

                let (dropped, kept): (Vec<ModelVersion>, Vec<ModelVersion>) = entry
                    .versions
                    .drain(..)
                    .partition(|v| doomed.contains(&v.version));
                entry.versions = kept;
                dropped
            })
            .ok_or_else(|| ModelOpsError::ModelNotFound(model_id.to_string()))?;

        for version in &removed {
            if let Err(e) = self.artifacts.delete(&version.weights_ref) {
                log::warn!("failed to delete artifact {}: {}", version.weights_ref, e);
            }
        }
        if !removed.is_empty() {
            log::info!("cleanup of {} removed {} version(s)", model_id, removed.len());
        }
        Ok(removed)
    }

    // ── Deployment record ─────────────────────────────────────────────────────

    pub fn record_deployment(
        &self,
        model_id: &str,
        environment: Environment,
        version: &Version,
        execution_id: Option<Uuid>,
    ) -> Result<DeploymentRecord> {
        self.push_deployment(model_id, environment, version, execution_id, None)
    }

    /// Record `version` as restored in place of the degraded `from`.
    pub fn record_rollback(
        &self,
        model_id: &str,
        environment: Environment,
        version: &Version,
        from: &Version,
        execution_id: Option<Uuid>,
    ) -> Result<DeploymentRecord> {
        log::warn!("{}@{} on {} marked as rolled back", model_id, from, environment);
        self.push_deployment(model_id, environment, version, execution_id, Some(*from))
    }

    fn push_deployment(
        &self,
        model_id: &str,
        environment: Environment,
        version: &Version,
        execution_id: Option<Uuid>,
        rolled_back_from: Option<Version>,
    ) -> Result<DeploymentRecord> {
        self.models
            .with(&model_id.to_string(), |entry| {
                if entry.find(version).is_none() {
                    return Err(not_found(model_id, version));
                }
                let record = DeploymentRecord {
                    version: *version,
                    execution_id,
                    deployed_at: Utc::now(),
                    rolled_back_from,
                };
                entry.deployments.entry(environment).or_default().push(record.clone());
                Ok(record)
            })
            .ok_or_else(|| ModelOpsError::ModelNotFound(model_id.to_string()))?
    }

    pub fn current_deployment(&self, model_id: &str, environment: Environment) -> Option<DeploymentRecord> {
        self.models
            .with(&model_id.to_string(), |entry| {
                entry.deployments.get(&environment).and_then(|h| h.last().cloned())
            })
            .flatten()
    }

    /// The last known good deployment: the newest record whose version differs
    /// from the current one and has not been rolled back from since it was
    /// last deployed.
    pub fn previous_deployment(&self, model_id: &str, environment: Environment) -> Option<DeploymentRecord> {
        self.models
            .with(&model_id.to_string(), |entry| {
                let history = entry.deployments.get(&environment)?;
                let current = history.last()?.version;
                let mut degraded: HashSet<Version> = HashSet::new();
                for record in history {
                    degraded.remove(&record.version);
                    if let Some(from) = record.rolled_back_from {
                        degraded.insert(from);
                    }
                }
                history
                    .iter()
                    .rev()
                    .find(|r| r.version != current && !degraded.contains(&r.version))
                    .cloned()
            })
            .flatten()
    }

    pub fn deployment_history(&self, model_id: &str, environment: Environment) -> Vec<DeploymentRecord> {
        self.models
            .with(&model_id.to_string(), |entry| {
                entry.deployments.get(&environment).cloned().unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// The version that serves unpinned production traffic.
    ///
    /// Prefers the version recorded as deployed to production (if it still
    /// exists and is not archived), else the latest production-status version.
    pub fn production_version(&self, model_id: &str) -> Option<ModelVersion> {
        self.models
            .with(&model_id.to_string(), |entry| {
                let deployed = entry
                    .deployments
                    .get(&Environment::Production)
                    .and_then(|h| h.last())
                    .and_then(|r| entry.find(&r.version))
                    .filter(|v| v.status != VersionStatus::Archived);
                deployed
                    .or_else(|| entry.latest(Some(VersionStatus::Production)))
                    .cloned()
            })
            .flatten()
    }
}

fn not_found(model_id: &str, version: &Version) -> ModelOpsError {
    ModelOpsError::VersionNotFound {
        model_id: model_id.to_string(),
        version: version.to_string(),
    }
}

fn validate_model_id(model_id: &str) -> Result<()> {
    if model_id.is_empty() {
        return Err(ModelOpsError::InvalidArtifact("model id is empty".into()));
    }
    if !model_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ModelOpsError::InvalidArtifact(format!(
            "model id '{}' may only contain letters, digits, '-', '_' and '.'",
            model_id
        )));
    }
    Ok(())
}
