use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelOpsError, Result};

/// Type alias for model identifiers (e.g. `churn-v1`).
pub type ModelId = String;

/// Semantic version of a trained artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const INITIAL: Version = Version::new(1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// The version that follows `self` under the given increment policy.
    pub fn bump(self, increment: VersionIncrement) -> Self {
        match increment {
            VersionIncrement::Major => Self::new(self.major + 1, 0, 0),
            VersionIncrement::Minor => Self::new(self.major, self.minor + 1, 0),
            VersionIncrement::Patch => Self::new(self.major, self.minor, self.patch + 1),
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        let mut next = |name: &str| -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| ModelOpsError::Validation(format!("version '{}' is missing its {} part", s, name)))?
                .parse::<u32>()
                .map_err(|_| ModelOpsError::Validation(format!("version '{}' has a non-numeric {} part", s, name)))
        };
        let version = Version::new(next("major")?, next("minor")?, next("patch")?);
        if parts.next().is_some() {
            return Err(ModelOpsError::Validation(format!(
                "version '{}' has more than three parts",
                s
            )));
        }
        Ok(version)
    }
}

impl TryFrom<String> for Version {
    type Error = ModelOpsError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

/// Which part of the version a new registration increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionIncrement {
    Major,
    #[default]
    Minor,
    Patch,
}

/// Lifecycle status of a model version.
///
/// Status only moves forward: experimental → staging → production → archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Experimental,
    Staging,
    Production,
    Archived,
}

impl VersionStatus {
    pub fn rank(self) -> u8 {
        match self {
            VersionStatus::Experimental => 0,
            VersionStatus::Staging => 1,
            VersionStatus::Production => 2,
            VersionStatus::Archived => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Experimental => "experimental",
            VersionStatus::Staging => "staging",
            VersionStatus::Production => "production",
            VersionStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "experimental" => Ok(Self::Experimental),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            "archived" => Ok(Self::Archived),
            other => Err(ModelOpsError::Validation(format!("unknown status '{}'", other))),
        }
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub const ALL: [Environment; 3] = [
        Environment::Development,
        Environment::Staging,
        Environment::Production,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ModelOpsError::Validation(format!("unknown environment '{}'", other))),
        }
    }
}

/// Evaluation metrics of a trained artifact.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub accuracy: f64,
    pub loss: f64,
    pub f1: f64,
}

impl ModelMetrics {
    pub fn new(accuracy: f64, loss: f64, f1: f64) -> Self {
        Self { accuracy, loss, f1 }
    }

    /// Reject non-finite values and values outside their natural range.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("accuracy", self.accuracy), ("loss", self.loss), ("f1", self.f1)] {
            if !value.is_finite() {
                return Err(ModelOpsError::InvalidArtifact(format!("{} is not finite", name)));
            }
        }
        if !(0.0..=1.0).contains(&self.accuracy) {
            return Err(ModelOpsError::InvalidArtifact(format!(
                "accuracy {} is outside [0, 1]",
                self.accuracy
            )));
        }
        if !(0.0..=1.0).contains(&self.f1) {
            return Err(ModelOpsError::InvalidArtifact(format!("f1 {} is outside [0, 1]", self.f1)));
        }
        if self.loss < 0.0 {
            return Err(ModelOpsError::InvalidArtifact(format!("loss {} is negative", self.loss)));
        }
        Ok(())
    }
}

/// Provenance of a model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub created_at: DateTime<Utc>,
    pub trainer: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl VersionMetadata {
    pub fn new(trainer: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            trainer: trainer.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Output of a training run, before it is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Hyperparameters and model configuration.
    #[serde(default)]
    pub config: Value,
    /// Serialized weights. Handed to the artifact store on registration.
    pub weights: Vec<u8>,
    /// Evaluation metrics measured on the hold-out set.
    pub metrics: ModelMetrics,
}

/// An immutable record of a registered model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub model_id: ModelId,
    pub version: Version,
    pub config: Value,
    /// Reference returned by the artifact store.
    pub weights_ref: String,
    pub metrics: ModelMetrics,
    pub metadata: VersionMetadata,
    pub status: VersionStatus,
}

impl ModelVersion {
    pub fn key(&self) -> String {
        format!("{}@{}", self.model_id, self.version)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.iter().any(|t| t == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_and_orders() {
        let a: Version = "1.2.3".parse().unwrap();
        let b: Version = "v1.10.0".parse().unwrap();
        assert_eq!(a, Version::new(1, 2, 3));
        assert!(b > a);
        assert_eq!(b.to_string(), "1.10.0");
    }

    #[test]
    fn version_rejects_malformed_strings() {
        assert!("1.2".parse::<Version>().is_err());
        assert!("1.2.x".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
    }

    #[test]
    fn bump_resets_lower_parts() {
        let v = Version::new(2, 3, 4);
        assert_eq!(v.bump(VersionIncrement::Major), Version::new(3, 0, 0));
        assert_eq!(v.bump(VersionIncrement::Minor), Version::new(2, 4, 0));
        assert_eq!(v.bump(VersionIncrement::Patch), Version::new(2, 3, 5));
    }

    #[test]
    fn version_serializes_as_string() {
        let json = serde_json::to_string(&Version::new(2, 1, 0)).unwrap();
        assert_eq!(json, "\"2.1.0\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Version::new(2, 1, 0));
    }

    #[test]
    fn metrics_validation() {
        assert!(ModelMetrics::new(0.9, 0.2, 0.85).validate().is_ok());
        assert!(ModelMetrics::new(1.2, 0.2, 0.85).validate().is_err());
        assert!(ModelMetrics::new(0.9, -0.1, 0.85).validate().is_err());
        assert!(ModelMetrics::new(f64::NAN, 0.1, 0.5).validate().is_err());
    }

    #[test]
    fn status_rank_is_forward_only() {
        assert!(VersionStatus::Experimental.rank() < VersionStatus::Staging.rank());
        assert!(VersionStatus::Staging.rank() < VersionStatus::Production.rank());
        assert!(VersionStatus::Production.rank() < VersionStatus::Archived.rank());
        assert_eq!("Production".parse::<VersionStatus>().unwrap(), VersionStatus::Production);
    }
}
