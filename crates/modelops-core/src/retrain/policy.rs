use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tuning::TuningConfig;
use crate::error::{ModelOpsError, Result};
use crate::monitor::ModelPerformance;
use crate::types::ModelMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    pub fn interval(self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainSchedule {
    pub frequency: Frequency,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Conditions under which a scheduled or unforced trigger retrains.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrainCriteria {
    pub min_accuracy: f64,
    pub max_loss: f64,
    pub max_drift: f64,
    /// Accuracy and loss rules only apply once this many samples exist.
    pub min_samples: usize,
}

impl Default for RetrainCriteria {
    fn default() -> Self {
        Self {
            min_accuracy: 0.85,
            max_loss: 0.4,
            max_drift: 0.5,
            min_samples: 10,
        }
    }
}

impl RetrainCriteria {
    /// Human-readable reasons the model should be retrained. Empty when none hold.
    pub fn reasons(&self, perf: &ModelPerformance, drift: f64) -> Vec<String> {
        let mut out = Vec::new();
        if perf.sample_count >= self.min_samples {
            if perf.accuracy < self.min_accuracy {
                out.push(format!("accuracy {:.4} < {:.4}", perf.accuracy, self.min_accuracy));
            }
            if perf.loss > self.max_loss {
                out.push(format!("loss {:.4} > {:.4}", perf.loss, self.max_loss));
            }
        }
        if drift > self.max_drift {
            out.push(format!("drift {:.4} > {:.4}", drift, self.max_drift));
        }
        out
    }
}

/// Bar a freshly trained model must clear before it is registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptanceCriteria {
    pub min_accuracy: f64,
    pub max_loss: f64,
    /// Also require beating the current production version's accuracy.
    pub must_beat_production: bool,
}

impl Default for AcceptanceCriteria {
    fn default() -> Self {
        Self {
            min_accuracy: 0.85,
            max_loss: 0.5,
            must_beat_production: false,
        }
    }
}

impl AcceptanceCriteria {
    /// `Err(reason)` when `metrics` fall short.
    pub fn check(&self, metrics: &ModelMetrics, production: Option<&ModelMetrics>) -> std::result::Result<(), String> {
        if metrics.accuracy < self.min_accuracy {
            return Err(format!(
                "accuracy {:.4} below acceptance minimum {:.4}",
                metrics.accuracy, self.min_accuracy
            ));
        }
        if metrics.loss > self.max_loss {
            return Err(format!(
                "loss {:.4} above acceptance maximum {:.4}",
                metrics.loss, self.max_loss
            ));
        }
        if self.must_beat_production {
            if let Some(prod) = production {
                if metrics.accuracy <= prod.accuracy {
                    return Err(format!(
                        "accuracy {:.4} does not beat production {:.4}",
                        metrics.accuracy, prod.accuracy
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Per-model retraining policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainPolicy {
    #[serde(default)]
    pub base_config: Value,
    pub schedule: RetrainSchedule,
    #[serde(default)]
    pub criteria: RetrainCriteria,
    #[serde(default)]
    pub acceptance: AcceptanceCriteria,
    #[serde(default)]
    pub tuning: Option<TuningConfig>,
}

impl RetrainPolicy {
    pub fn new(base_config: Value, frequency: Frequency) -> Self {
        Self {
            base_config,
            schedule: RetrainSchedule {
                frequency,
                enabled: true,
            },
            criteria: RetrainCriteria::default(),
            acceptance: AcceptanceCriteria::default(),
            tuning: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ModelOpsError::Validation(format!("{} must be within 0..=1, got {}", name, v)))
            }
        };
        unit("criteria.min_accuracy", self.criteria.min_accuracy)?;
        unit("acceptance.min_accuracy", self.acceptance.min_accuracy)?;
        if self.criteria.max_loss < 0.0 || self.acceptance.max_loss < 0.0 {
            return Err(ModelOpsError::Validation("loss limits must not be negative".into()));
        }
        if let Some(tuning) = &self.tuning {
            tuning.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::TimeRange;
    use chrono::Utc;

    fn perf(samples: usize, accuracy: f64, loss: f64) -> ModelPerformance {
        let now = Utc::now();
        ModelPerformance {
            sample_count: samples,
            accuracy,
            loss,
            ..ModelPerformance::empty("m", TimeRange::new(now, now))
        }
    }

    #[test]
    fn no_samples_means_only_drift_can_trigger() {
        let c = RetrainCriteria::default();
        assert!(c.reasons(&perf(0, 0.0, 0.0), 0.0).is_empty());
        assert_eq!(c.reasons(&perf(0, 0.0, 0.0), 0.9).len(), 1);
    }

    #[test]
    fn degraded_metrics_produce_reasons() {
        let c = RetrainCriteria::default();
        assert_eq!(c.reasons(&perf(50, 0.6, 0.9), 0.0).len(), 2);
        assert!(c.reasons(&perf(50, 0.95, 0.1), 0.1).is_empty());
    }

    #[test]
    fn acceptance_can_require_beating_production() {
        let a = AcceptanceCriteria {
            must_beat_production: true,
            ..Default::default()
        };
        let candidate = ModelMetrics::new(0.9, 0.1, 0.9);
        assert!(a.check(&candidate, None).is_ok());
        assert!(a.check(&candidate, Some(&ModelMetrics::new(0.95, 0.1, 0.9))).is_err());
        assert!(a.check(&ModelMetrics::new(0.5, 0.1, 0.5), None).is_err());
    }
}
