use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metrics::ModelPerformance;
use crate::notify::{Notification, Severity};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub min_accuracy: f64,
    pub max_loss: f64,
    pub max_drift: f64,
    /// Average latency ceiling. Unset disables the latency rule.
    pub max_latency_ms: Option<f64>,
    /// Ceiling on the share of failed requests.
    pub max_error_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            min_accuracy: 0.8,
            max_loss: 0.5,
            max_drift: 0.5,
            max_latency_ms: None,
            max_error_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub thresholds: AlertThresholds,
    /// Notification channels alerts are handed to.
    pub channels: Vec<String>,
    /// Minimum seconds between two alert bursts for the same model.
    pub cooldown_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            thresholds: AlertThresholds::default(),
            channels: vec!["ml-alerts".to_string()],
            cooldown_secs: 3600,
        }
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Accuracy,
    Loss,
    Drift,
    Latency,
    ErrorRate,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::Loss => "loss",
            Self::Drift => "drift",
            Self::Latency => "latency",
            Self::ErrorRate => "error_rate",
        }
    }

    /// Performance alerts signal degradation; drift is reported on its own topic.
    pub fn is_performance(self) -> bool {
        !matches!(self, Self::Drift)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub model_id: String,
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn notification(&self) -> Notification {
        let severity = if self.kind.is_performance() {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Notification::new(
            format!("{} alert for {}", self.kind.as_str(), self.model_id),
            self.message.clone(),
            severity,
        )
        .for_model(self.model_id.clone())
    }
}

/// Every threshold breached by `perf`, one alert per dimension.
pub fn breaches(perf: &ModelPerformance, thresholds: &AlertThresholds, now: DateTime<Utc>) -> Vec<Alert> {
    let mut out = Vec::new();
    let mut push = |kind: AlertKind, value: f64, threshold: f64, message: String| {
        out.push(Alert {
            id: Uuid::now_v7(),
            model_id: perf.model_id.clone(),
            kind,
            value,
            threshold,
            message,
            raised_at: now,
        });
    };

    if perf.accuracy < thresholds.min_accuracy {
        push(
            AlertKind::Accuracy,
            perf.accuracy,
            thresholds.min_accuracy,
            format!(
                "accuracy {:.4} below minimum {:.4} over {} samples",
                perf.accuracy, thresholds.min_accuracy, perf.sample_count
            ),
        );
    }
    if perf.loss > thresholds.max_loss {
        push(
            AlertKind::Loss,
            perf.loss,
            thresholds.max_loss,
            format!("loss {:.4} above maximum {:.4}", perf.loss, thresholds.max_loss),
        );
    }
    if perf.drift_score > thresholds.max_drift {
        push(
            AlertKind::Drift,
            perf.drift_score,
            thresholds.max_drift,
            format!(
                "drift score {:.4} above maximum {:.4}",
                perf.drift_score, thresholds.max_drift
            ),
        );
    }
    if perf.error_rate > thresholds.max_error_rate {
        push(
            AlertKind::ErrorRate,
            perf.error_rate,
            thresholds.max_error_rate,
            format!(
                "error rate {:.1}% above maximum {:.1}%",
                perf.error_rate * 100.0,
                thresholds.max_error_rate * 100.0
            ),
        );
    }
    if let Some(max_latency) = thresholds.max_latency_ms {
        if perf.latency_ms > max_latency {
            push(
                AlertKind::Latency,
                perf.latency_ms,
                max_latency,
                format!("average latency {:.1}ms above {:.1}ms", perf.latency_ms, max_latency),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::metrics::TimeRange;

    fn perf(accuracy: f64, loss: f64, drift: f64, latency: f64) -> ModelPerformance {
        let now = Utc::now();
        ModelPerformance {
            accuracy,
            loss,
            drift_score: drift,
            latency_ms: latency,
            sample_count: 20,
            ..ModelPerformance::empty("m", TimeRange::new(now, now))
        }
    }

    #[test]
    fn healthy_metrics_raise_nothing() {
        let t = AlertThresholds::default();
        assert!(breaches(&perf(0.95, 0.1, 0.1, 5000.0), &t, Utc::now()).is_empty());
    }

    #[test]
    fn one_alert_per_breached_dimension() {
        let t = AlertThresholds {
            max_latency_ms: Some(100.0),
            ..Default::default()
        };
        let alerts = breaches(&perf(0.5, 0.9, 0.9, 500.0), &t, Utc::now());
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![AlertKind::Accuracy, AlertKind::Loss, AlertKind::Drift, AlertKind::Latency]
        );
    }

    #[test]
    fn drift_is_not_a_performance_alert() {
        assert!(!AlertKind::Drift.is_performance());
        assert!(AlertKind::Loss.is_performance());
    }
}
