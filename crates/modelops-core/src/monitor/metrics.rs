//! Per-prediction samples and their aggregation over a time window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One observed prediction, as reported by the serving path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSample {
    pub input: Value,
    pub output: Value,
    #[serde(default)]
    pub ground_truth: Option<Value>,
    /// Wall-clock time of the inference call.
    pub latency_ms: f64,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    /// Set when the inference did not produce an output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionSample {
    pub fn new(input: Value, output: Value, latency_ms: f64) -> Self {
        Self {
            input,
            output,
            ground_truth: None,
            latency_ms,
            memory_bytes: None,
            error: None,
        }
    }

    /// A request that ended in an error.
    pub fn failed(input: Value, latency_ms: f64, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(input, Value::Null, latency_ms)
        }
    }

    pub fn with_ground_truth(mut self, truth: Value) -> Self {
        self.ground_truth = Some(truth);
        self
    }

    pub fn with_memory(mut self, bytes: Option<u64>) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Stored metrics of one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub recorded_at: DateTime<Utc>,
    pub accuracy: f64,
    pub loss: f64,
    pub latency_ms: f64,
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftPoint {
    pub recorded_at: DateTime<Utc>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }

    fn seconds(&self) -> f64 {
        (self.end - self.start).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// Averaged metrics of a model over a window. All zero when no samples exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub model_id: String,
    pub sample_count: usize,
    pub accuracy: f64,
    pub loss: f64,
    pub latency_ms: f64,
    pub p95_latency_ms: f64,
    /// Predictions per second over the window.
    pub throughput: f64,
    pub memory_bytes: f64,
    /// Share of requests in the window that failed.
    #[serde(default)]
    pub error_rate: f64,
    pub drift_score: f64,
    pub window: TimeRange,
}

impl ModelPerformance {
    pub fn empty(model_id: &str, window: TimeRange) -> Self {
        Self {
            model_id: model_id.to_string(),
            sample_count: 0,
            accuracy: 0.0,
            loss: 0.0,
            latency_ms: 0.0,
            p95_latency_ms: 0.0,
            throughput: 0.0,
            memory_bytes: 0.0,
            error_rate: 0.0,
            drift_score: 0.0,
            window,
        }
    }
}

/// Average every point that falls inside `window`. Accuracy and loss cover
/// only the requests that produced an output.
pub fn aggregate<'a>(
    model_id: &str,
    points: impl Iterator<Item = &'a MetricPoint>,
    drift_score: f64,
    window: TimeRange,
) -> ModelPerformance {
    let selected: Vec<&MetricPoint> = points.filter(|p| window.contains(p.recorded_at)).collect();
    if selected.is_empty() {
        return ModelPerformance::empty(model_id, window);
    }
    let n = selected.len() as f64;
    let answered: Vec<&&MetricPoint> = selected.iter().filter(|p| !p.failed).collect();
    let (accuracy, loss) = if answered.is_empty() {
        (0.0, 0.0)
    } else {
        let k = answered.len() as f64;
        (
            answered.iter().map(|p| p.accuracy).sum::<f64>() / k,
            answered.iter().map(|p| p.loss).sum::<f64>() / k,
        )
    };
    let mut latencies: Vec<f64> = selected.iter().map(|p| p.latency_ms).collect();
    latencies.sort_by(|a, b| a.total_cmp(b));
    let p95_idx = ((latencies.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);

    let memory: Vec<f64> = selected.iter().filter_map(|p| p.memory_bytes).map(|m| m as f64).collect();
    let memory_bytes = if memory.is_empty() {
        0.0
    } else {
        memory.iter().sum::<f64>() / memory.len() as f64
    };

    let secs = window.seconds();
    ModelPerformance {
        model_id: model_id.to_string(),
        sample_count: selected.len(),
        accuracy,
        loss,
        latency_ms: latencies.iter().sum::<f64>() / n,
        p95_latency_ms: latencies[p95_idx.min(latencies.len() - 1)],
        throughput: if secs > 0.0 { n / secs } else { 0.0 },
        memory_bytes,
        error_rate: (selected.len() - answered.len()) as f64 / n,
        drift_score,
        window,
    }
}

/// Accuracy and loss of a single prediction.
///
/// Without ground truth the prediction is assumed correct. Numeric outputs use
/// squared error for loss and a relative tolerance for accuracy; anything else
/// is compared for equality.
pub fn score_prediction(output: &Value, truth: Option<&Value>, tolerance: f64) -> (f64, f64) {
    let Some(truth) = truth else {
        return (1.0, 0.0);
    };
    let predicted = prediction_value(output);
    match (predicted.as_f64(), truth.as_f64()) {
        (Some(p), Some(t)) => {
            let err = p - t;
            let correct = err.abs() <= tolerance * t.abs().max(1.0);
            (if correct { 1.0 } else { 0.0 }, err * err)
        }
        _ => {
            if predicted == truth {
                (1.0, 0.0)
            } else {
                (0.0, 1.0)
            }
        }
    }
}

/// Backends may wrap the prediction as `{"prediction": ...}`.
fn prediction_value(output: &Value) -> &Value {
    match output {
        Value::Object(map) => map.get("prediction").unwrap_or(output),
        _ => output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn no_ground_truth_is_assumed_correct() {
        assert_eq!(score_prediction(&json!("churn"), None, 0.05), (1.0, 0.0));
    }

    #[test]
    fn categorical_mismatch_is_wrong() {
        assert_eq!(score_prediction(&json!("a"), Some(&json!("b")), 0.05), (0.0, 1.0));
        assert_eq!(
            score_prediction(&json!({"prediction": "a", "p": 0.7}), Some(&json!("a")), 0.05),
            (1.0, 0.0)
        );
    }

    #[test]
    fn numeric_prediction_uses_tolerance_and_squared_error() {
        let (acc, loss) = score_prediction(&json!(102.0), Some(&json!(100.0)), 0.05);
        assert_eq!(acc, 1.0);
        assert!((loss - 4.0).abs() < 1e-9);
        let (acc, _) = score_prediction(&json!(120.0), Some(&json!(100.0)), 0.05);
        assert_eq!(acc, 0.0);
    }

    #[test]
    fn aggregate_of_nothing_is_zeroed() {
        let now = Utc::now();
        let perf = aggregate("m", std::iter::empty(), 0.0, TimeRange::new(now - Duration::hours(1), now));
        assert_eq!(perf.sample_count, 0);
        assert_eq!(perf.accuracy, 0.0);
        assert_eq!(perf.throughput, 0.0);
    }

    #[test]
    fn aggregate_filters_by_window() {
        let now = Utc::now();
        let points: Vec<MetricPoint> = (0..10)
            .map(|i| MetricPoint {
                recorded_at: now - Duration::minutes(i * 10),
                accuracy: if i < 5 { 1.0 } else { 0.0 },
                loss: 0.0,
                latency_ms: (i + 1) as f64 * 10.0,
                memory_bytes: None,
                failed: false,
            })
            .collect();
        let window = TimeRange::new(now - Duration::minutes(45), now);
        let perf = aggregate("m", points.iter(), 0.2, window);
        assert_eq!(perf.sample_count, 5);
        assert_eq!(perf.accuracy, 1.0);
        assert_eq!(perf.latency_ms, 30.0);
        assert_eq!(perf.p95_latency_ms, 50.0);
        assert_eq!(perf.drift_score, 0.2);
    }

    #[test]
    fn failed_points_count_toward_error_rate_only() {
        let now = Utc::now();
        let point = |accuracy: f64, failed: bool| MetricPoint {
            recorded_at: now,
            accuracy,
            loss: 0.0,
            latency_ms: 10.0,
            memory_bytes: Some(2048),
            failed,
        };
        let points = [point(1.0, false), point(1.0, false), point(0.0, true), point(0.0, true)];
        let perf = aggregate("m", points.iter(), 0.0, TimeRange::new(now - Duration::minutes(1), now));
        assert_eq!(perf.sample_count, 4);
        assert_eq!(perf.error_rate, 0.5);
        assert_eq!(perf.accuracy, 1.0);
        assert_eq!(perf.memory_bytes, 2048.0);
    }
}
