//! Input drift against a reference distribution.
//!
//! Each numeric feature of the reference is summarised by mean and standard
//! deviation. The drift score of a window is the mean absolute shift of the
//! window's feature means, in reference standard deviations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type FeatureVector = BTreeMap<String, f64>;

/// Floor for standard deviations to keep the score finite.
const MIN_STD: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDistribution {
    pub features: BTreeMap<String, FeatureStats>,
    pub sample_count: usize,
    pub captured_at: DateTime<Utc>,
}

impl ReferenceDistribution {
    /// Build a reference from observed feature vectors.
    pub fn from_samples(samples: &[FeatureVector]) -> Self {
        let mut columns: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for sample in samples {
            for (name, value) in sample {
                columns.entry(name.as_str()).or_default().push(*value);
            }
        }
        let features = columns
            .into_iter()
            .map(|(name, values)| (name.to_string(), feature_stats(&values)))
            .collect();
        Self {
            features,
            sample_count: samples.len(),
            captured_at: Utc::now(),
        }
    }

    /// Drift score of `window` against this reference. Zero when nothing overlaps.
    pub fn score<'a>(&self, window: impl IntoIterator<Item = &'a FeatureVector>) -> f64 {
        let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for sample in window {
            for (name, value) in sample {
                if self.features.contains_key(name) {
                    let e = sums.entry(name.as_str()).or_insert((0.0, 0));
                    e.0 += value;
                    e.1 += 1;
                }
            }
        }
        if sums.is_empty() {
            return 0.0;
        }
        let shifts: Vec<f64> = sums
            .iter()
            .filter_map(|(name, (sum, n))| {
                let stats = self.features.get(*name)?;
                let mean = sum / *n as f64;
                Some((mean - stats.mean).abs() / stats.std.max(MIN_STD))
            })
            .collect();
        shifts.iter().sum::<f64>() / shifts.len() as f64
    }
}

fn feature_stats(values: &[f64]) -> FeatureStats {
    if values.is_empty() {
        return FeatureStats { mean: 0.0, std: MIN_STD };
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    FeatureStats {
        mean,
        std: var.sqrt().max(MIN_STD),
    }
}

/// Numeric features of an inference input.
///
/// A bare number is feature `value`; objects contribute their numeric (and
/// boolean) fields by name; arrays contribute numeric elements by index.
/// Anything else has no features.
pub fn extract_features(input: &Value) -> FeatureVector {
    let mut out = FeatureVector::new();
    match input {
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                out.insert("value".to_string(), v);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                if let Some(x) = numeric(v) {
                    out.insert(k.clone(), x);
                }
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                if let Some(x) = numeric(v) {
                    out.insert(i.to_string(), x);
                }
            }
        }
        _ => {}
    }
    out
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|x| x.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vector(pairs: &[(&str, f64)]) -> FeatureVector {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn extracts_object_array_and_scalar_features() {
        let f = extract_features(&json!({"age": 31, "premium": true, "name": "x"}));
        assert_eq!(f.get("age"), Some(&31.0));
        assert_eq!(f.get("premium"), Some(&1.0));
        assert!(!f.contains_key("name"));

        let f = extract_features(&json!([1.5, "a", 2]));
        assert_eq!(f.len(), 2);
        assert_eq!(f.get("2"), Some(&2.0));

        assert_eq!(extract_features(&json!(4)).get("value"), Some(&4.0));
        assert!(extract_features(&json!("text")).is_empty());
    }

    #[test]
    fn identical_distribution_has_no_drift() {
        let samples: Vec<FeatureVector> = (0..50).map(|i| vector(&[("x", (i % 10) as f64)])).collect();
        let reference = ReferenceDistribution::from_samples(&samples);
        assert!(reference.score(&samples) < 1e-9);
    }

    #[test]
    fn shifted_window_scores_in_standard_deviations() {
        let samples: Vec<FeatureVector> = (0..100)
            .map(|i| vector(&[("x", if i % 2 == 0 { 0.0 } else { 2.0 })]))
            .collect();
        let reference = ReferenceDistribution::from_samples(&samples);
        // mean 1, std 1
        let window: Vec<FeatureVector> = (0..10).map(|_| vector(&[("x", 3.0)])).collect();
        assert!((reference.score(&window) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_features_are_ignored() {
        let reference = ReferenceDistribution::from_samples(&[vector(&[("x", 1.0)])]);
        let window = vec![vector(&[("y", 100.0)])];
        assert_eq!(reference.score(&window), 0.0);
    }
}
