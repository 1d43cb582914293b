//! Hyperparameter search over declared parameter ranges.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{ModelOpsError, Result};
use crate::types::ModelMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    Grid,
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamRange {
    /// One of a fixed set of values.
    Choice { values: Vec<Value> },
    /// Continuous range. Grid search takes `steps` evenly spaced points.
    Uniform { min: f64, max: f64, steps: usize },
    /// Inclusive integer range.
    Int { min: i64, max: i64 },
}

impl ParamRange {
    fn validate(&self, name: &str) -> Result<()> {
        let bad = |why: &str| -> Result<()> {
            Err(ModelOpsError::Validation(format!("parameter '{}': {}", name, why)))
        };
        match self {
            Self::Choice { values } if values.is_empty() => bad("no values to choose from"),
            Self::Uniform { min, max, .. } if !(min.is_finite() && max.is_finite() && min <= max) => {
                bad("min must be finite and not above max")
            }
            Self::Int { min, max } if min > max => bad("min is above max"),
            _ => Ok(()),
        }
    }

    fn grid_points(&self) -> Vec<Value> {
        match self {
            Self::Choice { values } => values.clone(),
            Self::Uniform { min, max, steps } => {
                let steps = (*steps).max(1);
                if steps == 1 || min == max {
                    return vec![Value::from(*min)];
                }
                (0..steps)
                    .map(|i| Value::from(min + (max - min) * i as f64 / (steps - 1) as f64))
                    .collect()
            }
            Self::Int { min, max } => (*min..=*max).map(Value::from).collect(),
        }
    }

    fn sample(&self, rng: &mut impl Rng) -> Value {
        match self {
            Self::Choice { values } => values[rng.gen_range(0..values.len())].clone(),
            Self::Uniform { min, max, .. } => {
                if min == max {
                    Value::from(*min)
                } else {
                    Value::from(rng.gen_range(*min..*max))
                }
            }
            Self::Int { min, max } => Value::from(rng.gen_range(*min..=*max)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    MaximizeAccuracy,
    MinimizeLoss,
    MaximizeF1,
}

impl Objective {
    /// True when `a` is strictly better than `b`.
    pub fn better(self, a: &ModelMetrics, b: &ModelMetrics) -> bool {
        match self {
            Self::MaximizeAccuracy => a.accuracy > b.accuracy,
            Self::MinimizeLoss => a.loss < b.loss,
            Self::MaximizeF1 => a.f1 > b.f1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    pub search: SearchStrategy,
    pub params: BTreeMap<String, ParamRange>,
    pub max_trials: usize,
    pub objective: Objective,
    /// Fixed seed for reproducible random search.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl TuningConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_trials == 0 {
            return Err(ModelOpsError::Validation("max_trials must be at least 1".into()));
        }
        if self.params.is_empty() {
            return Err(ModelOpsError::Validation("tuning declares no parameters".into()));
        }
        for (name, range) in &self.params {
            range.validate(name)?;
        }
        Ok(())
    }

    /// Parameter assignments to try, at most `max_trials` of them.
    pub fn candidates(&self) -> Vec<Map<String, Value>> {
        match self.search {
            SearchStrategy::Grid => {
                let mut combos: Vec<Map<String, Value>> = vec![Map::new()];
                for (name, range) in &self.params {
                    let points = range.grid_points();
                    combos = combos
                        .into_iter()
                        .flat_map(|combo| {
                            points.iter().map(move |p| {
                                let mut next = combo.clone();
                                next.insert(name.clone(), p.clone());
                                next
                            })
                        })
                        .take(self.max_trials)
                        .collect();
                }
                combos
            }
            SearchStrategy::Random => {
                let mut rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                (0..self.max_trials)
                    .map(|_| {
                        self.params
                            .iter()
                            .map(|(name, range)| (name.clone(), range.sample(&mut rng)))
                            .collect()
                    })
                    .collect()
            }
        }
    }
}

/// Overlay `params` on a base training configuration.
pub fn apply_params(base: &Value, params: &Map<String, Value>) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut m = Map::new();
            m.insert("base".to_string(), other.clone());
            m
        }
    };
    for (k, v) in params {
        merged.insert(k.clone(), v.clone());
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tuning(search: SearchStrategy, max_trials: usize) -> TuningConfig {
        let mut params = BTreeMap::new();
        params.insert(
            "lr".to_string(),
            ParamRange::Uniform {
                min: 0.001,
                max: 0.1,
                steps: 3,
            },
        );
        params.insert("depth".to_string(), ParamRange::Int { min: 2, max: 4 });
        TuningConfig {
            search,
            params,
            max_trials,
            objective: Objective::MaximizeAccuracy,
            seed: Some(7),
        }
    }

    #[test]
    fn grid_is_cartesian_product_capped_by_trials() {
        assert_eq!(tuning(SearchStrategy::Grid, 100).candidates().len(), 9);
        assert_eq!(tuning(SearchStrategy::Grid, 4).candidates().len(), 4);
    }

    #[test]
    fn random_search_is_reproducible_with_seed_and_in_range() {
        let t = tuning(SearchStrategy::Random, 20);
        let a = t.candidates();
        assert_eq!(a, t.candidates());
        for c in &a {
            let lr = c["lr"].as_f64().unwrap();
            assert!((0.001..0.1).contains(&lr));
            let depth = c["depth"].as_i64().unwrap();
            assert!((2..=4).contains(&depth));
        }
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let mut t = tuning(SearchStrategy::Grid, 5);
        t.params.insert("bad".into(), ParamRange::Int { min: 5, max: 1 });
        assert!(t.validate().is_err());
        assert!(tuning(SearchStrategy::Grid, 0).validate().is_err());
    }

    #[test]
    fn params_overlay_base_config() {
        let mut p = Map::new();
        p.insert("lr".into(), json!(0.5));
        let merged = apply_params(&json!({"lr": 0.1, "epochs": 10}), &p);
        assert_eq!(merged, json!({"lr": 0.5, "epochs": 10}));
    }
}
