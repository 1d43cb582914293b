//! Instance selection strategies.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::instance::ModelInstance;
use crate::types::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
}

impl LoadBalancing {
    pub fn selector(self) -> Box<dyn InstanceSelector> {
        match self {
            Self::RoundRobin => Box::new(RoundRobinSelector::new()),
            Self::LeastConnections => Box::new(LeastConnectionsSelector),
            Self::Weighted => Box::new(WeightedSelector),
        }
    }
}

/// Picks one of the healthy candidates of a version pool.
pub trait InstanceSelector: Send + Sync {
    /// Index into `candidates`, or `None` when it is empty.
    fn select(&self, pool: Version, candidates: &[&ModelInstance]) -> Option<usize>;
}

/// Cycles through each pool with its own cursor.
pub struct RoundRobinSelector {
    cursors: DashMap<Version, AtomicUsize>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceSelector for RoundRobinSelector {
    fn select(&self, pool: Version, candidates: &[&ModelInstance]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let cursor = self.cursors.entry(pool).or_insert_with(|| AtomicUsize::new(0));
        Some(cursor.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }
}

/// Fewest active connections; ties go to the earlier instance.
pub struct LeastConnectionsSelector;

impl InstanceSelector for LeastConnectionsSelector {
    fn select(&self, _pool: Version, candidates: &[&ModelInstance]) -> Option<usize> {
        let connections: Vec<u32> = candidates.iter().map(|i| i.active_connections).collect();
        least_connections(&connections)
    }
}

pub struct WeightedSelector;

impl InstanceSelector for WeightedSelector {
    fn select(&self, _pool: Version, candidates: &[&ModelInstance]) -> Option<usize> {
        let weights: Vec<u32> = candidates.iter().map(|i| i.weight).collect();
        pick_weighted(&weights, rand::thread_rng().gen::<f64>())
    }
}

pub fn least_connections(connections: &[u32]) -> Option<usize> {
    connections
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| a.cmp(b).then(ia.cmp(ib)))
        .map(|(i, _)| i)
}

/// Index whose cumulative-weight interval contains `draw * total`.
///
/// `draw` is a uniform value in `[0, 1)`. All-zero weights fall back to
/// equal weighting.
pub fn pick_weighted(weights: &[u32], draw: f64) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let total: u64 = weights.iter().map(|w| *w as u64).sum();
    if total == 0 {
        let idx = (draw.clamp(0.0, 1.0) * weights.len() as f64) as usize;
        return Some(idx.min(weights.len() - 1));
    }
    let point = draw.clamp(0.0, 1.0) * total as f64;
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += *w as f64;
        if point < cumulative {
            return Some(i);
        }
    }
    // draw == 1.0 lands on the last non-zero weight
    weights.iter().rposition(|w| *w > 0)
}
