//! Weighted round-robin path selection.
//!
//! Selects among candidate paths with frequencies proportional to their
//! inverse-latency weights. An atomic counter walks a cumulative-weight
//! table, so concurrent callers never skew the distribution.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::manager::PathWithIp;

/// Lock-free weighted round-robin over a fixed path snapshot.
pub struct WeightedRoundRobin {
    paths: Arc<Vec<PathWithIp>>,
    cumulative: Vec<i64>,
    total_weight: i64,
    current: AtomicU32,
}

impl WeightedRoundRobin {
    pub fn new(paths: Arc<Vec<PathWithIp>>) -> Self {
        let mut cumulative = Vec::with_capacity(paths.len());
        let mut total = 0;
        for p in paths.iter() {
            total += p.weight.max(0);
            cumulative.push(total);
        }
        Self {
            paths,
            cumulative,
            total_weight: total,
            current: AtomicU32::new(0),
        }
    }

    /// Next path by cumulative weight; `None` when the snapshot is empty or
    /// carries no positive weight.
    pub fn next(&self) -> Option<&PathWithIp> {
        if self.total_weight == 0 || self.paths.is_empty() {
            return None;
        }
        let n = self.current.fetch_add(1, Ordering::Relaxed);
        let slot = (n as i64) % self.total_weight;
        let idx = self.cumulative.partition_point(|&c| c <= slot);
        self.paths.get(idx)
    }
}
