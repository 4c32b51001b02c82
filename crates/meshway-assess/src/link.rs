//! Drift-plus-penalty link weight evaluation.
//!
//! Combines the most recent one-way delay with the target node's CPU
//! mean/variance into one scalar edge cost. CPU terms are rank-scaled
//! against the fleet distribution and weighted by per-link virtual queues,
//! so links towards persistently loaded nodes accumulate cost over time
//! even when their instantaneous delay looks fine.

use meshway_state::{CpuPerformanceSplit, LinkQueueState, StateStore};
use tracing::debug;

use crate::error::AssessResult;

/// Evaluator tuning; the defaults match the production deployment.
#[derive(Debug, Clone, Copy)]
pub struct LinkEvaluatorParams {
    /// Fleet-split threshold for CPU mean (percent).
    pub threshold_cpu_mean: f64,
    /// Fleet-split threshold for CPU variance.
    pub threshold_cpu_var: f64,
    /// Multiplier on the delay (penalty) term.
    pub weight: f64,
}

impl Default for LinkEvaluatorParams {
    fn default() -> Self {
        Self {
            threshold_cpu_mean: 50.0,
            threshold_cpu_var: 50.0,
            weight: 1.0,
        }
    }
}

/// Evaluates directed links and persists per-link virtual-queue state.
pub struct LinkEvaluator {
    store: StateStore,
    params: LinkEvaluatorParams,
}

impl LinkEvaluator {
    pub fn new(store: StateStore, params: LinkEvaluatorParams) -> Self {
        Self { store, params }
    }

    pub fn params(&self) -> LinkEvaluatorParams {
        self.params
    }

    /// Evaluate one directed link against the current fleet CPU split.
    ///
    /// Returns `None` when no delay sample or no target CPU history exists;
    /// the caller omits the edge. Origin servers bypass the CPU terms
    /// entirely: the last mile is scheduled separately, only its delay
    /// matters here.
    pub fn evaluate(
        &self,
        source_ip: &str,
        target_ip: &str,
        fleet: &CpuPerformanceSplit,
        now: u64,
    ) -> AssessResult<Option<f64>> {
        let Some(delay) = self.store.latest_delay(source_ip, target_ip)? else {
            return Ok(None);
        };

        if self.store.is_origin_target(target_ip)? {
            return Ok(Some(self.params.weight * delay));
        }

        let Some(stats) = self.store.cpu_stats(target_ip)? else {
            debug!(target_ip, "no CPU history for link target, omitting edge");
            return Ok(None);
        };

        let norm_mean = rank_scale(
            stats.mean,
            self.params.threshold_cpu_mean,
            &fleet.above_means,
            &fleet.below_means,
        );
        let norm_var = rank_scale(
            stats.variance,
            self.params.threshold_cpu_var,
            &fleet.above_vars,
            &fleet.below_vars,
        );

        let (q_mean, q_var) = self.store.queue_backlogs(source_ip, target_ip)?;
        // The threshold sits at 0.5 in rank-scaled space, so a link whose
        // target stays below threshold drains its queue each evaluation.
        let next_q_mean = (q_mean + norm_mean - 0.5).max(0.0);
        let next_q_var = (q_var + norm_var - 0.5).max(0.0);

        let value = self.params.weight * delay
            + next_q_mean * norm_mean
            + next_q_var * norm_var;

        self.store.put_link_queue_state(&LinkQueueState {
            source_ip: source_ip.to_string(),
            target_ip: target_ip.to_string(),
            delay_ms: delay,
            cpu_mean: stats.mean,
            cpu_variance: stats.variance,
            queue_mean: next_q_mean,
            queue_variance: next_q_var,
            updated_at: now,
        })?;

        Ok(Some(value))
    }
}

/// Rank-scale a value against the fleet split.
///
/// Values in the below-threshold list map into (0, 0.5], values in the
/// above-threshold list into (0.5, 1.0), linearly by rank within their
/// (sorted) list. An empty list degrades to the midpoint of its band.
fn rank_scale(value: f64, threshold: f64, above: &[f64], below: &[f64]) -> f64 {
    if value > threshold {
        let rank = above.partition_point(|v| *v < value);
        if above.is_empty() {
            0.75
        } else {
            0.5 + 0.5 * (rank as f64 + 1.0) / (above.len() as f64 + 1.0)
        }
    } else {
        let rank = below.partition_point(|v| *v < value);
        if below.is_empty() {
            0.25
        } else {
            0.5 * (rank as f64 + 1.0) / (below.len() as f64 + 1.0)
        }
    }
}
