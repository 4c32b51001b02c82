//! Assessment engine — per-region-pair link assessments.
//!
//! For every ordered region pair the engine evaluates all inter-region IP
//! pairs with the link evaluator, drops non-positive weights, and compresses
//! the result: outlier pairs keep their own weight, everything else collapses
//! into a single `default`/`default` pseudo-pair carrying the mean. The most
//! recent result is cached; sync responses receive a snapshot copy.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use meshway_state::StateStore;

use crate::error::AssessResult;
use crate::link::{LinkEvaluator, LinkEvaluatorParams};
use crate::stats::detect_outliers;

/// Neighborhood size for outlier suppression.
const OUTLIER_WINDOW: usize = 3;
/// Sensitivity for outlier suppression.
const OUTLIER_SENSITIVITY: f64 = 1.5;
/// Compression needs at least this many pairs to be worthwhile.
const MIN_PAIRS_FOR_COMPRESSION: usize = 5;
/// Delay before the very first computation after startup.
const INITIAL_DELAY: Duration = Duration::from_secs(30);

/// Assessed weight for one directed IP pair.
///
/// The `default`/`default` pseudo-pair carries the region-pair mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpPairAssessment {
    pub ip1: String,
    pub ip2: String,
    pub assessment: f64,
}

/// All assessed IP pairs for one ordered region pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionPairAssessment {
    pub region1: String,
    pub region2: String,
    pub ip_pairs: Vec<IpPairAssessment>,
}

/// Periodically recomputes region-pair assessments and caches the result.
pub struct AssessmentEngine {
    store: StateStore,
    params: LinkEvaluatorParams,
    interval: Duration,
    last_calc: Mutex<Option<tokio::time::Instant>>,
    cache: RwLock<Vec<RegionPairAssessment>>,
}

impl AssessmentEngine {
    pub fn new(store: StateStore, params: LinkEvaluatorParams, interval: Duration) -> Self {
        Self {
            store,
            params,
            interval,
            last_calc: Mutex::new(None),
            cache: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot copy of the most recent assessments.
    pub async fn cached_assessments(&self) -> Vec<RegionPairAssessment> {
        self.cache.read().await.clone()
    }

    /// Recompute if the configured interval has elapsed. Returns whether a
    /// computation ran.
    pub async fn recompute_if_due(self: &Arc<Self>) -> bool {
        let mut last = self.last_calc.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.interval {
                return false;
            }
        }
        *last = Some(tokio::time::Instant::now());
        drop(last);

        let started = tokio::time::Instant::now();
        match self.compute_region_assessments().await {
            Ok(assessments) => {
                let count = assessments.len();
                *self.cache.write().await = assessments;
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    region_pairs = count,
                    "assessments recomputed"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "assessment computation failed");
                false
            }
        }
    }

    /// Run the engine: one computation after the initial delay, then checks
    /// at a quarter of the interval so a due recomputation never waits a
    /// full period.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(INITIAL_DELAY) => {
                self.recompute_if_due().await;
            }
            _ = shutdown.changed() => return,
        }

        let mut ticker = tokio::time::interval(self.interval / 4);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.recompute_if_due().await;
                }
                _ = shutdown.changed() => {
                    info!("assessment engine shutting down");
                    return;
                }
            }
        }
    }

    /// Evaluate every ordered region pair, fanned out across the hardware
    /// parallelism.
    async fn compute_region_assessments(
        self: &Arc<Self>,
    ) -> AssessResult<Vec<RegionPairAssessment>> {
        let regions = self.store.regions()?;
        let fleet = Arc::new(self.store.cpu_performance_split(
            self.params.threshold_cpu_mean,
            self.params.threshold_cpu_var,
        )?);
        let now = epoch_secs();

        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let permits = Arc::new(Semaphore::new(parallelism));

        let mut set: JoinSet<AssessResult<Option<RegionPairAssessment>>> = JoinSet::new();
        for region1 in &regions {
            for region2 in &regions {
                if region1 == region2 {
                    continue;
                }
                let engine = Arc::clone(self);
                let fleet = Arc::clone(&fleet);
                let permits = Arc::clone(&permits);
                let (r1, r2) = (region1.clone(), region2.clone());
                set.spawn(async move {
                    let _permit = permits.acquire_owned().await.expect("semaphore closed");
                    tokio::task::spawn_blocking(move || engine.assess_region_pair(&r1, &r2, &fleet, now))
                        .await
                        .expect("assessment task panicked")
                });
            }
        }

        let mut assessments = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined.expect("assessment task panicked") {
                Ok(Some(a)) => assessments.push(a),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "region pair assessment failed"),
            }
        }
        // Deterministic output order regardless of task completion order.
        assessments.sort_by(|a, b| (&a.region1, &a.region2).cmp(&(&b.region1, &b.region2)));
        Ok(assessments)
    }

    /// Evaluate one ordered region pair; `None` when no pair produced a
    /// usable weight.
    fn assess_region_pair(
        &self,
        region1: &str,
        region2: &str,
        fleet: &meshway_state::CpuPerformanceSplit,
        now: u64,
    ) -> AssessResult<Option<RegionPairAssessment>> {
        let source_ips = self.store.region_ips(region1)?;
        let target_ips = self.store.region_ips(region2)?;
        let evaluator = LinkEvaluator::new(self.store.clone(), self.params);

        let mut pairs = Vec::new();
        for src in &source_ips {
            for dst in &target_ips {
                match evaluator.evaluate(src, dst, fleet, now)? {
                    Some(value) if value > 0.0 => pairs.push(IpPairAssessment {
                        ip1: src.clone(),
                        ip2: dst.clone(),
                        assessment: value,
                    }),
                    _ => {}
                }
            }
        }

        if pairs.is_empty() {
            return Ok(None);
        }

        let compressed = compress_pairs(pairs);
        debug!(
            region1,
            region2,
            entries = compressed.len(),
            "region pair assessed"
        );
        Ok(Some(RegionPairAssessment {
            region1: region1.to_string(),
            region2: region2.to_string(),
            ip_pairs: compressed,
        }))
    }
}

/// Compress a dense pair list into outlier overrides plus one default entry.
///
/// Lists shorter than five pairs, or lists without outliers, pass through
/// unchanged.
fn compress_pairs(pairs: Vec<IpPairAssessment>) -> Vec<IpPairAssessment> {
    if pairs.len() < MIN_PAIRS_FOR_COMPRESSION {
        return pairs;
    }

    let values: Vec<f64> = pairs.iter().map(|p| p.assessment).collect();
    let outliers = detect_outliers(&values, OUTLIER_WINDOW, OUTLIER_SENSITIVITY);
    if outliers.is_empty() {
        return pairs;
    }

    let outlier_indices: Vec<usize> = outliers.iter().map(|o| o.index).collect();
    let normal: Vec<f64> = values
        .iter()
        .enumerate()
        .filter(|(i, _)| !outlier_indices.contains(i))
        .map(|(_, v)| *v)
        .collect();
    if normal.is_empty() {
        return pairs;
    }
    let mean = normal.iter().sum::<f64>() / normal.len() as f64;

    let mut result: Vec<IpPairAssessment> = pairs
        .into_iter()
        .enumerate()
        .filter(|(i, _)| outlier_indices.contains(i))
        .map(|(_, p)| p)
        .collect();
    result.push(IpPairAssessment {
        ip1: "default".to_string(),
        ip2: "default".to_string(),
        assessment: mean,
    });
    result
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
