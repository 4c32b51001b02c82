//! Path manager — atomic publication of computed path sets.
//!
//! One instance per process. Each recomputation replaces the published
//! slice for a destination wholesale; readers clone an `Arc` snapshot and
//! never observe a half-updated set.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::error::{RoutingError, RoutingResult};
use crate::flow::k_shortest_augmented;
use crate::ksp::Flow;
use crate::topology::TopologyGraph;

/// Selection weight used when a path reports zero latency.
const ZERO_LATENCY_WEIGHT: i64 = 100;

/// Path-computation tuning, parameterized at construction.
#[derive(Debug, Clone, Copy)]
pub struct RouteParams {
    /// Number of paths to resolve per destination.
    pub k: usize,
    /// Maximum interior hops per path.
    pub hop_threshold: usize,
    /// Maximum interior vertices two paths may share.
    pub theta: usize,
    /// Bound on min-cut augmentation rounds.
    pub max_iterations: usize,
}

impl Default for RouteParams {
    fn default() -> Self {
        Self {
            k: 4,
            hop_threshold: 3,
            theta: 1,
            max_iterations: 3,
        }
    }
}

/// A resolved path with its node IPs, total latency, and selection weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathWithIp {
    /// Full node sequence, source first, destination last.
    pub ips: Vec<String>,
    pub latency: i64,
    /// Inverse-latency share used by the weighted round-robin.
    pub weight: i64,
}

/// Holds the current path set per destination IP.
pub struct PathManager {
    params: RouteParams,
    sets: RwLock<HashMap<String, Arc<Vec<PathWithIp>>>>,
}

impl PathManager {
    pub fn new(params: RouteParams) -> Self {
        Self {
            params,
            sets: RwLock::new(HashMap::new()),
        }
    }

    /// Compute and publish paths from `source_ip` to `destination_ip` over
    /// the given topology.
    ///
    /// An empty result (unknown endpoints, no route) publishes an empty
    /// set — callers answer service-unavailable rather than using stale
    /// routes to a vanished destination.
    pub fn calculate_paths(
        &self,
        topology: &TopologyGraph,
        source_ip: &str,
        destination_ip: &str,
    ) -> RoutingResult<usize> {
        if topology.is_empty() {
            return Err(RoutingError::EmptyTopology);
        }
        let source = topology
            .index_of(source_ip)
            .ok_or_else(|| RoutingError::UnknownNode(source_ip.to_string()))?;
        let destination = topology
            .index_of(destination_ip)
            .ok_or_else(|| RoutingError::UnknownNode(destination_ip.to_string()))?;

        let paths = k_shortest_augmented(
            topology.links(),
            Flow {
                source,
                destination,
            },
            self.params.k,
            self.params.hop_threshold,
            self.params.theta,
            self.params.max_iterations,
        );

        let total_latency: i64 = paths.iter().map(|p| p.latency).sum();
        let with_ips: Vec<PathWithIp> = paths
            .iter()
            .map(|p| {
                let ips = p
                    .nodes
                    .iter()
                    .map(|&n| {
                        topology
                            .ip_at(n)
                            .expect("path nodes come from this topology")
                            .to_string()
                    })
                    .collect();
                let weight = if p.latency == 0 {
                    ZERO_LATENCY_WEIGHT
                } else {
                    total_latency / p.latency
                };
                PathWithIp {
                    ips,
                    latency: p.latency,
                    weight,
                }
            })
            .collect();

        let count = with_ips.len();
        for (i, p) in with_ips.iter().enumerate() {
            debug!(
                path = i + 1,
                nodes = ?p.ips,
                latency = p.latency,
                weight = p.weight,
                "path resolved"
            );
        }

        self.sets
            .write()
            .expect("path set lock poisoned")
            .insert(destination_ip.to_string(), Arc::new(with_ips));
        info!(destination = destination_ip, paths = count, "path set published");
        Ok(count)
    }

    /// Snapshot of the current path set for a destination.
    pub fn paths_for(&self, destination_ip: &str) -> Arc<Vec<PathWithIp>> {
        self.sets
            .read()
            .expect("path set lock poisoned")
            .get(destination_ip)
            .cloned()
            .unwrap_or_default()
    }

    /// Destinations with a published (possibly empty) path set.
    pub fn destinations(&self) -> Vec<String> {
        self.sets
            .read()
            .expect("path set lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Whether any destination has at least one usable path.
    pub fn has_paths(&self) -> bool {
        self.sets
            .read()
            .expect("path set lock poisoned")
            .values()
            .any(|v| !v.is_empty())
    }
}
