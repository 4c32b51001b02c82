//! Domain types for the meshway state store.
//!
//! These types represent the persisted control-plane state: node metrics,
//! probe results, link virtual queues, region membership, origin mappings,
//! and last-mile scheduler configuration. All types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Region name used when a node has no configured region.
pub const UNKNOWN_REGION: &str = "unknown";

// ── Node metrics ──────────────────────────────────────────────────

/// One system-metrics sample reported by a data-plane node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeMetrics {
    pub ip: String,
    /// CPU utilization percentage (0–100) at collection time.
    pub cpu_usage: f64,
    /// Physical core count of the node.
    pub cpu_cores: u32,
    /// Memory utilization percentage (0–100).
    pub memory_usage: f64,
    /// Unix timestamp (seconds) of collection.
    pub collected_at: u64,
}

/// Mean/variance summary of a node's recent CPU samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuStats {
    pub mean: f64,
    pub variance: f64,
}

/// Fleet-wide CPU statistics split at the evaluator thresholds.
///
/// Each list is sorted ascending; the link evaluator rank-scales a node's
/// mean/variance against the list it falls into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuPerformanceSplit {
    pub above_means: Vec<f64>,
    pub below_means: Vec<f64>,
    pub above_vars: Vec<f64>,
    pub below_vars: Vec<f64>,
}

/// Latest per-node snapshot used by the last-mile scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot {
    pub ip: String,
    pub cpu_usage: f64,
    pub cpu_cores: u32,
}

// ── Probe history ─────────────────────────────────────────────────

/// One TCP-probe measurement between two nodes.
///
/// `delay_ms < 0` marks a failed probe; valid measurements are `>= 0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeRecord {
    pub source_ip: String,
    pub source_region: String,
    pub target_ip: String,
    pub target_region: String,
    pub delay_ms: i64,
    /// Unix timestamp (seconds) of the probe.
    pub probed_at: u64,
}

// ── Link virtual-queue state ──────────────────────────────────────

/// Persisted drift-plus-penalty state for one directed link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkQueueState {
    pub source_ip: String,
    pub target_ip: String,
    /// Delay used in the most recent evaluation (ms).
    pub delay_ms: f64,
    /// Target-node CPU mean at the most recent evaluation.
    pub cpu_mean: f64,
    /// Target-node CPU variance at the most recent evaluation.
    pub cpu_variance: f64,
    /// Virtual-queue backlog for the CPU-mean constraint.
    pub queue_mean: f64,
    /// Virtual-queue backlog for the CPU-variance constraint.
    pub queue_variance: f64,
    pub updated_at: u64,
}

// ── Configuration tables ──────────────────────────────────────────

/// Static node→region assignment from the startup configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRegionEntry {
    pub ip: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Domain → last-mile origin server mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainOrigin {
    pub domain: String,
    pub origin_ip: String,
}

/// Per-domain last-mile scheduler parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainBprConfig {
    pub domain: String,
    /// Total request-rate increment Δ distributed per scheduling run.
    pub total_req_increment: i64,
    /// Redistribution proportion ρ in [0, 1].
    pub redistribution_proportion: f64,
}

/// Persistent per-node virtual-queue backlog for the last-mile scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacklogEntry {
    pub ip: String,
    pub backlog: f64,
    pub updated_at: u64,
}

impl NodeMetrics {
    /// Build the composite key for the node-metrics history table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.ip, self.collected_at)
    }
}

impl ProbeRecord {
    /// Build the composite key for the probe-results history table.
    pub fn table_key(&self) -> String {
        format!("{}|{}:{:020}", self.source_ip, self.target_ip, self.probed_at)
    }
}

impl LinkQueueState {
    /// Build the composite key for the link-queue table.
    pub fn table_key(&self) -> String {
        format!("{}|{}", self.source_ip, self.target_ip)
    }
}
