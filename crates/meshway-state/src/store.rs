//! StateStore — redb-backed persistence for the meshway control plane.
//!
//! Provides typed operations over node-metrics history, probe history,
//! link virtual queues, region membership, origin mappings, scheduler
//! configuration, and scheduler backlogs. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// How many recent CPU samples feed the mean/variance summaries.
const CPU_SAMPLE_WINDOW: usize = 10;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODE_METRICS).map_err(map_err!(Table))?;
        txn.open_table(PROBE_RESULTS).map_err(map_err!(Table))?;
        txn.open_table(LINK_QUEUES).map_err(map_err!(Table))?;
        txn.open_table(NODE_REGIONS).map_err(map_err!(Table))?;
        txn.open_table(DOMAIN_ORIGINS).map_err(map_err!(Table))?;
        txn.open_table(DOMAIN_CONFIGS).map_err(map_err!(Table))?;
        txn.open_table(BPR_BACKLOGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic upsert of a JSON value under a string key.
    fn put_json<T: serde::Serialize>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic point read of a JSON value.
    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Collect every value under a key prefix, in key order.
    fn scan_prefix<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let v: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(v);
            }
        }
        Ok(results)
    }

    // ── Node metrics ───────────────────────────────────────────────

    /// Append a node-metrics sample to the history table.
    pub fn put_node_metrics(&self, metrics: &NodeMetrics) -> StateResult<()> {
        self.put_json(NODE_METRICS, &metrics.table_key(), metrics)
    }

    /// All metrics samples for an IP, oldest first.
    pub fn node_metrics_history(&self, ip: &str) -> StateResult<Vec<NodeMetrics>> {
        self.scan_prefix(NODE_METRICS, &format!("{ip}:"))
    }

    /// Latest metrics sample for an IP.
    pub fn latest_node_metrics(&self, ip: &str) -> StateResult<Option<NodeMetrics>> {
        Ok(self.node_metrics_history(ip)?.pop())
    }

    /// Mean/variance of the most recent CPU samples for an IP.
    ///
    /// Returns `None` when no samples exist.
    pub fn cpu_stats(&self, ip: &str) -> StateResult<Option<CpuStats>> {
        let history = self.node_metrics_history(ip)?;
        if history.is_empty() {
            return Ok(None);
        }
        let recent: Vec<f64> = history
            .iter()
            .rev()
            .take(CPU_SAMPLE_WINDOW)
            .map(|m| m.cpu_usage)
            .collect();
        Ok(Some(summarize(&recent)))
    }

    /// Fleet-wide CPU mean/variance lists split at the given thresholds.
    ///
    /// For every known IP the most recent `CPU_SAMPLE_WINDOW` samples are
    /// summarized; the summaries land in the above/below list their value
    /// falls into. All four lists come back sorted ascending, ready for
    /// rank-scaling.
    pub fn cpu_performance_split(
        &self,
        threshold_mean: f64,
        threshold_var: f64,
    ) -> StateResult<CpuPerformanceSplit> {
        let mut split = CpuPerformanceSplit::default();

        for ip in self.metric_node_ips()? {
            let Some(stats) = self.cpu_stats(&ip)? else {
                continue;
            };
            if stats.mean > threshold_mean {
                split.above_means.push(stats.mean);
            } else {
                split.below_means.push(stats.mean);
            }
            if stats.variance > threshold_var {
                split.above_vars.push(stats.variance);
            } else {
                split.below_vars.push(stats.variance);
            }
        }

        split.above_means.sort_by(f64::total_cmp);
        split.below_means.sort_by(f64::total_cmp);
        split.above_vars.sort_by(f64::total_cmp);
        split.below_vars.sort_by(f64::total_cmp);
        Ok(split)
    }

    /// Distinct IPs present in the metrics history.
    pub fn metric_node_ips(&self) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(NODE_METRICS).map_err(map_err!(Table))?;
        let mut ips: Vec<String> = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            // History keys are `{ip}:{ts:020}`; keys sort by IP so duplicates
            // are contiguous.
            if let Some(ip) = key.value().rsplit_once(':').map(|(ip, _)| ip) {
                if ips.last().map(String::as_str) != Some(ip) {
                    ips.push(ip.to_string());
                }
            }
        }
        Ok(ips)
    }

    /// Number of distinct nodes that have reported metrics.
    pub fn count_metric_nodes(&self) -> StateResult<usize> {
        Ok(self.metric_node_ips()?.len())
    }

    /// Latest CPU snapshot for every node of a region.
    ///
    /// Nodes without any metrics sample are skipped.
    pub fn latest_node_info_by_region(&self, region: &str) -> StateResult<Vec<NodeSnapshot>> {
        let mut snapshots = Vec::new();
        for ip in self.region_ips(region)? {
            if let Some(m) = self.latest_node_metrics(&ip)? {
                snapshots.push(NodeSnapshot {
                    ip,
                    cpu_usage: m.cpu_usage,
                    cpu_cores: m.cpu_cores,
                });
            }
        }
        Ok(snapshots)
    }

    // ── Probe history ──────────────────────────────────────────────

    /// Append a probe result (append-only history).
    pub fn insert_probe_result(&self, record: &ProbeRecord) -> StateResult<()> {
        self.put_json(PROBE_RESULTS, &record.table_key(), record)
    }

    /// Most recent successful delay measurement for a directed link.
    pub fn latest_delay(&self, source_ip: &str, target_ip: &str) -> StateResult<Option<f64>> {
        let records: Vec<ProbeRecord> =
            self.scan_prefix(PROBE_RESULTS, &format!("{source_ip}|{target_ip}:"))?;
        Ok(records
            .iter()
            .rev()
            .find(|r| r.delay_ms >= 0)
            .map(|r| r.delay_ms as f64))
    }

    // ── Link virtual queues ────────────────────────────────────────

    /// Persist the evaluator state for a directed link.
    pub fn put_link_queue_state(&self, state: &LinkQueueState) -> StateResult<()> {
        self.put_json(LINK_QUEUES, &state.table_key(), state)
    }

    /// Read the evaluator state for a directed link.
    pub fn link_queue_state(
        &self,
        source_ip: &str,
        target_ip: &str,
    ) -> StateResult<Option<LinkQueueState>> {
        self.get_json(LINK_QUEUES, &format!("{source_ip}|{target_ip}"))
    }

    /// Current virtual-queue backlogs for a link, zero when unseen.
    pub fn queue_backlogs(&self, source_ip: &str, target_ip: &str) -> StateResult<(f64, f64)> {
        Ok(self
            .link_queue_state(source_ip, target_ip)?
            .map(|s| (s.queue_mean, s.queue_variance))
            .unwrap_or((0.0, 0.0)))
    }

    // ── Node regions ───────────────────────────────────────────────

    /// Insert or update a node→region assignment.
    pub fn upsert_node_region(&self, entry: &NodeRegionEntry) -> StateResult<()> {
        self.put_json(NODE_REGIONS, &entry.ip, entry)
    }

    /// Region of a node, `"unknown"` when unassigned.
    pub fn node_region(&self, ip: &str) -> StateResult<String> {
        Ok(self
            .get_json::<NodeRegionEntry>(NODE_REGIONS, ip)?
            .map(|e| e.region)
            .unwrap_or_else(|| UNKNOWN_REGION.to_string()))
    }

    /// All node→region assignments.
    pub fn list_node_regions(&self) -> StateResult<Vec<NodeRegionEntry>> {
        self.scan_prefix(NODE_REGIONS, "")
    }

    /// Distinct region names, sorted.
    pub fn regions(&self) -> StateResult<Vec<String>> {
        let mut regions: Vec<String> = self
            .list_node_regions()?
            .into_iter()
            .map(|e| e.region)
            .collect();
        regions.sort();
        regions.dedup();
        Ok(regions)
    }

    /// IPs belonging to a region.
    pub fn region_ips(&self, region: &str) -> StateResult<Vec<String>> {
        Ok(self
            .list_node_regions()?
            .into_iter()
            .filter(|e| e.region == region)
            .map(|e| e.ip)
            .collect())
    }

    // ── Domain origins ─────────────────────────────────────────────

    /// Insert or update a domain→origin mapping.
    pub fn upsert_domain_origin(&self, origin: &DomainOrigin) -> StateResult<()> {
        self.put_json(DOMAIN_ORIGINS, &origin.domain, origin)
    }

    /// All domain→origin mappings.
    pub fn list_domain_origins(&self) -> StateResult<Vec<DomainOrigin>> {
        self.scan_prefix(DOMAIN_ORIGINS, "")
    }

    /// Origin IP for a domain.
    pub fn origin_ip(&self, domain: &str) -> StateResult<Option<String>> {
        Ok(self
            .get_json::<DomainOrigin>(DOMAIN_ORIGINS, domain)?
            .map(|o| o.origin_ip))
    }

    /// Whether the IP is a registered last-mile origin server.
    pub fn is_origin_target(&self, ip: &str) -> StateResult<bool> {
        Ok(self.list_domain_origins()?.iter().any(|o| o.origin_ip == ip))
    }

    // ── Domain scheduler config ────────────────────────────────────

    /// Insert or update the last-mile scheduler parameters for a domain.
    pub fn upsert_domain_config(&self, config: &DomainBprConfig) -> StateResult<()> {
        self.put_json(DOMAIN_CONFIGS, &config.domain, config)
    }

    /// Scheduler parameters for a domain.
    pub fn domain_config(&self, domain: &str) -> StateResult<Option<DomainBprConfig>> {
        self.get_json(DOMAIN_CONFIGS, domain)
    }

    /// All configured domains.
    pub fn list_domain_configs(&self) -> StateResult<Vec<DomainBprConfig>> {
        self.scan_prefix(DOMAIN_CONFIGS, "")
    }

    // ── Scheduler backlogs ─────────────────────────────────────────

    /// Persistent scheduler backlog for a node, zero when unseen.
    pub fn backlog(&self, ip: &str) -> StateResult<f64> {
        Ok(self
            .get_json::<BacklogEntry>(BPR_BACKLOGS, ip)?
            .map(|e| e.backlog)
            .unwrap_or(0.0))
    }

    /// Persist the scheduler backlog for a node (last writer wins).
    pub fn put_backlog(&self, ip: &str, backlog: f64, updated_at: u64) -> StateResult<()> {
        let entry = BacklogEntry {
            ip: ip.to_string(),
            backlog,
            updated_at,
        };
        self.put_json(BPR_BACKLOGS, ip, &entry)
    }
}

/// Mean and population variance of a sample list.
fn summarize(samples: &[f64]) -> CpuStats {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    CpuStats { mean, variance }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn metrics(ip: &str, cpu: f64, at: u64) -> NodeMetrics {
        NodeMetrics {
            ip: ip.to_string(),
            cpu_usage: cpu,
            cpu_cores: 1,
            memory_usage: 40.0,
            collected_at: at,
        }
    }

    fn probe(src: &str, dst: &str, delay: i64, at: u64) -> ProbeRecord {
        ProbeRecord {
            source_ip: src.to_string(),
            source_region: "eu".to_string(),
            target_ip: dst.to_string(),
            target_region: "us".to_string(),
            delay_ms: delay,
            probed_at: at,
        }
    }

    fn region(ip: &str, name: &str) -> NodeRegionEntry {
        NodeRegionEntry {
            ip: ip.to_string(),
            region: name.to_string(),
            hostname: None,
            description: None,
        }
    }

    // ── Metrics history ────────────────────────────────────────────

    #[test]
    fn metrics_history_is_time_ordered() {
        let store = test_store();
        store.put_node_metrics(&metrics("10.0.0.1", 30.0, 200)).unwrap();
        store.put_node_metrics(&metrics("10.0.0.1", 20.0, 100)).unwrap();
        store.put_node_metrics(&metrics("10.0.0.1", 40.0, 300)).unwrap();

        let history = store.node_metrics_history("10.0.0.1").unwrap();
        let cpus: Vec<f64> = history.iter().map(|m| m.cpu_usage).collect();
        assert_eq!(cpus, vec![20.0, 30.0, 40.0]);

        let latest = store.latest_node_metrics("10.0.0.1").unwrap().unwrap();
        assert_eq!(latest.collected_at, 300);
    }

    #[test]
    fn cpu_stats_uses_recent_window() {
        let store = test_store();
        // 15 samples; only the last 10 (cpu = 6..=15) should count.
        for i in 1..=15u64 {
            store.put_node_metrics(&metrics("10.0.0.1", i as f64, i)).unwrap();
        }
        let stats = store.cpu_stats("10.0.0.1").unwrap().unwrap();
        assert!((stats.mean - 10.5).abs() < 1e-9);
    }

    #[test]
    fn cpu_stats_missing_node_is_none() {
        let store = test_store();
        assert!(store.cpu_stats("10.9.9.9").unwrap().is_none());
    }

    #[test]
    fn performance_split_buckets_and_sorts() {
        let store = test_store();
        store.put_node_metrics(&metrics("10.0.0.1", 80.0, 1)).unwrap();
        store.put_node_metrics(&metrics("10.0.0.2", 20.0, 1)).unwrap();
        store.put_node_metrics(&metrics("10.0.0.3", 60.0, 1)).unwrap();

        let split = store.cpu_performance_split(50.0, 50.0).unwrap();
        assert_eq!(split.above_means, vec![60.0, 80.0]);
        assert_eq!(split.below_means, vec![20.0]);
        // Single-sample variance is zero for all three nodes.
        assert_eq!(split.below_vars.len(), 3);
    }

    #[test]
    fn count_metric_nodes_is_distinct() {
        let store = test_store();
        store.put_node_metrics(&metrics("10.0.0.1", 10.0, 1)).unwrap();
        store.put_node_metrics(&metrics("10.0.0.1", 11.0, 2)).unwrap();
        store.put_node_metrics(&metrics("10.0.0.2", 12.0, 1)).unwrap();
        assert_eq!(store.count_metric_nodes().unwrap(), 2);
    }

    // ── Probe history ──────────────────────────────────────────────

    #[test]
    fn latest_delay_skips_failures() {
        let store = test_store();
        store.insert_probe_result(&probe("a", "b", 12, 100)).unwrap();
        store.insert_probe_result(&probe("a", "b", 20, 200)).unwrap();
        store.insert_probe_result(&probe("a", "b", -1, 300)).unwrap();

        // The newest record is a failure; the latest valid sample wins.
        assert_eq!(store.latest_delay("a", "b").unwrap(), Some(20.0));
    }

    #[test]
    fn latest_delay_missing_link_is_none() {
        let store = test_store();
        assert!(store.latest_delay("a", "b").unwrap().is_none());
    }

    // ── Link queues ────────────────────────────────────────────────

    #[test]
    fn link_queue_roundtrip_and_default() {
        let store = test_store();
        assert_eq!(store.queue_backlogs("a", "b").unwrap(), (0.0, 0.0));

        let state = LinkQueueState {
            source_ip: "a".to_string(),
            target_ip: "b".to_string(),
            delay_ms: 42.0,
            cpu_mean: 55.0,
            cpu_variance: 3.0,
            queue_mean: 0.25,
            queue_variance: 0.1,
            updated_at: 1000,
        };
        store.put_link_queue_state(&state).unwrap();
        assert_eq!(store.queue_backlogs("a", "b").unwrap(), (0.25, 0.1));
        assert_eq!(store.link_queue_state("a", "b").unwrap(), Some(state));
    }

    // ── Regions ────────────────────────────────────────────────────

    #[test]
    fn region_membership() {
        let store = test_store();
        store.upsert_node_region(&region("10.0.0.1", "eu")).unwrap();
        store.upsert_node_region(&region("10.0.0.2", "eu")).unwrap();
        store.upsert_node_region(&region("10.0.1.1", "us")).unwrap();

        assert_eq!(store.regions().unwrap(), vec!["eu", "us"]);
        assert_eq!(store.region_ips("eu").unwrap().len(), 2);
        assert_eq!(store.node_region("10.0.1.1").unwrap(), "us");
        assert_eq!(store.node_region("1.2.3.4").unwrap(), "unknown");
    }

    #[test]
    fn latest_node_info_by_region_skips_silent_nodes() {
        let store = test_store();
        store.upsert_node_region(&region("10.0.0.1", "eu")).unwrap();
        store.upsert_node_region(&region("10.0.0.2", "eu")).unwrap();
        store.put_node_metrics(&metrics("10.0.0.1", 33.0, 5)).unwrap();

        let snaps = store.latest_node_info_by_region("eu").unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].ip, "10.0.0.1");
        assert_eq!(snaps[0].cpu_usage, 33.0);
    }

    // ── Domains ────────────────────────────────────────────────────

    #[test]
    fn domain_origin_roundtrip() {
        let store = test_store();
        store
            .upsert_domain_origin(&DomainOrigin {
                domain: "example.com".to_string(),
                origin_ip: "203.0.113.10".to_string(),
            })
            .unwrap();

        assert_eq!(
            store.origin_ip("example.com").unwrap(),
            Some("203.0.113.10".to_string())
        );
        assert!(store.is_origin_target("203.0.113.10").unwrap());
        assert!(!store.is_origin_target("203.0.113.11").unwrap());
        assert!(store.origin_ip("nope.com").unwrap().is_none());
    }

    #[test]
    fn domain_config_roundtrip() {
        let store = test_store();
        let config = DomainBprConfig {
            domain: "example.com".to_string(),
            total_req_increment: 30,
            redistribution_proportion: 0.5,
        };
        store.upsert_domain_config(&config).unwrap();
        assert_eq!(store.domain_config("example.com").unwrap(), Some(config));
        assert_eq!(store.list_domain_configs().unwrap().len(), 1);
    }

    // ── Backlogs ───────────────────────────────────────────────────

    #[test]
    fn backlog_defaults_to_zero_and_updates() {
        let store = test_store();
        assert_eq!(store.backlog("10.0.0.1").unwrap(), 0.0);

        store.put_backlog("10.0.0.1", 7.5, 1000).unwrap();
        assert_eq!(store.backlog("10.0.0.1").unwrap(), 7.5);

        store.put_backlog("10.0.0.1", 0.0, 2000).unwrap();
        assert_eq!(store.backlog("10.0.0.1").unwrap(), 0.0);
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.upsert_node_region(&region("10.0.0.1", "eu")).unwrap();
            store.put_backlog("10.0.0.1", 3.0, 1).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.node_region("10.0.0.1").unwrap(), "eu");
        assert_eq!(store.backlog("10.0.0.1").unwrap(), 3.0);
    }

    #[test]
    fn empty_store_operations() {
        let store = test_store();
        assert!(store.regions().unwrap().is_empty());
        assert!(store.list_domain_origins().unwrap().is_empty());
        assert!(store.list_domain_configs().unwrap().is_empty());
        assert_eq!(store.count_metric_nodes().unwrap(), 0);
        assert!(store.latest_node_info_by_region("eu").unwrap().is_empty());
    }
}
