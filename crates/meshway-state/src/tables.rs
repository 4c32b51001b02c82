//! redb table definitions for the meshway state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). History tables append under `{key}:{ts:020}` composite keys so a
//! prefix scan walks records in time order; the rest are upserts.

use redb::TableDefinition;

/// Node metrics history keyed by `{ip}:{collected_at:020}`.
pub const NODE_METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_metrics");

/// Probe results keyed by `{source_ip}|{target_ip}:{probed_at:020}` (append-only).
pub const PROBE_RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("probe_results");

/// Per-link virtual-queue state keyed by `{source_ip}|{target_ip}`.
pub const LINK_QUEUES: TableDefinition<&str, &[u8]> = TableDefinition::new("link_queues");

/// Node→region assignments keyed by `{ip}`.
pub const NODE_REGIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_regions");

/// Domain→origin-IP mappings keyed by `{domain}`.
pub const DOMAIN_ORIGINS: TableDefinition<&str, &[u8]> = TableDefinition::new("domain_origins");

/// Per-domain last-mile scheduler configuration keyed by `{domain}`.
pub const DOMAIN_CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("domain_configs");

/// Persistent per-node scheduler backlog keyed by `{ip}`.
pub const BPR_BACKLOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("bpr_backlogs");
