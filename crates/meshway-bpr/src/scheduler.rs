//! BPR scheduling ticker.
//!
//! One ticker per (domain, region) runs the algorithm periodically against
//! a live snapshot of the region's nodes, persists the per-node backlogs,
//! and publishes the allocation into the shared result cache.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use meshway_state::StateStore;

use crate::algorithm::{run_bpr, BprNode, BprParams};
use crate::cache::BprResultCache;
use crate::error::{BprError, BprResult};

/// Delay assumed for a backend with no probe sample yet (ms).
const DEFAULT_BACKEND_DELAY: f64 = 50.0;

/// Runs BPR for configured (domain, region) pairs.
pub struct BprScheduler {
    store: StateStore,
    cache: Arc<BprResultCache>,
    params: BprParams,
}

impl BprScheduler {
    pub fn new(store: StateStore, cache: Arc<BprResultCache>, params: BprParams) -> Self {
        Self {
            store,
            cache,
            params,
        }
    }

    pub fn cache(&self) -> Arc<BprResultCache> {
        Arc::clone(&self.cache)
    }

    /// One scheduling pass for a domain over a region.
    ///
    /// Returns the number of backends allocated to; zero when the region
    /// has no live nodes (the cache is left untouched in that case).
    pub fn run_once(&self, domain: &str, region: &str) -> BprResult<usize> {
        let config = self
            .store
            .domain_config(domain)?
            .ok_or_else(|| BprError::DomainNotConfigured(domain.to_string()))?;

        let snapshots = self.store.latest_node_info_by_region(region)?;
        if snapshots.is_empty() {
            debug!(domain, region, "no live nodes, skipping scheduling run");
            return Ok(0);
        }

        let origin_ip = self.store.origin_ip(domain)?;
        let mut nodes = Vec::with_capacity(snapshots.len());
        for (id, snap) in snapshots.iter().enumerate() {
            let backlog = self.store.backlog(&snap.ip)?;
            let delay = match &origin_ip {
                Some(origin) => self
                    .store
                    .latest_delay(&snap.ip, origin)?
                    .unwrap_or(DEFAULT_BACKEND_DELAY),
                None => DEFAULT_BACKEND_DELAY,
            };
            let onset_req = if self.params.onset_from_live_rate {
                self.cache
                    .get(domain)
                    .and_then(|a| a.get(&snap.ip).copied())
                    .unwrap_or(0)
            } else {
                0
            };
            nodes.push(BprNode::new(
                id,
                snap.ip.clone(),
                onset_req,
                snap.cpu_usage,
                backlog,
                delay,
                snap.cpu_cores,
            ));
        }

        let allocation = run_bpr(
            &mut nodes,
            config.total_req_increment,
            config.redistribution_proportion,
            &self.params,
        );

        let now = epoch_secs();
        for node in &nodes {
            if let Err(e) = self.store.put_backlog(&node.ip, node.queue_backlog, now) {
                warn!(ip = %node.ip, error = %e, "backlog persist failed");
            }
        }

        let backends = allocation.len();
        let total: i64 = allocation.values().sum();
        self.cache.set(domain, allocation);
        info!(domain, region, backends, total, "allocation published");
        Ok(backends)
    }

    /// Run the ticker for one (domain, region) pair until shutdown. The
    /// first pass runs immediately.
    pub async fn run(
        self: Arc<Self>,
        domain: String,
        region: String,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(%domain, %region, ?interval, "scheduler ticker started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(&domain, &region) {
                        warn!(%domain, %region, error = %e, "scheduling run failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(%domain, %region, "scheduler ticker shutting down");
                    return;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
