//! Probe task generation.
//!
//! Every generator tick the live node table is turned into three
//! artifacts: the node list, a probe-task list per source node (every
//! other node is a target), and the domain→origin mapping. The generator
//! is checked at half its interval so a due regeneration never waits a
//! full period.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use meshway_state::StateStore;

use crate::artifact::{task_id, ArtifactStore};
use crate::error::HeartbeatResult;
use crate::proto::{DomainIpMapping, NodeInfo, NodeList, ProbeTask};

/// Regenerates probe tasks and configuration artifacts on an interval.
pub struct TaskGenerator {
    store: StateStore,
    artifacts: Arc<ArtifactStore>,
    interval: std::time::Duration,
    last_gen: Mutex<Option<tokio::time::Instant>>,
}

impl TaskGenerator {
    pub fn new(
        store: StateStore,
        artifacts: Arc<ArtifactStore>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            artifacts,
            interval,
            last_gen: Mutex::new(None),
        }
    }

    /// Regenerate artifacts if the interval has elapsed. Returns whether a
    /// generation ran.
    pub async fn generate_if_due(&self) -> bool {
        let mut last = self.last_gen.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.interval {
                return false;
            }
        }
        *last = Some(tokio::time::Instant::now());
        drop(last);

        match self.generate() {
            Ok(nodes) => {
                info!(nodes, "probe tasks regenerated");
                true
            }
            Err(e) => {
                warn!(error = %e, "task generation failed");
                false
            }
        }
    }

    /// Regenerate immediately, bypassing the interval guard. Used when the
    /// buffer period after a burst of inits ends.
    pub async fn generate_now(&self) {
        *self.last_gen.lock().await = Some(tokio::time::Instant::now());
        match self.generate() {
            Ok(nodes) => info!(nodes, "probe tasks regenerated (forced)"),
            Err(e) => warn!(error = %e, "forced task generation failed"),
        }
    }

    /// One full generation pass over the current state.
    fn generate(&self) -> HeartbeatResult<usize> {
        let entries = self.store.list_node_regions()?;
        let nodes: Vec<NodeInfo> = entries
            .iter()
            .map(|e| NodeInfo {
                ip: e.ip.clone(),
                region: e.region.clone(),
            })
            .collect();
        let node_count = nodes.len();
        self.artifacts.save_node_list(NodeList { nodes })?;

        let mappings: Vec<DomainIpMapping> = self
            .store
            .list_domain_origins()?
            .into_iter()
            .map(|o| DomainIpMapping {
                domain: o.domain,
                ip: o.origin_ip,
            })
            .collect();
        self.artifacts.save_domain_mappings(mappings)?;

        for source in &entries {
            let tasks: Vec<ProbeTask> = entries
                .iter()
                .filter(|target| target.ip != source.ip)
                .map(|target| ProbeTask {
                    task_id: task_id(&source.ip, &target.ip),
                    target_ip: target.ip.clone(),
                })
                .collect();
            self.artifacts.save_node_tasks(&source.ip, tasks)?;
        }

        Ok(node_count)
    }

    /// Run the generation loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval / 2);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.generate_if_due().await;
                }
                _ = shutdown.changed() => {
                    info!("task generator shutting down");
                    return;
                }
            }
        }
    }
}
