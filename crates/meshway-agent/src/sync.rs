//! The data-plane sync loop.
//!
//! Registers with the control plane once, then on every report interval:
//! collect system metrics, run the probe sweep, sync (uploading both and
//! pulling any changed artifacts), and — when the response carries a fresh
//! assessment snapshot — rebuild the local topology and recompute the
//! path set per configured origin.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use meshway_assess::RegionPairAssessment;
use meshway_heartbeat::proto::SyncResponse;
use meshway_heartbeat::{HeartbeatClient, NodeArtifacts};
use meshway_routing::{PathManager, TopologyGraph};

use crate::collector::MetricsCollector;
use crate::error::{AgentError, AgentResult};
use crate::probe::ProbeExecutor;

/// Consecutive sync failures before a fault report goes out.
const FAULT_REPORT_THRESHOLD: u32 = 3;

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Data-plane loop configuration.
#[derive(Debug, Clone)]
pub struct DataPlaneConfig {
    /// This node's overlay IP.
    pub node_ip: String,
    /// Control-plane heartbeat address (host:port).
    pub control_addr: String,
    /// Sync cadence.
    pub report_interval: Duration,
}

/// Wires collector, prober, heartbeat client, and path recomputation.
pub struct DataPlane {
    config: DataPlaneConfig,
    artifacts: Arc<NodeArtifacts>,
    collector: MetricsCollector,
    executor: ProbeExecutor,
    paths: Arc<PathManager>,
}

impl DataPlane {
    pub fn new(
        config: DataPlaneConfig,
        artifacts: Arc<NodeArtifacts>,
        collector: MetricsCollector,
        executor: ProbeExecutor,
        paths: Arc<PathManager>,
    ) -> Self {
        Self {
            config,
            artifacts,
            collector,
            executor,
            paths,
        }
    }

    /// Run init + the sync loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        let mut client =
            HeartbeatClient::connect(&self.config.control_addr, Arc::clone(&self.artifacts))
                .await?;

        if !self.artifacts.is_initialized() {
            client.init_data_plane(self.collector.collect()).await?;
            info!(node_ip = %self.config.node_ip, "data plane registered");
        }

        let mut consecutive_failures = 0u32;
        let mut ticker = tokio::time::interval(self.config.report_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync_round(&mut client).await {
                        Ok(()) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(error = %e, consecutive_failures, "sync round failed");
                            if consecutive_failures == FAULT_REPORT_THRESHOLD {
                                self.report_sync_fault(&mut client, &e).await;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("data plane loop shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Tell the control plane that this node's sync path is degraded.
    async fn report_sync_fault(&self, client: &mut HeartbeatClient, cause: &AgentError) {
        let fault = meshway_heartbeat::proto::FaultInfo {
            fault_id: format!("sync-{}-{}", self.config.node_ip, epoch_secs()),
            node_ip: self.config.node_ip.clone(),
            kind: "sync".to_string(),
            detail: cause.to_string(),
            reported_at: epoch_secs() as i64,
        };
        if let Err(e) = client.report_fault(fault).await {
            warn!(error = %e, "fault report failed");
        }
    }

    async fn sync_round(&self, client: &mut HeartbeatClient) -> AgentResult<()> {
        let metrics = self.collector.collect();
        let probes = self.executor.collect_region_probes(&self.artifacts).await;
        let probe_view = probes.clone();

        let response = client.sync_metrics(metrics, probes).await?;
        self.apply_assessments(&response, &probe_view);
        Ok(())
    }

    /// Rebuild topology and paths from a sync response's assessment
    /// snapshot.
    fn apply_assessments(
        &self,
        response: &SyncResponse,
        local_probes: &[meshway_heartbeat::proto::RegionProbeResult],
    ) {
        if response.region_assessments.is_empty() {
            return;
        }
        let Some(node_list) = self.artifacts.node_list() else {
            debug!("assessments received before node list, deferring");
            return;
        };

        let assessments: Vec<RegionPairAssessment> = response
            .region_assessments
            .iter()
            .map(Into::into)
            .collect();
        let nodes: Vec<(String, String)> = node_list
            .nodes
            .iter()
            .map(|n| (n.ip.clone(), n.region.clone()))
            .collect();

        let mut topology = TopologyGraph::from_assessments(&assessments, &nodes);

        // Fresh local measurements replace the assessment-derived edges
        // for this node's own links.
        for region in local_probes {
            for probe in &region.ip_probes {
                if probe.tcp_delay >= 0 && probe.target_ip != "normal_avg" {
                    topology.overlay_local_probe(
                        &self.config.node_ip,
                        &probe.target_ip,
                        probe.tcp_delay as f64,
                    );
                }
            }
        }

        let mut recomputed = 0;
        for mapping in self.artifacts.domain_mappings() {
            match self
                .paths
                .calculate_paths(&topology, &self.config.node_ip, &mapping.ip)
            {
                Ok(count) => {
                    recomputed += 1;
                    debug!(domain = %mapping.domain, paths = count, "path set recomputed");
                }
                Err(e) => {
                    debug!(domain = %mapping.domain, error = %e, "path computation skipped");
                }
            }
        }
        info!(
            region_pairs = assessments.len(),
            origins = recomputed,
            "topology applied"
        );
    }
}
