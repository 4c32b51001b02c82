//! Heartbeat client — data-plane side.
//!
//! Connects to the control plane with bounded dial retries, registers via
//! `InitDataPlane`, and keeps the node's artifact cache current through
//! hash-diffed `SyncMetrics` exchanges. Server-initiated pushes land on
//! the node's own small `ConfigService` listener.

use std::sync::Arc;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::artifact::NodeArtifacts;
use crate::error::{HeartbeatError, HeartbeatResult};
use crate::proto;
use crate::proto::config_service_server::{ConfigService, ConfigServiceServer};
use crate::proto::fault_service_client::FaultServiceClient;
use crate::proto::metrics_service_client::MetricsServiceClient;

/// Dial attempts before giving up on the control plane.
const DIAL_RETRIES: usize = 3;
/// Pause between dial attempts.
const DIAL_BACKOFF: Duration = Duration::from_secs(2);
/// Per-dial connect deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the one-shot init call.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for each periodic sync call.
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection to the control plane's heartbeat services.
pub struct HeartbeatClient {
    metrics: MetricsServiceClient<Channel>,
    fault: FaultServiceClient<Channel>,
    artifacts: Arc<NodeArtifacts>,
}

impl HeartbeatClient {
    /// Connect to `control_addr` (host:port) with bounded retries.
    pub async fn connect(
        control_addr: &str,
        artifacts: Arc<NodeArtifacts>,
    ) -> HeartbeatResult<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{control_addr}"))
            .map_err(HeartbeatError::Transport)?
            .connect_timeout(DIAL_TIMEOUT);

        let mut last_err = None;
        for attempt in 1..=DIAL_RETRIES {
            match endpoint.connect().await {
                Ok(channel) => {
                    info!(%control_addr, attempt, "connected to control plane");
                    return Ok(Self {
                        metrics: MetricsServiceClient::new(channel.clone()),
                        fault: FaultServiceClient::new(channel),
                        artifacts,
                    });
                }
                Err(e) => {
                    warn!(%control_addr, attempt, error = %e, "control plane dial failed");
                    last_err = Some(e);
                    if attempt < DIAL_RETRIES {
                        tokio::time::sleep(DIAL_BACKOFF).await;
                    }
                }
            }
        }
        drop(last_err);
        Err(HeartbeatError::DialExhausted(DIAL_RETRIES))
    }

    /// Register this node with the control plane.
    pub async fn init_data_plane(&mut self, metrics: proto::Metrics) -> HeartbeatResult<()> {
        let request = proto::InitRequest {
            metrics: Some(metrics),
        };
        let response = tokio::time::timeout(INIT_TIMEOUT, self.metrics.init_data_plane(request))
            .await
            .map_err(|_| HeartbeatError::Rpc(Status::deadline_exceeded("init timed out")))??
            .into_inner();
        info!(status = %response.status, message = %response.message, "init acknowledged");
        Ok(())
    }

    /// One sync round: upload metrics and probe bundles, apply any changed
    /// artifacts, and return the full response (the caller consumes the
    /// assessment snapshot).
    pub async fn sync_metrics(
        &mut self,
        metrics: proto::Metrics,
        region_probe_results: Vec<proto::RegionProbeResult>,
    ) -> HeartbeatResult<proto::SyncResponse> {
        let (node_list_hash, probe_tasks_hash, domain_ip_mappings_hash) = self.artifacts.hashes();
        let request = proto::SyncRequest {
            metrics: Some(metrics),
            node_list_hash,
            probe_tasks_hash,
            domain_ip_mappings_hash,
            region_probe_results,
        };

        let response = tokio::time::timeout(SYNC_TIMEOUT, self.metrics.sync_metrics(request))
            .await
            .map_err(|_| HeartbeatError::Rpc(Status::deadline_exceeded("sync timed out")))??
            .into_inner();

        if response.need_update_node_list {
            if let Some(list) = &response.node_list {
                self.artifacts.save_node_list(list.clone())?;
                debug!(nodes = list.nodes.len(), "node list updated");
            }
        }
        if response.need_update_probe_tasks {
            self.artifacts
                .save_probe_tasks(response.probe_tasks.clone())?;
            debug!(tasks = response.probe_tasks.len(), "probe tasks updated");
        }
        if response.need_update_domain_ip_mappings {
            self.artifacts
                .save_domain_mappings(response.domain_ip_mappings.clone())?;
            debug!(
                mappings = response.domain_ip_mappings.len(),
                "domain mappings updated"
            );
        }

        Ok(response)
    }

    /// Report a node-side fault (dial failure past retry, invariant
    /// violation) to the control plane.
    pub async fn report_fault(&mut self, fault: proto::FaultInfo) -> HeartbeatResult<()> {
        let response = self
            .fault
            .report_fault(proto::ReportFaultRequest {
                fault_info: Some(fault),
            })
            .await?
            .into_inner();
        if response.status != "ok" {
            warn!(status = %response.status, message = %response.message, "fault report rejected");
        }
        Ok(())
    }
}

/// Node-side ConfigService: accepts server-initiated artifact pushes.
pub struct NodeConfigService {
    artifacts: Arc<NodeArtifacts>,
}

impl NodeConfigService {
    pub fn new(artifacts: Arc<NodeArtifacts>) -> Self {
        Self { artifacts }
    }

    pub fn into_service(self) -> ConfigServiceServer<Self> {
        ConfigServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl ConfigService for NodeConfigService {
    async fn push_config(
        &self,
        request: Request<proto::PushConfigRequest>,
    ) -> Result<Response<proto::SimpleResponse>, Status> {
        let req = request.into_inner();

        if let Some(list) = req.node_list {
            let count = list.nodes.len();
            self.artifacts
                .save_node_list(list)
                .map_err(|e| Status::internal(e.to_string()))?;
            debug!(nodes = count, "pushed node list saved");
        }
        if !req.probe_tasks.is_empty() {
            self.artifacts
                .save_probe_tasks(req.probe_tasks)
                .map_err(|e| Status::internal(e.to_string()))?;
        }
        if !req.domain_ip_mappings.is_empty() {
            self.artifacts
                .save_domain_mappings(req.domain_ip_mappings)
                .map_err(|e| Status::internal(e.to_string()))?;
        }

        Ok(Response::new(proto::SimpleResponse {
            status: "ok".to_string(),
            message: "config applied".to_string(),
        }))
    }
}
