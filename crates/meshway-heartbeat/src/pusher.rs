//! Best-effort configuration push to data-plane nodes.
//!
//! After a generation pass the control plane pushes the fresh artifacts to
//! every known node over its `ConfigService` endpoint. Pushes run through
//! a bounded worker pool with a per-push deadline; failures are logged and
//! healed by the next sync cycle's hash diff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::artifact::ArtifactStore;
use crate::proto::config_service_client::ConfigServiceClient;
use crate::proto::{NodeList, PushConfigRequest};

/// Pushes artifacts to all nodes with bounded concurrency.
pub struct ConfigPusher {
    /// Port of the node-side ConfigService listener.
    agent_port: u16,
    max_concurrent: usize,
    push_timeout: Duration,
}

impl ConfigPusher {
    pub fn new(agent_port: u16, max_concurrent: usize, push_timeout: Duration) -> Self {
        Self {
            agent_port,
            max_concurrent,
            push_timeout,
        }
    }

    /// Push the current artifacts to every node in `node_list`.
    ///
    /// Best-effort: each failure is logged, none aborts the rest.
    pub async fn push_to_all(&self, node_list: &NodeList, artifacts: &Arc<ArtifactStore>) {
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut set = JoinSet::new();

        for node in &node_list.nodes {
            let ip = node.ip.clone();
            let request = PushConfigRequest {
                node_list: Some(node_list.clone()),
                probe_tasks: artifacts.node_tasks(&ip),
                domain_ip_mappings: artifacts.domain_mappings(),
            };
            let permits = Arc::clone(&permits);
            let addr = format!("http://{}:{}", ip, self.agent_port);
            let timeout = self.push_timeout;

            set.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore closed");
                match push_one(&addr, request, timeout).await {
                    Ok(status) => debug!(%ip, %status, "config pushed"),
                    Err(e) => warn!(%ip, error = %e, "config push failed, node will pull on next sync"),
                }
            });
        }

        while set.join_next().await.is_some() {}
    }
}

async fn push_one(
    addr: &str,
    request: PushConfigRequest,
    timeout: Duration,
) -> Result<String, tonic::Status> {
    let push = async {
        let mut client = ConfigServiceClient::connect(addr.to_string())
            .await
            .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
        let response = client.push_config(request).await?;
        Ok::<_, tonic::Status>(response.into_inner().status)
    };
    tokio::time::timeout(timeout, push)
        .await
        .map_err(|_| tonic::Status::deadline_exceeded("config push timed out"))?
}
