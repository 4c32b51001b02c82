//! Forwarder mode — runs a data-plane node.
//!
//! In this mode the daemon:
//! 1. Opens the local artifact cache and joins the control plane
//! 2. Serves the config-push listener on the outer TCP port (which doubles
//!    as the probe target other nodes dial)
//! 3. Runs the sync loop (metrics + probes + artifact pulls + topology)
//! 4. Runs the access proxy and the relay proxy

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use meshway_agent::{DataPlane, DataPlaneConfig, MetricsCollector, ProbeExecutor};
use meshway_forward::{
    AccessConfig, AccessProxy, BufferConfig, DomainResolver, PeerTransport, RelayConfig,
    RelayProxy,
};
use meshway_heartbeat::{NodeArtifacts, NodeConfigService};
use meshway_routing::{PathManager, RouteParams};

use crate::config::MeshwayConfig;

/// Grace period for background tasks after the shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Domain resolution over the node's synced artifact cache.
struct ArtifactResolver {
    artifacts: Arc<NodeArtifacts>,
}

impl DomainResolver for ArtifactResolver {
    fn origin_ip(&self, domain: &str) -> Option<String> {
        self.artifacts
            .domain_mappings()
            .into_iter()
            .find(|m| m.domain == domain)
            .map(|m| m.ip)
    }
}

pub async fn run_forwarder(config: MeshwayConfig, outer_port: u16) -> anyhow::Result<()> {
    info!("meshway daemon starting in forwarder mode");
    let fwd = &config.forwarder;

    std::fs::create_dir_all(&fwd.data_dir)?;
    let artifacts = Arc::new(NodeArtifacts::open(&fwd.data_dir)?);
    info!(path = ?fwd.data_dir, initialized = artifacts.is_initialized(), "artifact cache opened");

    let paths = Arc::new(PathManager::new(RouteParams::default()));
    let transport = Arc::new(PeerTransport::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Config-push listener (outer TCP port, also the probe target) ─
    let push_service = NodeConfigService::new(Arc::clone(&artifacts));
    let push_addr = std::net::SocketAddr::from(([0, 0, 0, 0], outer_port));
    let mut push_shutdown = shutdown_rx.clone();
    let push_handle = tokio::spawn(async move {
        info!(%push_addr, "config push listener starting");
        let result = tonic::transport::Server::builder()
            .add_service(push_service.into_service())
            .serve_with_shutdown(push_addr, async move {
                let _ = push_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "config push listener error");
        }
    });

    // ── Data-plane sync loop ─────────────────────────────────────
    let data_plane = DataPlane::new(
        DataPlaneConfig {
            node_ip: fwd.node_ip.clone(),
            control_addr: fwd.control_addr.clone(),
            report_interval: Duration::from_secs(fwd.report_interval_secs),
        },
        Arc::clone(&artifacts),
        MetricsCollector::new(fwd.node_ip.clone()),
        ProbeExecutor::new(fwd.node_ip.clone(), outer_port, fwd.origin_probe_port),
        Arc::clone(&paths),
    );
    let sync_shutdown = shutdown_rx.clone();
    let sync_handle = tokio::spawn(async move {
        if let Err(e) = data_plane.run(sync_shutdown).await {
            warn!(error = %e, "data plane loop error");
        }
    });

    // ── Access proxy ─────────────────────────────────────────────
    let access = AccessProxy::new(
        AccessConfig {
            node_ip: fwd.node_ip.clone(),
            http_port: fwd.http_port,
            response_port: fwd.access_response_port,
            relay_request_port: fwd.relay_request_port,
            origin_port: fwd.origin_port,
            response_timeout: Duration::from_secs(fwd.response_timeout_secs),
        },
        BufferConfig::default(),
        Arc::clone(&paths),
        Arc::new(ArtifactResolver {
            artifacts: Arc::clone(&artifacts),
        }),
        Arc::clone(&transport),
    );
    let access_shutdown = shutdown_rx.clone();
    let access_handle = tokio::spawn(async move {
        if let Err(e) = access.serve(access_shutdown).await {
            warn!(error = %e, "access proxy error");
        }
    });

    // ── Relay proxy ──────────────────────────────────────────────
    let relay = RelayProxy::new(
        RelayConfig {
            request_port: fwd.relay_request_port,
            response_port: fwd.relay_response_port,
            relay_request_port: fwd.relay_request_port,
            access_response_port: fwd.access_response_port,
            relay_response_port: fwd.relay_response_port,
            origin_port: fwd.origin_port,
        },
        BufferConfig::default(),
        Arc::clone(&transport),
    );
    let relay_shutdown = shutdown_rx.clone();
    let relay_handle = tokio::spawn(async move {
        if let Err(e) = relay.serve(relay_shutdown).await {
            warn!(error = %e, "relay proxy error");
        }
    });

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = access_handle.await;
        let _ = relay_handle.await;
        let _ = sync_handle.await;
        let _ = push_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        warn!("shutdown timeout reached, some services did not stop gracefully");
    }

    info!("forwarder stopped");
    Ok(())
}
