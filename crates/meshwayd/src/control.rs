//! Control mode — runs the coordinator.
//!
//! In this mode the daemon:
//! 1. Opens the state store and seeds it from the configuration file
//! 2. Serves the heartbeat gRPC endpoint
//! 3. Runs the assessment engine (armed by the heartbeat server)
//! 4. Runs one last-mile scheduler ticker per configured (domain, region)
//! 5. Publishes the dynamic routing document over HTTP

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use meshway_assess::{AssessmentEngine, LinkEvaluatorParams};
use meshway_bpr::{BprParams, BprResultCache, BprScheduler};
use meshway_heartbeat::{HeartbeatServer, ServerConfig};
use meshway_publish::{publisher_router, PublishState, RoutePublisher};
use meshway_state::{DomainBprConfig, DomainOrigin, NodeRegionEntry, StateStore};

use crate::config::MeshwayConfig;

/// Grace period for background tasks after the shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run_control(config: MeshwayConfig) -> anyhow::Result<()> {
    info!("meshway daemon starting in control mode");

    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(&config.database.path)?;
    info!(path = ?config.database.path, "state store opened");

    seed_store(&store, &config)?;

    // ── Shutdown fan-out ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Assessment engine (started by the heartbeat server) ──────
    let engine = Arc::new(AssessmentEngine::new(
        store.clone(),
        LinkEvaluatorParams::default(),
        Duration::from_secs(config.control.assessment_interval_secs),
    ));

    // ── Heartbeat gRPC server ────────────────────────────────────
    let listen_addr = config.control.listen_addr.parse()?;
    let server_config = ServerConfig {
        listen_addr,
        data_dir: config.control.data_dir.clone(),
        buffer_period: Duration::from_secs(config.control.buffer_period_secs),
        task_interval: Duration::from_secs(config.control.task_interval_secs),
        assessment_interval: Duration::from_secs(config.control.assessment_interval_secs),
        agent_config_port: config.control.agent_config_port,
    };
    let heartbeat = HeartbeatServer::new(
        &server_config,
        store.clone(),
        Arc::clone(&engine),
        shutdown_rx.clone(),
    )?;
    let heartbeat_handle = tokio::spawn(heartbeat.serve(listen_addr));
    info!(%listen_addr, "heartbeat server starting");

    // ── Last-mile scheduler tickers ──────────────────────────────
    let cache = Arc::new(BprResultCache::new());
    let scheduler = Arc::new(BprScheduler::new(
        store.clone(),
        Arc::clone(&cache),
        BprParams::default(),
    ));
    let mut scheduler_handles = Vec::new();
    for task in &config.bpr_scheduling_tasks {
        let handle = tokio::spawn(Arc::clone(&scheduler).run(
            task.domain.clone(),
            task.region.clone(),
            Duration::from_secs(task.interval_secs),
            shutdown_rx.clone(),
        ));
        scheduler_handles.push(handle);
        info!(domain = %task.domain, region = %task.region, "scheduler ticker spawned");
    }

    // ── Dynamic route publisher ──────────────────────────────────
    let publisher = Arc::new(RoutePublisher::new(
        Arc::clone(&cache),
        config.control.redirect_port,
        Duration::from_secs(config.control.publish_interval_secs),
    ));
    let publish_state = PublishState {
        store: store.clone(),
        engine: Arc::clone(&engine),
        cache: Arc::clone(&cache),
        document: publisher.document(),
    };
    let publisher_handle = tokio::spawn(Arc::clone(&publisher).run(shutdown_rx.clone()));

    let router = publisher_router(publish_state);
    let publish_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.control.publish_port));
    let listener = tokio::net::TcpListener::bind(publish_addr).await?;
    info!(%publish_addr, "route publisher endpoint starting");

    let mut serve_shutdown = shutdown_rx.clone();
    let publish_server = tokio::spawn(async move {
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        });
        if let Err(e) = server.await {
            warn!(error = %e, "publish endpoint error");
        }
    });

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = publish_server.await;
        let _ = publisher_handle.await;
        for handle in scheduler_handles {
            let _ = handle.await;
        }
        let _ = heartbeat_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        warn!("shutdown timeout reached, some services did not stop gracefully");
    }

    info!("control plane stopped");
    Ok(())
}

/// Load configured regions, origins, and scheduler parameters into the
/// store so heartbeats and tickers find them.
fn seed_store(store: &StateStore, config: &MeshwayConfig) -> anyhow::Result<()> {
    for entry in &config.node_regions {
        store.upsert_node_region(&NodeRegionEntry {
            ip: entry.ip.clone(),
            region: entry.region.clone(),
            hostname: entry.hostname.clone(),
            description: entry.description.clone(),
        })?;
    }
    for entry in &config.domain_origins {
        store.upsert_domain_origin(&DomainOrigin {
            domain: entry.domain.clone(),
            origin_ip: entry.origin_ip.clone(),
        })?;
    }
    for entry in &config.domain_configurations {
        store.upsert_domain_config(&DomainBprConfig {
            domain: entry.domain.clone(),
            total_req_increment: entry.total_req_increment,
            redistribution_proportion: entry.redistribution_proportion,
        })?;
    }
    info!(
        nodes = config.node_regions.len(),
        origins = config.domain_origins.len(),
        domains = config.domain_configurations.len(),
        "store seeded from configuration"
    );
    Ok(())
}
