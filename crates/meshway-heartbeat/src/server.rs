//! Heartbeat gRPC server — control-plane side.
//!
//! `InitDataPlane` registers fresh nodes and (re-)arms the buffer-period
//! timer so a burst of node starts is absorbed as one event: when the
//! timer fires, tasks are generated, pushed to all nodes, and the
//! assessment engine is started. `SyncMetrics` persists metrics and probe
//! results, hash-diffs the three configuration artifacts, and piggybacks
//! the latest assessment snapshot.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use meshway_assess::AssessmentEngine;
use meshway_state::{NodeMetrics, ProbeRecord, StateStore, UNKNOWN_REGION};

use crate::artifact::ArtifactStore;
use crate::error::HeartbeatResult;
use crate::proto;
use crate::proto::fault_service_server::{FaultService, FaultServiceServer};
use crate::proto::metrics_service_server::{MetricsService, MetricsServiceServer};
use crate::pusher::ConfigPusher;
use crate::tasks::TaskGenerator;

/// Interval of the readiness sweep that starts background services when
/// nodes are already present in the store (e.g. after a restart).
const READINESS_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub data_dir: PathBuf,
    /// Quiet window after the most recent init before distribution.
    pub buffer_period: Duration,
    /// Task generator interval.
    pub task_interval: Duration,
    /// Assessment recomputation interval.
    pub assessment_interval: Duration,
    /// Port of the node-side ConfigService listener.
    pub agent_config_port: u16,
}

struct ServerInner {
    store: StateStore,
    artifacts: Arc<ArtifactStore>,
    generator: Arc<TaskGenerator>,
    pusher: ConfigPusher,
    engine: Arc<AssessmentEngine>,
    buffer_period: Duration,
    generator_started: AtomicBool,
    engine_started: AtomicBool,
    init_timer: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Receiver<bool>,
}

/// The heartbeat gRPC server. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct HeartbeatServer {
    inner: Arc<ServerInner>,
}

impl HeartbeatServer {
    pub fn new(
        config: &ServerConfig,
        store: StateStore,
        engine: Arc<AssessmentEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> HeartbeatResult<Self> {
        let artifacts = Arc::new(ArtifactStore::open(&config.data_dir)?);
        let generator = Arc::new(TaskGenerator::new(
            store.clone(),
            Arc::clone(&artifacts),
            config.task_interval,
        ));
        let pusher = ConfigPusher::new(config.agent_config_port, 16, Duration::from_secs(5));

        Ok(Self {
            inner: Arc::new(ServerInner {
                store,
                artifacts,
                generator,
                pusher,
                engine,
                buffer_period: config.buffer_period,
                generator_started: AtomicBool::new(false),
                engine_started: AtomicBool::new(false),
                init_timer: Mutex::new(None),
                shutdown,
            }),
        })
    }

    pub fn artifacts(&self) -> Arc<ArtifactStore> {
        Arc::clone(&self.inner.artifacts)
    }

    /// Serve the Metrics and Fault services until shutdown.
    pub async fn serve(self, addr: SocketAddr) -> HeartbeatResult<()> {
        let mut shutdown = self.inner.shutdown.clone();
        self.spawn_readiness_sweep();

        info!(%addr, "heartbeat server listening");
        tonic::transport::Server::builder()
            .add_service(MetricsServiceServer::new(self.clone()))
            .add_service(FaultServiceServer::new(self))
            .serve_with_shutdown(addr, async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        info!("heartbeat server stopped");
        Ok(())
    }

    fn start_generator_once(&self) {
        if !self.inner.generator_started.swap(true, Ordering::SeqCst) {
            info!("starting task generator");
            let generator = Arc::clone(&self.inner.generator);
            let shutdown = self.inner.shutdown.clone();
            tokio::spawn(generator.run(shutdown));
        }
    }

    fn start_engine_once(&self) {
        if !self.inner.engine_started.swap(true, Ordering::SeqCst) {
            info!("starting assessment engine");
            let engine = Arc::clone(&self.inner.engine);
            let shutdown = self.inner.shutdown.clone();
            tokio::spawn(engine.run(shutdown));
        }
    }

    /// (Re-)arm the buffer-period timer; every fresh init pushes the
    /// distribution back so a burst of nodes is handled as one event.
    fn arm_buffer_timer(&self) {
        let server = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(server.inner.buffer_period).await;
            server.on_buffer_period_end().await;
        });

        let mut timer = self.inner.init_timer.lock().expect("timer lock poisoned");
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    async fn on_buffer_period_end(&self) {
        info!("buffer period elapsed, distributing configuration");
        self.inner.generator.generate_now().await;

        match self.inner.artifacts.node_list() {
            Some(list) if !list.nodes.is_empty() => {
                self.inner
                    .pusher
                    .push_to_all(&list, &self.inner.artifacts)
                    .await;
                info!(nodes = list.nodes.len(), "configuration pushed");
            }
            _ => warn!("no nodes known at buffer-period end, skipping push"),
        }

        self.start_engine_once();
    }

    /// Start background services without waiting for an init when the
    /// store already holds nodes from an earlier run.
    fn spawn_readiness_sweep(&self) {
        let server = self.clone();
        let mut shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(READINESS_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = server.inner.generator_started.load(Ordering::SeqCst)
                            && server.inner.engine_started.load(Ordering::SeqCst);
                        if started {
                            return;
                        }
                        match server.inner.store.count_metric_nodes() {
                            Ok(n) if n > 0 => {
                                server.start_generator_once();
                                server.start_engine_once();
                            }
                            Ok(_) => debug!("no nodes reporting yet"),
                            Err(e) => warn!(error = %e, "readiness sweep store error"),
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    fn store_probe_results(&self, source_ip: &str, results: &[proto::RegionProbeResult]) {
        let source_region = self
            .inner
            .store
            .node_region(source_ip)
            .unwrap_or_else(|_| UNKNOWN_REGION.to_string());
        let now = epoch_secs();

        for region_result in results {
            let target_region = if region_result.region.is_empty() {
                UNKNOWN_REGION
            } else {
                region_result.region.as_str()
            };
            for probe in &region_result.ip_probes {
                if probe.target_ip.is_empty() {
                    debug!(source_ip, "probe with empty target skipped");
                    continue;
                }
                if probe.tcp_delay < 0 {
                    debug!(source_ip, target = %probe.target_ip, "failed probe skipped");
                    continue;
                }
                let record = ProbeRecord {
                    source_ip: source_ip.to_string(),
                    source_region: source_region.clone(),
                    target_ip: probe.target_ip.clone(),
                    target_region: target_region.to_string(),
                    delay_ms: probe.tcp_delay,
                    probed_at: now,
                };
                if let Err(e) = self.inner.store.insert_probe_result(&record) {
                    warn!(error = %e, source_ip, target = %probe.target_ip, "probe insert failed");
                }
            }
        }
    }
}

#[tonic::async_trait]
impl MetricsService for HeartbeatServer {
    async fn init_data_plane(
        &self,
        request: Request<proto::InitRequest>,
    ) -> Result<Response<proto::SimpleResponse>, Status> {
        let req = request.into_inner();
        let Some(metrics) = req.metrics else {
            return Err(Status::invalid_argument("metrics missing"));
        };

        let node_metrics = NodeMetrics::from(&metrics);
        if let Err(e) = self.inner.store.put_node_metrics(&node_metrics) {
            return Ok(Response::new(proto::SimpleResponse {
                status: "error".to_string(),
                message: format!("metrics insert failed: {e}"),
            }));
        }

        self.start_generator_once();
        self.arm_buffer_timer();
        info!(ip = %metrics.ip, buffer = ?self.inner.buffer_period, "data plane init, buffer timer armed");

        Ok(Response::new(proto::SimpleResponse {
            status: "ok".to_string(),
            message: "registered".to_string(),
        }))
    }

    async fn sync_metrics(
        &self,
        request: Request<proto::SyncRequest>,
    ) -> Result<Response<proto::SyncResponse>, Status> {
        let req = request.into_inner();
        let Some(metrics) = req.metrics else {
            return Err(Status::invalid_argument("metrics missing"));
        };
        let node_ip = metrics.ip.clone();

        let node_metrics = NodeMetrics::from(&metrics);
        if let Err(e) = self.inner.store.put_node_metrics(&node_metrics) {
            return Ok(Response::new(proto::SyncResponse {
                status: "error".to_string(),
                message: format!("metrics insert failed: {e}"),
                ..Default::default()
            }));
        }

        if !req.region_probe_results.is_empty() {
            self.store_probe_results(&node_ip, &req.region_probe_results);
        }

        let artifacts = &self.inner.artifacts;
        let need_node_list = req.node_list_hash != artifacts.node_list_hash();
        let need_tasks = req.probe_tasks_hash != artifacts.node_tasks_hash(&node_ip);
        let need_mappings = req.domain_ip_mappings_hash != artifacts.domain_mappings_hash();

        let mut response = proto::SyncResponse {
            status: "ok".to_string(),
            message: String::new(),
            need_update_node_list: need_node_list,
            need_update_probe_tasks: need_tasks,
            need_update_domain_ip_mappings: need_mappings,
            ..Default::default()
        };
        if need_node_list {
            response.node_list = artifacts.node_list();
        }
        if need_tasks {
            response.probe_tasks = artifacts.node_tasks(&node_ip);
        }
        if need_mappings {
            response.domain_ip_mappings = artifacts.domain_mappings();
        }

        let assessments = self.inner.engine.cached_assessments().await;
        if !assessments.is_empty() {
            response.region_assessments = assessments.iter().map(Into::into).collect();
            debug!(
                ip = %node_ip,
                region_pairs = response.region_assessments.len(),
                "assessment snapshot attached"
            );
        }

        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl FaultService for HeartbeatServer {
    async fn report_fault(
        &self,
        request: Request<proto::ReportFaultRequest>,
    ) -> Result<Response<proto::SimpleResponse>, Status> {
        let req = request.into_inner();
        match req.fault_info {
            Some(fault) => {
                warn!(
                    fault_id = %fault.fault_id,
                    node_ip = %fault.node_ip,
                    kind = %fault.kind,
                    detail = %fault.detail,
                    "node reported fault"
                );
                Ok(Response::new(proto::SimpleResponse {
                    status: "ok".to_string(),
                    message: "fault recorded".to_string(),
                }))
            }
            None => Err(Status::invalid_argument("fault info missing")),
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshway_assess::LinkEvaluatorParams;
    use meshway_state::NodeRegionEntry;

    fn test_server(buffer_period: Duration) -> (HeartbeatServer, StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let engine = Arc::new(AssessmentEngine::new(
            store.clone(),
            LinkEvaluatorParams::default(),
            Duration::from_secs(60),
        ));
        let (_tx, rx) = watch::channel(false);
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.path().to_path_buf(),
            buffer_period,
            task_interval: Duration::from_secs(300),
            assessment_interval: Duration::from_secs(60),
            agent_config_port: 1,
        };
        let server = HeartbeatServer::new(&config, store.clone(), engine, rx).unwrap();
        (server, store, dir)
    }

    fn metrics(ip: &str) -> proto::Metrics {
        proto::Metrics {
            ip: ip.to_string(),
            cpu_usage: 25.0,
            cpu_cores: 1,
            memory_usage: 40.0,
            collected_at: 1000,
        }
    }

    #[tokio::test]
    async fn init_stores_metrics_and_acks() {
        let (server, store, _dir) = test_server(Duration::from_secs(60));
        let response = server
            .init_data_plane(Request::new(proto::InitRequest {
                metrics: Some(metrics("10.0.0.1")),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.status, "ok");
        assert_eq!(store.count_metric_nodes().unwrap(), 1);
    }

    #[tokio::test]
    async fn init_without_metrics_is_invalid() {
        let (server, _store, _dir) = test_server(Duration::from_secs(60));
        let result = server
            .init_data_plane(Request::new(proto::InitRequest { metrics: None }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn buffer_period_end_generates_artifacts() {
        let (server, store, _dir) = test_server(Duration::from_millis(50));
        store
            .upsert_node_region(&NodeRegionEntry {
                ip: "10.0.0.1".to_string(),
                region: "eu".to_string(),
                hostname: None,
                description: None,
            })
            .unwrap();

        server
            .init_data_plane(Request::new(proto::InitRequest {
                metrics: Some(metrics("10.0.0.1")),
            }))
            .await
            .unwrap();

        // Wait past the buffer period for the timer task to fire.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let list = server.artifacts().node_list().expect("node list generated");
        assert_eq!(list.nodes.len(), 1);
    }

    #[tokio::test]
    async fn sync_reports_stale_hashes_and_returns_artifacts() {
        let (server, store, _dir) = test_server(Duration::from_secs(60));
        store
            .upsert_node_region(&NodeRegionEntry {
                ip: "10.0.0.1".to_string(),
                region: "eu".to_string(),
                hostname: None,
                description: None,
            })
            .unwrap();
        server.inner.generator.generate_now().await;

        // Empty hashes: everything is stale.
        let response = server
            .sync_metrics(Request::new(proto::SyncRequest {
                metrics: Some(metrics("10.0.0.1")),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(response.need_update_node_list);
        assert!(response.need_update_probe_tasks);
        assert!(response.need_update_domain_ip_mappings);
        assert!(response.node_list.is_some());

        // Echoing the current hashes: nothing to update.
        let response = server
            .sync_metrics(Request::new(proto::SyncRequest {
                metrics: Some(metrics("10.0.0.1")),
                node_list_hash: server.artifacts().node_list_hash(),
                probe_tasks_hash: server.artifacts().node_tasks_hash("10.0.0.1"),
                domain_ip_mappings_hash: server.artifacts().domain_mappings_hash(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!response.need_update_node_list);
        assert!(!response.need_update_probe_tasks);
        assert!(!response.need_update_domain_ip_mappings);
        assert!(response.node_list.is_none());
    }

    #[tokio::test]
    async fn sync_persists_valid_probes_and_skips_failures() {
        let (server, store, _dir) = test_server(Duration::from_secs(60));

        let probes = vec![proto::RegionProbeResult {
            region: "us".to_string(),
            ip_probes: vec![
                proto::ProbeResult {
                    target_ip: "10.0.1.1".to_string(),
                    tcp_delay: 34,
                },
                proto::ProbeResult {
                    target_ip: "10.0.1.2".to_string(),
                    tcp_delay: -1,
                },
                proto::ProbeResult {
                    target_ip: String::new(),
                    tcp_delay: 5,
                },
            ],
        }];

        server
            .sync_metrics(Request::new(proto::SyncRequest {
                metrics: Some(metrics("10.0.0.1")),
                region_probe_results: probes,
                ..Default::default()
            }))
            .await
            .unwrap();

        assert_eq!(store.latest_delay("10.0.0.1", "10.0.1.1").unwrap(), Some(34.0));
        assert!(store.latest_delay("10.0.0.1", "10.0.1.2").unwrap().is_none());
    }

    #[tokio::test]
    async fn fault_reports_are_acknowledged() {
        let (server, _store, _dir) = test_server(Duration::from_secs(60));
        let response = server
            .report_fault(Request::new(proto::ReportFaultRequest {
                fault_info: Some(proto::FaultInfo {
                    fault_id: "f-1".to_string(),
                    node_ip: "10.0.0.1".to_string(),
                    kind: "dial".to_string(),
                    detail: "relay unreachable after retries".to_string(),
                    reported_at: 1000,
                }),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.status, "ok");
    }
}
