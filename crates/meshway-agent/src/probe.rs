//! TCP probe execution.
//!
//! A bounded worker pool measures TCP-connect time against every assigned
//! probe target, plus every domain→origin mapping on its origin port.
//! Failures encode as delay −1 and never abort the sweep; results are
//! bundled per target region for upload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use meshway_assess::detect_outliers;
use meshway_heartbeat::proto::{ProbeResult, RegionProbeResult};
use meshway_heartbeat::NodeArtifacts;
use meshway_state::UNKNOWN_REGION;

/// Failed probes carry this delay.
pub const PROBE_FAILED: i64 = -1;

/// Executes the node's probe task list.
pub struct ProbeExecutor {
    node_ip: String,
    /// Port probed on overlay nodes.
    node_port: u16,
    /// Port probed on origin servers.
    origin_port: u16,
    timeout: Duration,
    max_concurrent: usize,
}

impl ProbeExecutor {
    pub fn new(node_ip: String, node_port: u16, origin_port: u16) -> Self {
        Self {
            node_ip,
            node_port,
            origin_port,
            timeout: Duration::from_secs(2),
            max_concurrent: 50,
        }
    }

    /// One TCP-connect timing against `target:port`. Never errors: a
    /// failed or timed-out dial reports −1.
    pub async fn probe_once(target: &str, port: u16, timeout: Duration) -> i64 {
        let started = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect((target, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                started.elapsed().as_millis() as i64
            }
            _ => PROBE_FAILED,
        }
    }

    /// Probe every assigned target and origin mapping, bundled per region.
    pub async fn collect_region_probes(
        &self,
        artifacts: &NodeArtifacts,
    ) -> Vec<RegionProbeResult> {
        let Some(node_list) = artifacts.node_list() else {
            return Vec::new();
        };
        let tasks = artifacts.probe_tasks();

        let ip_to_region: HashMap<String, String> = node_list
            .nodes
            .iter()
            .map(|n| (n.ip.clone(), n.region.clone()))
            .collect();
        let own_region = ip_to_region
            .get(&self.node_ip)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_REGION.to_string());

        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut set: JoinSet<(String, ProbeResult)> = JoinSet::new();

        for task in tasks {
            let region = ip_to_region
                .get(&task.target_ip)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_REGION.to_string());
            let permits = Arc::clone(&permits);
            let target = task.target_ip.clone();
            let port = self.node_port;
            let timeout = self.timeout;
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore closed");
                let delay = Self::probe_once(&target, port, timeout).await;
                (
                    region,
                    ProbeResult {
                        target_ip: target,
                        tcp_delay: delay,
                    },
                )
            });
        }

        // Origin servers are probed on their serving port and bundled
        // under this node's own region.
        for mapping in artifacts.domain_mappings() {
            if mapping.ip.is_empty() {
                continue;
            }
            let permits = Arc::clone(&permits);
            let target = mapping.ip.clone();
            let port = self.origin_port;
            let timeout = self.timeout;
            let region = own_region.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore closed");
                let delay = Self::probe_once(&target, port, timeout).await;
                (
                    region,
                    ProbeResult {
                        target_ip: target,
                        tcp_delay: delay,
                    },
                )
            });
        }

        let mut by_region: HashMap<String, Vec<ProbeResult>> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            let (region, probe) = joined.expect("probe task panicked");
            by_region.entry(region).or_default().push(probe);
        }

        let mut results: Vec<RegionProbeResult> = by_region
            .into_iter()
            .map(|(region, mut ip_probes)| {
                ip_probes.sort_by(|a, b| a.target_ip.cmp(&b.target_ip));
                RegionProbeResult { region, ip_probes }
            })
            .collect();
        results.sort_by(|a, b| a.region.cmp(&b.region));

        debug!(regions = results.len(), "probe sweep finished");
        results
    }
}

/// Compress a region's probe list into one `normal_avg` pseudo-entry plus
/// outliers.
///
/// Bundles with too few valid samples, or without outliers, pass through
/// unchanged.
pub fn aggregate_region_probes(probes: &[ProbeResult]) -> Vec<ProbeResult> {
    let valid: Vec<&ProbeResult> = probes.iter().filter(|p| p.tcp_delay > 0).collect();
    if valid.len() < 5 {
        return probes.to_vec();
    }

    let delays: Vec<f64> = valid.iter().map(|p| p.tcp_delay as f64).collect();
    let outliers = detect_outliers(&delays, 3, 1.5);
    if outliers.is_empty() {
        return probes.to_vec();
    }

    let outlier_indices: Vec<usize> = outliers.iter().map(|o| o.index).collect();
    let normal: Vec<f64> = delays
        .iter()
        .enumerate()
        .filter(|(i, _)| !outlier_indices.contains(i))
        .map(|(_, d)| *d)
        .collect();
    if normal.is_empty() {
        return probes.to_vec();
    }
    let avg = normal.iter().sum::<f64>() / normal.len() as f64;

    let mut result = vec![ProbeResult {
        target_ip: "normal_avg".to_string(),
        tcp_delay: avg.round() as i64,
    }];
    for &i in &outlier_indices {
        result.push(ProbeResult {
            target_ip: valid[i].target_ip.clone(),
            tcp_delay: delays[i].round() as i64,
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshway_heartbeat::proto::{DomainIpMapping, NodeInfo, NodeList, ProbeTask};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_measures_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let delay = ProbeExecutor::probe_once("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(delay >= 0);
        assert!(delay < 2000);
    }

    #[tokio::test]
    async fn probe_failure_encodes_minus_one() {
        // Port 1 on loopback refuses immediately.
        let delay = ProbeExecutor::probe_once("127.0.0.1", 1, Duration::from_millis(500)).await;
        assert_eq!(delay, PROBE_FAILED);
    }

    #[tokio::test]
    async fn sweep_bundles_probes_by_region() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = NodeArtifacts::open(dir.path()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        artifacts
            .save_node_list(NodeList {
                nodes: vec![
                    NodeInfo {
                        ip: "10.0.0.1".to_string(),
                        region: "eu".to_string(),
                    },
                    NodeInfo {
                        ip: "127.0.0.1".to_string(),
                        region: "us".to_string(),
                    },
                ],
            })
            .unwrap();
        artifacts
            .save_probe_tasks(vec![ProbeTask {
                task_id: "t1".to_string(),
                target_ip: "127.0.0.1".to_string(),
            }])
            .unwrap();
        artifacts.save_domain_mappings(vec![]).unwrap();

        let executor = ProbeExecutor::new("10.0.0.1".to_string(), port, 80);
        let results = executor.collect_region_probes(&artifacts).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].region, "us");
        assert_eq!(results[0].ip_probes.len(), 1);
        assert!(results[0].ip_probes[0].tcp_delay >= 0);
    }

    #[tokio::test]
    async fn origin_mappings_probe_under_own_region() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = NodeArtifacts::open(dir.path()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        artifacts
            .save_node_list(NodeList {
                nodes: vec![NodeInfo {
                    ip: "10.0.0.1".to_string(),
                    region: "eu".to_string(),
                }],
            })
            .unwrap();
        artifacts.save_probe_tasks(vec![]).unwrap();
        artifacts
            .save_domain_mappings(vec![DomainIpMapping {
                domain: "example.com".to_string(),
                ip: "127.0.0.1".to_string(),
            }])
            .unwrap();

        let executor = ProbeExecutor::new("10.0.0.1".to_string(), 50051, port);
        let results = executor.collect_region_probes(&artifacts).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].region, "eu");
        assert_eq!(results[0].ip_probes[0].target_ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn sweep_without_node_list_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = NodeArtifacts::open(dir.path()).unwrap();
        let executor = ProbeExecutor::new("10.0.0.1".to_string(), 50051, 80);
        assert!(executor.collect_region_probes(&artifacts).await.is_empty());
    }

    #[test]
    fn aggregation_compresses_an_outlier_bundle() {
        let probes: Vec<ProbeResult> = [10, 11, 10, 9, 200, 10, 11]
            .iter()
            .enumerate()
            .map(|(i, &d)| ProbeResult {
                target_ip: format!("10.0.0.{i}"),
                tcp_delay: d,
            })
            .collect();

        let compressed = aggregate_region_probes(&probes);
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].target_ip, "normal_avg");
        assert_eq!(compressed[0].tcp_delay, 10);
        assert_eq!(compressed[1].target_ip, "10.0.0.4");
        assert_eq!(compressed[1].tcp_delay, 200);
    }

    #[test]
    fn aggregation_passes_small_or_clean_bundles_through() {
        let small: Vec<ProbeResult> = (0..3)
            .map(|i| ProbeResult {
                target_ip: format!("10.0.0.{i}"),
                tcp_delay: 10,
            })
            .collect();
        assert_eq!(aggregate_region_probes(&small), small);

        let clean: Vec<ProbeResult> = (0..8)
            .map(|i| ProbeResult {
                target_ip: format!("10.0.0.{i}"),
                tcp_delay: 10,
            })
            .collect();
        assert_eq!(aggregate_region_probes(&clean), clean);
    }
}
