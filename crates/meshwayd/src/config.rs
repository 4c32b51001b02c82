//! meshway.toml configuration parser.
//!
//! The configuration file is the authoritative startup input: every port
//! is explicit here, none is defaulted at a call site. A config that fails
//! to parse is fatal — the process refuses to start.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshwayConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub domain_origins: Vec<DomainOriginEntry>,
    #[serde(default)]
    pub node_regions: Vec<NodeRegionEntry>,
    #[serde(default)]
    pub domain_configurations: Vec<DomainConfigurationEntry>,
    #[serde(default)]
    pub bpr_scheduling_tasks: Vec<BprTaskEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub buffer_period_secs: u64,
    pub task_interval_secs: u64,
    pub assessment_interval_secs: u64,
    /// Port of the node-side config listener pushes go to.
    pub agent_config_port: u16,
    /// Port serving the dynamic-route document and inspection API.
    pub publish_port: u16,
    pub publish_interval_secs: u64,
    /// Access-proxy ingress port the published weights redirect to.
    pub redirect_port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("/var/lib/meshway/artifacts"),
            buffer_period_secs: 20,
            task_interval_secs: 300,
            assessment_interval_secs: 60,
            agent_config_port: 50051,
            publish_port: 8090,
            publish_interval_secs: 5,
            redirect_port: 50055,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// This node's overlay IP.
    pub node_ip: String,
    /// Control-plane heartbeat address (host:port).
    pub control_addr: String,
    pub data_dir: PathBuf,
    pub report_interval_secs: u64,
    /// End-user HTTP ingress.
    pub http_port: u16,
    /// Response ingress on the access side.
    pub access_response_port: u16,
    /// Relay request ingress.
    pub relay_request_port: u16,
    /// Relay response ingress.
    pub relay_response_port: u16,
    /// Origin HTTP port for terminal requests.
    pub origin_port: u16,
    /// Port probed on origin servers.
    pub origin_probe_port: u16,
    pub response_timeout_secs: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            node_ip: "127.0.0.1".to_string(),
            control_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("/var/lib/meshway/agent"),
            report_interval_secs: 5,
            http_port: 50055,
            access_response_port: 50054,
            relay_request_port: 50056,
            relay_response_port: 50057,
            origin_port: 8080,
            origin_probe_port: 80,
            response_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainOriginEntry {
    pub domain: String,
    pub origin_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegionEntry {
    pub ip: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfigurationEntry {
    pub domain: String,
    pub total_req_increment: i64,
    pub redistribution_proportion: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BprTaskEntry {
    pub domain: String,
    pub region: String,
    pub interval_secs: u64,
}

impl MeshwayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MeshwayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for entry in &self.domain_configurations {
            if !(0.0..=1.0).contains(&entry.redistribution_proportion) {
                anyhow::bail!(
                    "domain {}: redistribution_proportion {} outside [0, 1]",
                    entry.domain,
                    entry.redistribution_proportion
                );
            }
            if entry.total_req_increment < 0 {
                anyhow::bail!(
                    "domain {}: total_req_increment must be non-negative",
                    entry.domain
                );
            }
        }
        for task in &self.bpr_scheduling_tasks {
            if task.interval_secs == 0 {
                anyhow::bail!(
                    "bpr task {}/{}: interval_secs must be positive",
                    task.domain,
                    task.region
                );
            }
        }
        Ok(())
    }
}
