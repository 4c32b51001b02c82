//! Content-addressed configuration artifacts.
//!
//! The control plane maintains three artifacts — the node list, the
//! per-node probe-task lists, and the domain→origin mappings — persisted
//! as JSON under the data directory and addressed by sha256 hash. Nodes
//! send their current hashes on every sync and receive only the artifacts
//! that changed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::HeartbeatResult;
use crate::proto::{DomainIpMapping, NodeList, ProbeTask};

/// Hex sha256 of a serialized artifact.
pub fn artifact_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Stable identifier for a probe task.
pub fn task_id(source_ip: &str, target_ip: &str) -> String {
    let digest = artifact_hash(format!("{source_ip}\u{2192}{target_ip}").as_bytes());
    digest[..16].to_string()
}

#[derive(Default)]
struct ServerArtifacts {
    node_list: Option<NodeList>,
    node_list_hash: String,
    tasks_by_node: HashMap<String, Vec<ProbeTask>>,
    task_hashes: HashMap<String, String>,
    domain_mappings: Vec<DomainIpMapping>,
    domain_mappings_hash: String,
}

/// Control-plane artifact store: one writer (the task generator), many
/// readers (sync handlers).
pub struct ArtifactStore {
    data_dir: PathBuf,
    inner: RwLock<ServerArtifacts>,
}

impl ArtifactStore {
    /// Open the store, loading any artifacts a previous run left behind.
    pub fn open(data_dir: &Path) -> HeartbeatResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let store = Self {
            data_dir: data_dir.to_path_buf(),
            inner: RwLock::new(ServerArtifacts::default()),
        };
        store.load_existing();
        Ok(store)
    }

    fn load_existing(&self) {
        let mut inner = self.inner.write().expect("artifact lock poisoned");
        if let Ok(bytes) = std::fs::read(self.data_dir.join("node_list.json")) {
            match serde_json::from_slice::<NodeList>(&bytes) {
                Ok(list) => {
                    inner.node_list_hash = artifact_hash(&bytes);
                    inner.node_list = Some(list);
                }
                Err(e) => warn!(error = %e, "stale node_list.json ignored"),
            }
        }
        if let Ok(bytes) = std::fs::read(self.data_dir.join("probe_tasks.json")) {
            match serde_json::from_slice::<HashMap<String, Vec<ProbeTask>>>(&bytes) {
                Ok(tasks) => {
                    inner.task_hashes = tasks
                        .iter()
                        .map(|(ip, list)| (ip.clone(), hash_tasks(list)))
                        .collect();
                    inner.tasks_by_node = tasks;
                }
                Err(e) => warn!(error = %e, "stale probe_tasks.json ignored"),
            }
        }
        if let Ok(bytes) = std::fs::read(self.data_dir.join("domain_ip_mappings.json")) {
            match serde_json::from_slice::<Vec<DomainIpMapping>>(&bytes) {
                Ok(mappings) => {
                    inner.domain_mappings_hash = artifact_hash(&bytes);
                    inner.domain_mappings = mappings;
                }
                Err(e) => warn!(error = %e, "stale domain_ip_mappings.json ignored"),
            }
        }
    }

    /// Replace the node list artifact.
    pub fn save_node_list(&self, list: NodeList) -> HeartbeatResult<()> {
        let bytes = serde_json::to_vec_pretty(&list)?;
        std::fs::write(self.data_dir.join("node_list.json"), &bytes)?;
        let mut inner = self.inner.write().expect("artifact lock poisoned");
        inner.node_list_hash = artifact_hash(&bytes);
        inner.node_list = Some(list);
        debug!(hash = %inner.node_list_hash, "node list artifact saved");
        Ok(())
    }

    /// Replace the probe-task list of one source node.
    pub fn save_node_tasks(&self, source_ip: &str, tasks: Vec<ProbeTask>) -> HeartbeatResult<()> {
        let mut inner = self.inner.write().expect("artifact lock poisoned");
        inner
            .task_hashes
            .insert(source_ip.to_string(), hash_tasks(&tasks));
        inner.tasks_by_node.insert(source_ip.to_string(), tasks);
        let bytes = serde_json::to_vec_pretty(&inner.tasks_by_node)?;
        std::fs::write(self.data_dir.join("probe_tasks.json"), &bytes)?;
        Ok(())
    }

    /// Replace the domain→origin mapping artifact.
    pub fn save_domain_mappings(&self, mappings: Vec<DomainIpMapping>) -> HeartbeatResult<()> {
        let bytes = serde_json::to_vec_pretty(&mappings)?;
        std::fs::write(self.data_dir.join("domain_ip_mappings.json"), &bytes)?;
        let mut inner = self.inner.write().expect("artifact lock poisoned");
        inner.domain_mappings_hash = artifact_hash(&bytes);
        inner.domain_mappings = mappings;
        Ok(())
    }

    pub fn node_list(&self) -> Option<NodeList> {
        self.inner
            .read()
            .expect("artifact lock poisoned")
            .node_list
            .clone()
    }

    pub fn node_list_hash(&self) -> String {
        self.inner
            .read()
            .expect("artifact lock poisoned")
            .node_list_hash
            .clone()
    }

    pub fn node_tasks(&self, source_ip: &str) -> Vec<ProbeTask> {
        self.inner
            .read()
            .expect("artifact lock poisoned")
            .tasks_by_node
            .get(source_ip)
            .cloned()
            .unwrap_or_default()
    }

    pub fn node_tasks_hash(&self, source_ip: &str) -> String {
        self.inner
            .read()
            .expect("artifact lock poisoned")
            .task_hashes
            .get(source_ip)
            .cloned()
            .unwrap_or_default()
    }

    pub fn domain_mappings(&self) -> Vec<DomainIpMapping> {
        self.inner
            .read()
            .expect("artifact lock poisoned")
            .domain_mappings
            .clone()
    }

    pub fn domain_mappings_hash(&self) -> String {
        self.inner
            .read()
            .expect("artifact lock poisoned")
            .domain_mappings_hash
            .clone()
    }
}

fn hash_tasks(tasks: &[ProbeTask]) -> String {
    let bytes = serde_json::to_vec(tasks).unwrap_or_default();
    artifact_hash(&bytes)
}

#[derive(Default)]
struct NodeArtifactsInner {
    node_list: Option<NodeList>,
    node_list_hash: String,
    probe_tasks: Vec<ProbeTask>,
    probe_tasks_hash: String,
    domain_mappings: Vec<DomainIpMapping>,
    domain_mappings_hash: String,
}

/// Data-plane artifact cache: the node's local copy of the three
/// artifacts, hashed for diff-based sync.
pub struct NodeArtifacts {
    data_dir: PathBuf,
    inner: RwLock<NodeArtifactsInner>,
}

impl NodeArtifacts {
    pub fn open(data_dir: &Path) -> HeartbeatResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let store = Self {
            data_dir: data_dir.to_path_buf(),
            inner: RwLock::new(NodeArtifactsInner::default()),
        };
        store.load_existing();
        Ok(store)
    }

    fn load_existing(&self) {
        let mut inner = self.inner.write().expect("artifact lock poisoned");
        if let Ok(bytes) = std::fs::read(self.data_dir.join("node_list.json")) {
            if let Ok(list) = serde_json::from_slice::<NodeList>(&bytes) {
                inner.node_list_hash = artifact_hash(&bytes);
                inner.node_list = Some(list);
            }
        }
        if let Ok(bytes) = std::fs::read(self.data_dir.join("probe_tasks.json")) {
            if let Ok(tasks) = serde_json::from_slice::<Vec<ProbeTask>>(&bytes) {
                inner.probe_tasks_hash = artifact_hash(&bytes);
                inner.probe_tasks = tasks;
            }
        }
        if let Ok(bytes) = std::fs::read(self.data_dir.join("domain_ip_mappings.json")) {
            if let Ok(mappings) = serde_json::from_slice::<Vec<DomainIpMapping>>(&bytes) {
                inner.domain_mappings_hash = artifact_hash(&bytes);
                inner.domain_mappings = mappings;
            }
        }
    }

    pub fn save_node_list(&self, list: NodeList) -> HeartbeatResult<()> {
        let bytes = serde_json::to_vec_pretty(&list)?;
        std::fs::write(self.data_dir.join("node_list.json"), &bytes)?;
        let mut inner = self.inner.write().expect("artifact lock poisoned");
        inner.node_list_hash = artifact_hash(&bytes);
        inner.node_list = Some(list);
        Ok(())
    }

    pub fn save_probe_tasks(&self, tasks: Vec<ProbeTask>) -> HeartbeatResult<()> {
        let bytes = serde_json::to_vec_pretty(&tasks)?;
        std::fs::write(self.data_dir.join("probe_tasks.json"), &bytes)?;
        let mut inner = self.inner.write().expect("artifact lock poisoned");
        inner.probe_tasks_hash = artifact_hash(&bytes);
        inner.probe_tasks = tasks;
        Ok(())
    }

    pub fn save_domain_mappings(&self, mappings: Vec<DomainIpMapping>) -> HeartbeatResult<()> {
        let bytes = serde_json::to_vec_pretty(&mappings)?;
        std::fs::write(self.data_dir.join("domain_ip_mappings.json"), &bytes)?;
        let mut inner = self.inner.write().expect("artifact lock poisoned");
        inner.domain_mappings_hash = artifact_hash(&bytes);
        inner.domain_mappings = mappings;
        Ok(())
    }

    pub fn node_list(&self) -> Option<NodeList> {
        self.inner
            .read()
            .expect("artifact lock poisoned")
            .node_list
            .clone()
    }

    pub fn probe_tasks(&self) -> Vec<ProbeTask> {
        self.inner
            .read()
            .expect("artifact lock poisoned")
            .probe_tasks
            .clone()
    }

    pub fn domain_mappings(&self) -> Vec<DomainIpMapping> {
        self.inner
            .read()
            .expect("artifact lock poisoned")
            .domain_mappings
            .clone()
    }

    /// Current artifact hashes (node list, probe tasks, domain mappings),
    /// empty strings before the first sync.
    pub fn hashes(&self) -> (String, String, String) {
        let inner = self.inner.read().expect("artifact lock poisoned");
        (
            inner.node_list_hash.clone(),
            inner.probe_tasks_hash.clone(),
            inner.domain_mappings_hash.clone(),
        )
    }

    /// Whether all three artifacts have been received at least once.
    pub fn is_initialized(&self) -> bool {
        let inner = self.inner.read().expect("artifact lock poisoned");
        inner.node_list.is_some()
            && !inner.probe_tasks_hash.is_empty()
            && !inner.domain_mappings_hash.is_empty()
    }
}
