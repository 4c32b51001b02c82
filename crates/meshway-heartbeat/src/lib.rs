//! meshway-heartbeat — control-plane ↔ data-plane heartbeat protocol.
//!
//! Provides the gRPC services and client for node registration, periodic
//! metric/probe sync with hash-diffed artifact distribution, server-push
//! configuration, and fault reporting.
//!
//! # Architecture
//!
//! ```text
//! Control plane
//!   ├── HeartbeatServer (gRPC)
//!   │   ├── InitDataPlane() → store metrics, arm buffer-period timer
//!   │   ├── SyncMetrics()   → store metrics + probes, diff artifact
//!   │   │                     hashes, piggyback assessment snapshot
//!   │   └── ReportFault()   → acknowledge node fault reports
//!   ├── TaskGenerator   — node list, per-node probe tasks, domain mappings
//!   ├── ConfigPusher    — best-effort bounded push to all nodes
//!   └── ArtifactStore   — content-addressed artifacts (sha256 hashes)
//!
//! Data-plane node
//!   ├── HeartbeatClient — init + sync with bounded dial retries
//!   ├── NodeArtifacts   — local artifact cache with hashes
//!   └── NodeConfigService — receives server-initiated pushes
//! ```

pub mod artifact;
pub mod client;
pub mod convert;
pub mod error;
pub mod pusher;
pub mod server;
pub mod tasks;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("meshway.heartbeat");
}

pub use artifact::{ArtifactStore, NodeArtifacts};
pub use client::{HeartbeatClient, NodeConfigService};
pub use error::{HeartbeatError, HeartbeatResult};
pub use pusher::ConfigPusher;
pub use server::{HeartbeatServer, ServerConfig};
pub use tasks::TaskGenerator;
