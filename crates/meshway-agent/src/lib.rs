//! meshway-agent — data-plane control loop.
//!
//! Each forwarding node runs one agent: it registers with the control
//! plane, reports system metrics and TCP-probe results every sync
//! interval, pulls changed configuration artifacts by hash, and rebuilds
//! its local topology and path set whenever a fresh assessment snapshot
//! arrives.

pub mod collector;
pub mod error;
pub mod probe;
pub mod sync;

pub use collector::MetricsCollector;
pub use error::{AgentError, AgentResult};
pub use probe::ProbeExecutor;
pub use sync::{DataPlane, DataPlaneConfig};
