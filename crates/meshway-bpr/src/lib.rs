//! meshway-bpr — drift-plus-penalty last-mile scheduling.
//!
//! Given a region's live CPU/core state and a request-rate increment, the
//! scheduler allocates requests to backends so as to minimize a Lyapunov
//! drift-plus-penalty sum: the drift term prices CPU-overload queue growth,
//! the penalty term prices measured delay. Per-node virtual queues persist
//! across runs, so sustained overload keeps steering new load away.
//!
//! A ticker runs the algorithm per (domain, region); the latest result per
//! domain is cached behind a read-write lock and served to the dynamic
//! route publisher.

pub mod algorithm;
pub mod cache;
pub mod error;
pub mod model;
pub mod scheduler;

pub use algorithm::{run_bpr, BprNode, BprParams};
pub use cache::BprResultCache;
pub use error::{BprError, BprResult};
pub use scheduler::BprScheduler;
