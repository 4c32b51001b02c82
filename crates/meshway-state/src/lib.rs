//! meshway-state — embedded state store for the meshway control plane.
//!
//! Backed by [redb](https://docs.rs/redb), holds the node-metrics history,
//! link-probe history, per-link virtual-queue state, node→region and
//! domain→origin tables, per-domain scheduler configuration, and the
//! persistent per-node scheduler backlog.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! History tables use composite keys with zero-padded timestamps
//! (`{ip}:{ts:020}`) so that a prefix scan yields records in time order.
//! Probe results are append-only; everything else is an upsert keyed by its
//! natural identifier.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
