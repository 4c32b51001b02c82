//! meshway-publish — dynamic routing configuration for the edge router.
//!
//! Periodically snapshots the last-mile scheduler's allocation cache and
//! materializes a routing configuration document: one routing rule and one
//! weighted-redirector middleware per domain, plus a single shared no-op
//! backend. The document is served as JSON on an HTTP poll endpoint so the
//! external edge router can fetch it on its own cadence; read-only
//! inspection routes expose the store and caches alongside it.

pub mod document;
pub mod server;

pub use document::{build_document, DynamicConfig};
pub use server::{publisher_router, PublishState, RoutePublisher};
