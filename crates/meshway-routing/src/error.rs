//! Routing error types.

use thiserror::Error;

/// Errors that can occur while building topology or computing paths.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("topology is empty")]
    EmptyTopology,
}

pub type RoutingResult<T> = Result<T, RoutingError>;
