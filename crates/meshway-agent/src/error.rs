//! Agent error types.

use thiserror::Error;

/// Errors surfacing from the data-plane loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("heartbeat error: {0}")]
    Heartbeat(#[from] meshway_heartbeat::HeartbeatError),

    #[error("routing error: {0}")]
    Routing(#[from] meshway_routing::RoutingError),
}

pub type AgentResult<T> = Result<T, AgentError>;
