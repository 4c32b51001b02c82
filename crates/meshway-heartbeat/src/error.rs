//! Heartbeat error types.

use thiserror::Error;

/// Errors crossing the heartbeat protocol layers.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("state store error: {0}")]
    State(#[from] meshway_state::StateError),

    #[error("assessment error: {0}")]
    Assess(#[from] meshway_assess::AssessError),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("control plane unreachable after {0} attempts")]
    DialExhausted(usize),
}

pub type HeartbeatResult<T> = Result<T, HeartbeatError>;
