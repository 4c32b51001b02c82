//! Forwarding error types.

use thiserror::Error;

/// Errors crossing the forwarding plane.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("malformed frame: {0}")]
    Frame(#[from] meshway_frame::FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http parse error: {0}")]
    HttpParse(String),

    #[error("origin request failed: {0}")]
    Origin(#[from] reqwest::Error),

    #[error("no path available")]
    NoPath,

    #[error("request queue full")]
    QueueFull,

    #[error("peer send failed: {0}")]
    PeerSend(String),

    #[error("unknown request state: {0}")]
    UnknownRequest(u32),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("response wait timed out")]
    ResponseTimeout,
}

pub type ForwardResult<T> = Result<T, ForwardError>;
