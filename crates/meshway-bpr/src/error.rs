//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during last-mile scheduling.
#[derive(Debug, Error)]
pub enum BprError {
    #[error("state store error: {0}")]
    State(#[from] meshway_state::StateError),

    #[error("no scheduler configuration for domain: {0}")]
    DomainNotConfigured(String),
}

pub type BprResult<T> = Result<T, BprError>;
