//! Assessment error types.

use thiserror::Error;

/// Errors that can occur while computing link assessments.
#[derive(Debug, Error)]
pub enum AssessError {
    #[error("state store error: {0}")]
    State(#[from] meshway_state::StateError),
}

pub type AssessResult<T> = Result<T, AssessError>;
