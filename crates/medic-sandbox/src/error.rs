//! Sandbox error types.

use std::time::Duration;
use thiserror::Error;

/// Typed sandbox failures. Callers distinguish transport trouble,
/// missing commands, deadlines, and resource exhaustion; everything the
/// backend cannot classify lands in `Io`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox not initialized")]
    NotInitialized,

    #[error("sandbox transport error: {0}")]
    Transport(String),

    #[error("command not found: {command}")]
    CommandNotFound { command: String },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("sandbox resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("sandbox io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
