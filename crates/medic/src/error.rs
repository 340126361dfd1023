//! Engine error taxonomy.
//!
//! Inside a node, recoverable errors become feedback strings and the
//! iteration continues; unrecoverable ones set the session to `failed`
//! with a human-readable reason. The taxonomy below is what crosses
//! component boundaries.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the repair engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] medic_config::ConfigError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("deadline exceeded after {0:?}")]
    Timeout(Duration),

    #[error("sandbox resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("hallucinated path: {0}")]
    Hallucination(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("admission queue saturated")]
    Overloaded,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Store(#[from] medic_store::StoreError),
}

impl EngineError {
    /// Errors a node may translate into feedback and continue from.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Timeout(_)
                | Self::CommandNotFound(_)
                | Self::Hallucination(_)
                | Self::Validation(_)
        )
    }
}

impl From<medic_sandbox::SandboxError> for EngineError {
    fn from(err: medic_sandbox::SandboxError) -> Self {
        use medic_sandbox::SandboxError as S;
        match err {
            S::Timeout(d) => Self::Timeout(d),
            S::CommandNotFound { command } => Self::CommandNotFound(command),
            S::ResourceExhausted(msg) => Self::ResourceExhausted(msg),
            S::NotInitialized => Self::Transport("sandbox not initialized".into()),
            S::Transport(msg) | S::Io(msg) => Self::Transport(msg),
        }
    }
}

impl From<medic_llm::LlmError> for EngineError {
    fn from(err: medic_llm::LlmError) -> Self {
        use medic_llm::LlmError as L;
        match err {
            L::Timeout(d) => Self::Timeout(d),
            L::Validation(msg) => Self::Validation(msg),
            L::Client { status, message } => Self::Client(format!("HTTP {status}: {message}")),
            L::NotConfigured(msg) => Self::Client(msg),
            L::Transport(msg) => Self::Transport(msg),
            L::RateLimited { status } => Self::Transport(format!("rate limited (HTTP {status})")),
            L::Server { status, message } => {
                Self::Transport(format!("HTTP {status}: {message}"))
            }
        }
    }
}

impl From<medic_scm::ScmError> for EngineError {
    fn from(err: medic_scm::ScmError) -> Self {
        use medic_scm::ScmError as H;
        match err {
            H::NotFound(msg) => Self::Client(format!("not found: {msg}")),
            H::NoFailedJob { run_id } => Self::Client(format!("no failed job in run {run_id}")),
            H::Transport(msg) => Self::Transport(msg),
            H::Api { status, message } => {
                if (400..500).contains(&status) {
                    Self::Client(format!("HTTP {status}: {message}"))
                } else {
                    Self::Transport(format!("HTTP {status}: {message}"))
                }
            }
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use medic_sandbox::SandboxError;

    #[test]
    fn test_sandbox_error_mapping() {
        let err: EngineError = SandboxError::Timeout(Duration::from_secs(30)).into();
        assert!(matches!(err, EngineError::Timeout(_)));

        let err: EngineError = SandboxError::CommandNotFound {
            command: "pytest".into(),
        }
        .into();
        assert!(matches!(err, EngineError::CommandNotFound(_)));
    }

    #[test]
    fn test_recoverability() {
        assert!(EngineError::Validation("bad json".into()).is_recoverable());
        assert!(EngineError::Transport("reset".into()).is_recoverable());
        assert!(!EngineError::Cancelled.is_recoverable());
        assert!(!EngineError::Overloaded.is_recoverable());
        assert!(!EngineError::ResourceExhausted("cpu".into()).is_recoverable());
    }

    #[test]
    fn test_scm_status_split() {
        let client: EngineError = medic_scm::ScmError::Api {
            status: 404,
            message: "missing".into(),
        }
        .into();
        assert!(matches!(client, EngineError::Client(_)));

        let server: EngineError = medic_scm::ScmError::Api {
            status: 502,
            message: "bad gateway".into(),
        }
        .into();
        assert!(matches!(server, EngineError::Transport(_)));
    }
}
