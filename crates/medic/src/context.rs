//! Graph context: the handles a node needs.
//!
//! `GraphState` is a plain value; everything with a connection or a
//! lock lives here. Nodes receive `(&GraphContext, &mut GraphState)`
//! and never store context inside state, which keeps snapshots cold
//! -loadable and breaks the state↔service reference cycle.

use medic_llm::LlmClient;
use medic_sandbox::Sandbox;
use medic_scm::SourceHost;
use medic_store::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::loopdetect::LoopDetector;
use crate::recovery::RecoveryStrategyService;
use crate::reflection::ReflectionSystem;
use crate::state::GraphState;
use crate::telemetry::ReliabilityTelemetry;
use crate::thresholds::AdaptiveThresholdService;

/// Default command deadlines.
pub const LINT_TIMEOUT: Duration = Duration::from_secs(30);
pub const REPRODUCTION_TIMEOUT: Duration = Duration::from_secs(120);

/// External capabilities, grouped so tests can swap any of them.
#[derive(Clone)]
pub struct Services {
    pub llm: LlmClient,
    pub host: Arc<dyn SourceHost>,
    pub store: Store,
}

/// Per-session context handed to every node.
pub struct GraphContext {
    pub services: Services,
    pub sandbox: Arc<dyn Sandbox>,
    pub loop_detector: Arc<LoopDetector>,
    pub telemetry: ReliabilityTelemetry,
    pub recovery: RecoveryStrategyService,
    pub thresholds: AdaptiveThresholdService,
    pub reflection: Arc<ReflectionSystem>,
    pub run_id: String,
    pub cancel: CancellationToken,
    /// Optional progress feed for callers watching the session.
    pub log_tx: Option<mpsc::UnboundedSender<String>>,
}

impl GraphContext {
    /// Emit a progress line to the log and any watcher.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(run_id = %self.run_id, "{message}");
        if let Some(tx) = &self.log_tx {
            let _ = tx.send(message);
        }
    }

    /// Persist the current state snapshot. Write errors are absorbed
    /// (the in-memory state stays authoritative) except when the parent
    /// AgentRun row is gone, which is fatal for the session.
    pub async fn persist_state(&self, state: &GraphState) -> EngineResult<()> {
        let snapshot = serde_json::to_string(state)
            .map_err(|e| EngineError::Validation(format!("state snapshot: {e}")))?;

        match self
            .services
            .store
            .update_run(&self.run_id, state.status.as_str(), &snapshot)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound { context }) => {
                Err(EngineError::Store(StoreError::NotFound { context }))
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "state snapshot write failed");
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a sandbox command, racing the session's cancellation token.
    /// Dropping the in-flight future kills the child where the backend
    /// supports it; the rest are bounded by their resource limits.
    pub async fn run_sandbox(
        &self,
        command: &str,
        options: &medic_sandbox::ExecOptions,
    ) -> EngineResult<medic_sandbox::ExecOutput> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(EngineError::Cancelled),
            result = self.sandbox.run_command(command, options) => Ok(result?),
        }
    }
}
