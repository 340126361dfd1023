//! Recovery strategy service.
//!
//! Maps a triggered defense layer to a concrete recovery: the
//! reproduction layer tries command inference, the loop-detection layer
//! tries a strategy shift, and requesting a human is the always
//! available last resort. Outcomes are written back onto the telemetry
//! event that triggered the attempt.

use medic_sandbox::Sandbox;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::loopdetect::LoopDetector;
use crate::reproduce::{FailureContext, ReproductionInference};
use crate::telemetry::{ReliabilityTelemetry, LAYER_LOOP_DETECTION, LAYER_REPRODUCTION};

/// The strategies the service can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    InferCommand,
    ShiftStrategy,
    RequestHuman,
}

impl RecoveryStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InferCommand => "infer-command",
            Self::ShiftStrategy => "shift-strategy",
            Self::RequestHuman => "request-human",
        }
    }
}

/// What a recovery attempt produced.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub strategy: RecoveryStrategy,
    pub successful: bool,
    pub notes: String,
    /// Populated when `InferCommand` succeeds.
    pub recovered_command: Option<String>,
}

/// Everything a recovery attempt may need.
pub struct RecoveryContext<'a> {
    pub layer: &'a str,
    pub run_id: &'a str,
    /// True when the session has no reproduction command.
    pub missing_command: bool,
    pub sandbox: Option<&'a dyn Sandbox>,
    pub failure: FailureContext,
    pub loop_detector: Option<&'a LoopDetector>,
}

/// Strategy selection and execution.
#[derive(Clone)]
pub struct RecoveryStrategyService {
    telemetry: ReliabilityTelemetry,
    inference: Arc<ReproductionInference>,
}

impl RecoveryStrategyService {
    #[must_use]
    pub fn new(telemetry: ReliabilityTelemetry, inference: Arc<ReproductionInference>) -> Self {
        Self {
            telemetry,
            inference,
        }
    }

    /// Attempt recovery for a triggered layer, updating `event_id` with
    /// the result when telemetry produced one.
    pub async fn attempt_recovery(
        &self,
        ctx: &RecoveryContext<'_>,
        event_id: Option<i64>,
    ) -> EngineResult<RecoveryOutcome> {
        let outcome = match ctx.layer {
            LAYER_REPRODUCTION if ctx.missing_command => self.recover_reproduction(ctx).await?,
            LAYER_LOOP_DETECTION => self.recover_loop(ctx),
            _ => RecoveryOutcome {
                strategy: RecoveryStrategy::RequestHuman,
                successful: false,
                notes: format!("no automated recovery for layer '{}'", ctx.layer),
                recovered_command: None,
            },
        };

        if let Some(event_id) = event_id {
            self.record_outcome(event_id, &outcome).await?;
        }

        tracing::info!(
            run_id = %ctx.run_id,
            layer = %ctx.layer,
            strategy = outcome.strategy.as_str(),
            successful = outcome.successful,
            "recovery attempted"
        );
        Ok(outcome)
    }

    async fn recover_reproduction(
        &self,
        ctx: &RecoveryContext<'_>,
    ) -> EngineResult<RecoveryOutcome> {
        match self.inference.infer(ctx.sandbox, &ctx.failure).await? {
            Some(inferred) => Ok(RecoveryOutcome {
                strategy: RecoveryStrategy::InferCommand,
                successful: true,
                notes: format!(
                    "inferred '{}' via {} ({:.2})",
                    inferred.command,
                    inferred.strategy.as_str(),
                    inferred.confidence
                ),
                recovered_command: Some(inferred.command),
            }),
            None => Ok(RecoveryOutcome {
                strategy: RecoveryStrategy::InferCommand,
                successful: false,
                notes: "no reproduction command could be inferred".to_string(),
                recovered_command: None,
            }),
        }
    }

    fn recover_loop(&self, ctx: &RecoveryContext<'_>) -> RecoveryOutcome {
        // One shift per session; a second duplicate means the shift did
        // not help and a human should look.
        let shift_available = ctx
            .loop_detector
            .is_some_and(|detector| detector.shifts_triggered() == 0);

        if shift_available {
            let advisory = ctx
                .loop_detector
                .map(|d| d.trigger_automated_recovery("(loop)"))
                .unwrap_or_default();
            RecoveryOutcome {
                strategy: RecoveryStrategy::ShiftStrategy,
                successful: true,
                notes: advisory,
                recovered_command: None,
            }
        } else {
            RecoveryOutcome {
                strategy: RecoveryStrategy::RequestHuman,
                successful: false,
                notes: "strategy shift already spent; requesting human review".to_string(),
                recovered_command: None,
            }
        }
    }

    async fn record_outcome(&self, event_id: i64, outcome: &RecoveryOutcome) -> EngineResult<()> {
        if outcome.strategy == RecoveryStrategy::RequestHuman {
            self.telemetry.mark_human_requested(event_id).await
        } else {
            self.telemetry
                .update_recovery_outcome(event_id, outcome.strategy.as_str(), outcome.successful)
                .await
        }
    }
}
