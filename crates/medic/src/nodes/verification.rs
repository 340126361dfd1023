//! Verification node: run the reproduction command and either finish
//! the session or loop back to analysis with fresh feedback. The loop
//! detector and both reliability layers hook in here.

use medic_sandbox::{ExecOptions, ResourceHealth, ResourceMonitor};
use serde_json::json;

use crate::context::{GraphContext, REPRODUCTION_TIMEOUT};
use crate::error::EngineError;
use crate::dag;
use crate::error::EngineResult;
use crate::loopdetect::LoopStateSnapshot;
use crate::nodes::error_fingerprint;
use crate::recovery::RecoveryContext;
use crate::reproduce::FailureContext;
use crate::state::{GraphState, NodeKind};
use crate::telemetry::{LAYER_LOOP_DETECTION, LAYER_REPRODUCTION};

pub async fn run(ctx: &GraphContext, state: &mut GraphState) -> EngineResult<()> {
    // Over-critical sandboxes abort before burning another run.
    let monitor = ResourceMonitor::new(state.config.resource_thresholds);
    if let Ok(Some(ResourceHealth::Critical(dims))) =
        monitor.check(ctx.sandbox.as_ref()).await
    {
        return Err(EngineError::ResourceExhausted(dims.join(", ")));
    }

    let Some(command) = resolve_reproduction_command(ctx, state).await? else {
        state.fail("Reproduction command unavailable");
        return Ok(());
    };

    ctx.log(format!("verifying with: {command}"));
    let output = ctx
        .run_sandbox(&command, &ExecOptions::with_timeout(REPRODUCTION_TIMEOUT))
        .await?;
    let passed = output.success();
    state.record(
        NodeKind::Verification,
        "reproduction",
        &format!("exit {}", output.exit_code),
    );

    let category = state
        .classification
        .as_ref()
        .map_or("unknown", |c| c.category.as_str())
        .to_string();
    let complexity = state.problem_complexity.unwrap_or(5);

    if passed {
        // With a DAG in play, one green run solves only the active
        // sub-problem; the session succeeds when the DAG drains.
        if let Some(error_dag) = state.error_dag.clone() {
            if let Some(active) = dag::next_executable_node(&error_dag, &state.solved_nodes) {
                let active_id = active.id.clone();
                state.solved_nodes.push(active_id.clone());
                ctx.log(format!(
                    "sub-problem {active_id} solved ({:.0}% of DAG)",
                    dag::progress(&error_dag, &state.solved_nodes) * 100.0
                ));
            }
            if !dag::is_complete(&error_dag, &state.solved_nodes) {
                return advance_iteration(ctx, state, &output.combined(), true).await;
            }
        }

        ctx.reflection.record_success(
            &category,
            state
                .diagnosis
                .as_ref()
                .map_or("", |d| d.summary.as_str()),
            complexity,
        );
        state.succeed();
        return Ok(());
    }

    let combined = output.combined();
    let excerpt = tail(&combined, 600);
    state
        .feedback
        .push(format!("Test Suite Failed: {excerpt}"));
    ctx.reflection.record_failure(
        &category,
        &error_fingerprint(&combined),
        state
            .diagnosis
            .as_ref()
            .map_or("", |d| d.summary.as_str()),
        excerpt,
        complexity,
    );

    // Loop-detection hook: fingerprint this iteration before looping.
    let snapshot = LoopStateSnapshot::new(
        state.iteration,
        state.modified_paths(),
        state.modified_content_checksum(),
        error_fingerprint(&combined),
    );
    let detection = ctx.loop_detector.detect_loop(&snapshot);
    if detection.detected {
        let threshold = ctx.thresholds.threshold_for(LAYER_LOOP_DETECTION).await;
        let event_id = ctx
            .telemetry
            .record_strategy_loop_detected(
                json!({
                    "run_id": ctx.run_id,
                    "iteration": state.iteration,
                    "duplicate_of": detection.duplicate_of_iteration,
                }),
                threshold,
            )
            .await?;

        let outcome = ctx
            .recovery
            .attempt_recovery(
                &RecoveryContext {
                    layer: LAYER_LOOP_DETECTION,
                    run_id: &ctx.run_id,
                    missing_command: false,
                    sandbox: Some(ctx.sandbox.as_ref()),
                    failure: FailureContext::default(),
                    loop_detector: Some(&ctx.loop_detector),
                },
                event_id,
            )
            .await?;

        if outcome.successful {
            state.feedback.push(outcome.notes);
        } else {
            state.fail("Strategy loop");
            return Ok(());
        }
    }

    advance_iteration(ctx, state, &combined, false).await
}

/// The reproduction command from the diagnosis, or whatever phase-2
/// recovery can infer.
async fn resolve_reproduction_command(
    ctx: &GraphContext,
    state: &mut GraphState,
) -> EngineResult<Option<String>> {
    if let Some(command) = state
        .diagnosis
        .as_ref()
        .and_then(|d| d.reproduction_command.clone())
    {
        return Ok(Some(command));
    }

    let threshold = ctx.thresholds.threshold_for(LAYER_REPRODUCTION).await;
    let event_id = ctx
        .telemetry
        .record_reproduction_required(
            json!({ "run_id": ctx.run_id, "iteration": state.iteration }),
            threshold,
        )
        .await?;

    let outcome = ctx
        .recovery
        .attempt_recovery(
            &RecoveryContext {
                layer: LAYER_REPRODUCTION,
                run_id: &ctx.run_id,
                missing_command: true,
                sandbox: Some(ctx.sandbox.as_ref()),
                failure: FailureContext {
                    workflow_yaml: None,
                    log_text: Some(state.current_log_text.clone()),
                },
                loop_detector: Some(&ctx.loop_detector),
            },
            event_id,
        )
        .await?;

    if let Some(command) = outcome.recovered_command {
        if let Some(diagnosis) = state.diagnosis.as_mut() {
            diagnosis.reproduction_command = Some(command.clone());
        }
        return Ok(Some(command));
    }
    Ok(None)
}

/// Close out this iteration and route back to analysis, or terminate on
/// the iteration cap. `dag_advance` marks loops that continue after a
/// solved sub-problem rather than a failure.
async fn advance_iteration(
    ctx: &GraphContext,
    state: &mut GraphState,
    latest_output: &str,
    dag_advance: bool,
) -> EngineResult<()> {
    state.iteration += 1;
    if state.iteration >= state.max_iterations {
        // The budget bounds DAG advances too; a half-solved DAG at the
        // cap is still a failed session.
        if dag_advance {
            state.fail("Max iterations exceeded before DAG completion");
        } else {
            state.fail("Max iterations exceeded");
        }
        return Ok(());
    }

    // The freshest failure output is the next pass's log.
    state.current_log_text = latest_output.to_string();
    state.plan = None;
    state.current_node = NodeKind::Analysis;
    ctx.log(format!(
        "iteration {} of {} begins",
        state.iteration + 1,
        state.max_iterations
    ));
    Ok(())
}

fn tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
