//! Finish node: terminal. Persists the final snapshot and summarizes
//! the session's artifacts.

use crate::context::GraphContext;
use crate::error::EngineResult;
use crate::state::{GraphState, RunStatus};

pub async fn run(ctx: &GraphContext, state: &mut GraphState) -> EngineResult<()> {
    debug_assert!(state.is_terminal(), "finish reached with working status");
    if !state.is_terminal() {
        state.fail("Finish reached without terminal status");
    }

    let modified = state.modified_paths();
    let summary = match state.status {
        RunStatus::Success => format!(
            "session succeeded after {} iteration(s); {} file(s) modified",
            state.iteration + 1,
            modified.len()
        ),
        _ => format!(
            "session failed: {} (iteration {})",
            state.failure_reason.as_deref().unwrap_or("unknown"),
            state.iteration
        ),
    };
    ctx.log(summary);
    if !modified.is_empty() {
        ctx.log(format!("modified: {}", modified.join(", ")));
    }

    ctx.persist_state(state).await?;
    Ok(())
}
