//! The graph driver: dispatch nodes until the session terminates.
//!
//! Within a session everything is sequential; node transitions give the
//! total order that `history` records. The driver persists a snapshot
//! after every node, enforces cancellation between nodes, and converts
//! unrecoverable node errors into a failed terminal state.

use crate::context::GraphContext;
use crate::error::{EngineError, EngineResult};
use crate::nodes;
use crate::state::{GraphState, NodeKind};

/// Hard ceiling on node dispatches, over and above the iteration
/// budget. A correct session never comes near it.
const MAX_TRANSITIONS: u32 = 256;

/// Run one session to its terminal state.
pub async fn run_session(ctx: &GraphContext, state: &mut GraphState) -> EngineResult<()> {
    let mut transitions = 0u32;

    loop {
        if ctx.is_cancelled() && !state.is_terminal() {
            state.fail("Cancelled");
        }

        transitions += 1;
        if transitions > MAX_TRANSITIONS && !state.is_terminal() {
            state.fail("Node transition budget exhausted");
        }

        let node = state.current_node;
        let result = match node {
            NodeKind::Analysis => nodes::analysis::run(ctx, state).await,
            NodeKind::Planning => nodes::planning::run(ctx, state).await,
            NodeKind::Execution => nodes::execution::run(ctx, state).await,
            NodeKind::Verification => nodes::verification::run(ctx, state).await,
            NodeKind::Finish => {
                let result = nodes::finish::run(ctx, state).await;
                if let Err(e) = result {
                    tracing::error!(run_id = %ctx.run_id, error = %e, "finish node failed");
                }
                return Ok(());
            }
        };

        if let Err(error) = result {
            match error {
                EngineError::Cancelled => state.fail("Cancelled"),
                EngineError::ResourceExhausted(ref detail) => {
                    state.fail(format!("Sandbox resources exhausted: {detail}"));
                }
                ref e if e.is_recoverable() => {
                    // One recoverable slip inside a node becomes
                    // feedback; the iteration burns but the session
                    // lives.
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        node = node.as_str(),
                        error = %e,
                        "recoverable node error"
                    );
                    state
                        .feedback
                        .push(format!("{} node error: {e}", node.as_str()));
                    state.iteration += 1;
                    if state.iteration >= state.max_iterations {
                        state.fail("Max iterations exceeded");
                    } else {
                        state.current_node = NodeKind::Analysis;
                        state.current_log_text.clear();
                    }
                }
                e => state.fail(format!("{} node failed: {e}", node.as_str())),
            }
        }

        if let Err(violation) = state.check_invariants() {
            tracing::error!(run_id = %ctx.run_id, %violation, "state invariant violated");
            debug_assert!(false, "state invariant violated: {violation}");
            if !state.is_terminal() {
                state.fail(format!("Invariant violated: {violation}"));
            }
        }

        // Snapshot after every transition; write failures are absorbed
        // inside persist_state unless the parent row is gone.
        ctx.persist_state(state).await?;
    }
}
