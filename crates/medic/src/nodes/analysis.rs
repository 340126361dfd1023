//! Analysis node: populate the failure log, classify, diagnose, and
//! estimate complexity before handing off to planning.

use medic_sandbox::ExecOptions;
use medic_scm::LogStrategy;
use medic_store::{FactNotes, NewErrorFact};

use crate::ai;
use crate::classify;
use crate::context::GraphContext;
use crate::dag;
use crate::error::EngineResult;
use crate::runbook;
use crate::state::{FixAction, GraphState, NodeKind};
use crate::telemetry::LAYER_COMPLEXITY;

pub async fn run(ctx: &GraphContext, state: &mut GraphState) -> EngineResult<()> {
    // 1. Make sure we have a failure log, walking the per-iteration
    //    fetch-strategy ladder when the state arrived empty.
    if state.current_log_text.trim().is_empty() {
        let Some(strategy) = LogStrategy::for_iteration(state.iteration) else {
            state.fail("No failed job found");
            return Ok(());
        };
        let Some(run_id) = state.group.main_run() else {
            state.fail("No failed job found");
            return Ok(());
        };

        match ctx.services.host.get_workflow_logs(run_id, strategy).await {
            Ok(logs) => {
                ctx.log(format!(
                    "fetched logs for run {run_id} (job {:?}, {} bytes)",
                    logs.job_name,
                    logs.log_text.len()
                ));
                state.current_log_text = logs.log_text;
            }
            Err(e) => {
                tracing::warn!(run_id, error = %e, "log fetch failed");
                state.fail("No failed job found");
                return Ok(());
            }
        }
    }
    if state.iteration == 0 && state.initial_log_text.is_empty() {
        state.initial_log_text = state.current_log_text.clone();
    }

    // 2. First pass also builds the repo context summary.
    if state.iteration == 0 && state.initial_repo_context.is_empty() {
        let listing = ctx
            .sandbox
            .run_command("ls -1; echo; find . -maxdepth 2 -type f | head -80", &ExecOptions::default())
            .await
            .map(|o| o.stdout)
            .unwrap_or_default();
        state.initial_repo_context =
            ai::summarize_repo_context(&ctx.services.llm, &listing).await;
    }

    // 3. Classify, folding in what earlier passes concluded.
    let previous_categories: Vec<_> = state
        .classification
        .iter()
        .map(|c| c.category)
        .collect();
    let main_path = state
        .diagnosis
        .as_ref()
        .and_then(|d| d.file_path.clone());
    let classification = classify::classify_with_history(
        &state.current_log_text,
        main_path.as_deref(),
        &previous_categories,
    );
    state.record(
        NodeKind::Analysis,
        "classify",
        classification.category.as_str(),
    );

    // 4. Module-missing failures get a dependency scan, once.
    let mut repo_context = state.initial_repo_context.clone();
    if state.iteration == 0 && classify::is_module_missing(&state.current_log_text) {
        let scan = ctx
            .sandbox
            .run_command(
                "for f in package.json requirements.txt Cargo.toml go.mod; do \
                 [ -f \"$f\" ] && echo \"== $f ==\" && head -40 \"$f\"; done",
                &ExecOptions::default(),
            )
            .await
            .map(|o| o.stdout)
            .unwrap_or_default();
        if !scan.trim().is_empty() {
            repo_context.push_str("\n\nDependency manifests:\n");
            repo_context.push_str(&scan);
        }
    }
    if let Some(pattern) =
        runbook::match_runbook(&state.current_log_text, classification.category)
    {
        repo_context.push_str("\n\nKnown repair pattern: ");
        repo_context.push_str(pattern.template);
    }

    // 5. Diagnose; persist the fact row on the first pass only.
    let diagnosis = ai::diagnose_error(
        &ctx.services.llm,
        &state.current_log_text,
        &repo_context,
        &classification,
        &state.feedback,
    )
    .await?;
    ctx.log(format!(
        "diagnosis: {} ({:?})",
        diagnosis.summary, diagnosis.fix_action
    ));

    // 6. Complexity estimate for this pass.
    let complexity =
        classify::estimate_complexity(&state.current_log_text, classification.category);
    state.complexity_history.push(complexity);
    state.problem_complexity = Some(complexity);

    // 7. Atomicity from the complexity tail.
    let atomic = classify::is_atomic(&state.complexity_history);
    state.is_atomic = Some(atomic);

    if state.iteration == 0 {
        let fact = NewErrorFact {
            run_id: ctx.run_id.clone(),
            summary: diagnosis.summary.clone(),
            file_path: diagnosis.file_path.clone(),
            fix_action: match diagnosis.fix_action {
                FixAction::Edit => "edit".to_string(),
                FixAction::Command => "command".to_string(),
            },
            notes: FactNotes {
                complexity: Some(complexity),
                is_atomic: Some(atomic),
                classification_category: Some(classification.category.as_str().to_string()),
            },
        };
        if let Err(e) = ctx.services.store.insert_fact(&fact).await {
            tracing::warn!(error = %e, "error fact write failed");
        }

        // Same fingerprint seen in earlier sessions means the obvious
        // fix already failed once; say so up front.
        match ctx
            .services
            .store
            .facts_matching_summary(&diagnosis.summary, 5)
            .await
        {
            Ok(previous) if previous.len() > 1 => {
                state.feedback.push(format!(
                    "This failure was attempted in {} earlier sessions; try a different angle",
                    previous.len() - 1
                ));
            }
            _ => {}
        }
    }

    // Refinement folds feedback into the problem statement.
    if !state.feedback.is_empty() {
        state.refined_problem_statement = Some(
            ai::refine_problem_statement(
                &ctx.services.llm,
                &diagnosis,
                &state.feedback,
                state.refined_problem_statement.as_deref(),
            )
            .await,
        );
    }

    // Composite problems decompose into the error DAG; the active
    // sub-problem then drives planning. The gate tracks the adaptive
    // phase-3 complexity threshold.
    let complexity_threshold = ctx.thresholds.threshold_for(LAYER_COMPLEXITY).await;
    if f64::from(complexity) >= complexity_threshold && !atomic && state.error_dag.is_none() {
        state.error_dag =
            ai::build_error_dag(&ctx.services.llm, &diagnosis, &state.current_log_text).await;
        if let Some(dag) = &state.error_dag {
            ctx.log(format!(
                "decomposed into {} sub-problems",
                dag.nodes.len()
            ));
        }
    }
    let selected_node = state
        .error_dag
        .as_ref()
        .and_then(|dag| dag::next_executable_node(dag, &state.solved_nodes))
        .map(|node| (node.id.clone(), node.problem.clone()));
    if let Some((node_id, node_problem)) = selected_node {
        state.refined_problem_statement = Some(node_problem);
        state.record(NodeKind::Analysis, "dag_select", &node_id);
    }

    state.classification = Some(classification);
    state.diagnosis = Some(diagnosis);
    state.record(NodeKind::Analysis, "complete", &format!("complexity {complexity}"));
    state.current_node = NodeKind::Planning;
    Ok(())
}
