//! Execution node: apply the fix. Command fixes run in the sandbox;
//! edit fixes regenerate each reserved file, lint it, pass it through
//! the judge gate, and persist a FileModification row per write.

use medic_sandbox::ExecOptions;
use medic_store::NewFileModification;

use crate::ai;
use crate::context::{GraphContext, LINT_TIMEOUT};
use crate::error::EngineResult;
use crate::runbook;
use crate::state::{content_hash, FileStatus, FileVersion, FixAction, GraphState, NodeKind};
use crate::telemetry::LAYER_COMPLEXITY;

pub async fn run(ctx: &GraphContext, state: &mut GraphState) -> EngineResult<()> {
    let Some(diagnosis) = state.diagnosis.clone() else {
        state.fail("No diagnosis");
        return Ok(());
    };

    match diagnosis.fix_action {
        FixAction::Command => {
            let command = diagnosis
                .suggested_command
                .as_deref()
                .unwrap_or_default()
                .to_string();
            ctx.log(format!("running fix command: {command}"));
            let output = ctx.run_sandbox(&command, &ExecOptions::default()).await?;
            state.record(
                NodeKind::Execution,
                "command",
                &format!("exit {}", output.exit_code),
            );
            if !output.success() {
                state.feedback.push(format!(
                    "Fix command '{command}' exited {}: {}",
                    output.exit_code,
                    tail(&output.combined(), 400)
                ));
            }
        }
        FixAction::Edit => {
            // High-complexity problems with a known reproduction command
            // go through the multi-candidate pipeline; everything else
            // takes the single-shot edit path. The gate tracks the
            // adaptive phase-3 complexity threshold.
            let complexity_threshold = ctx.thresholds.threshold_for(LAYER_COMPLEXITY).await;
            let delegate = f64::from(state.problem_complexity.unwrap_or(0))
                >= complexity_threshold
                && diagnosis.reproduction_command.is_some()
                && !state.file_reservations.is_empty();

            if delegate && run_pipeline(ctx, state, &diagnosis).await? {
                // Pipeline handled the write.
            } else {
                let reserved = state.file_reservations.clone();
                for path in reserved {
                    edit_file(ctx, state, &path, &diagnosis).await?;
                }
            }
        }
    }

    state.current_node = NodeKind::Verification;
    Ok(())
}

/// Delegate the primary reserved file to the multi-candidate repair
/// pipeline. Returns false when the pipeline produced nothing, so the
/// caller can fall back to the single-shot path.
async fn run_pipeline(
    ctx: &GraphContext,
    state: &mut GraphState,
    diagnosis: &crate::state::Diagnosis,
) -> EngineResult<bool> {
    let path = state.file_reservations[0].clone();
    let Some(file) = state.files.get(&path).cloned() else {
        return Ok(false);
    };
    let test_command = diagnosis
        .reproduction_command
        .clone()
        .unwrap_or_default();

    let agent = crate::pipeline::RepairAgent::new(&ctx.services.llm, ctx.sandbox.as_ref());
    let outcome = agent
        .repair(
            &state.current_log_text,
            &file.original.content,
            &test_command,
            crate::pipeline::ValidationCriteria::default(),
        )
        .await?;

    let Some(outcome) = outcome else {
        return Ok(false);
    };
    ctx.log(format!(
        "pipeline candidate {} ({} refinement(s), passed: {})",
        outcome.patch.id, outcome.refinement_iterations, outcome.validation.passed
    ));

    ctx.sandbox.write_file(&path, &outcome.patch.code).await?;
    let before_hash = content_hash(&file.original.content);
    let after_hash = content_hash(&outcome.patch.code);
    if let Some(entry) = state.files.get_mut(&path) {
        entry.status = FileStatus::Modified;
        entry.modified = Some(FileVersion {
            content: outcome.patch.code.clone(),
            language: file.original.language.clone(),
            name: file.original.name.clone(),
        });
    }
    let modification = NewFileModification {
        run_id: ctx.run_id.clone(),
        path: path.clone(),
        before_hash,
        after_hash,
    };
    if let Err(e) = ctx.services.store.insert_modification(&modification).await {
        tracing::warn!(path = %path, error = %e, "file modification row not persisted");
    }

    if !outcome.validation.passed {
        state.feedback.push(format!(
            "Pipeline patch did not validate: {}",
            outcome
                .validation
                .error_message
                .as_deref()
                .unwrap_or("unknown failure")
        ));
    }
    state.record(NodeKind::Execution, "pipeline", &path);
    Ok(true)
}

async fn edit_file(
    ctx: &GraphContext,
    state: &mut GraphState,
    path: &str,
    diagnosis: &crate::state::Diagnosis,
) -> EngineResult<()> {
    // Re-attempt the fetch for files planning reserved empty.
    let needs_fetch = state
        .files
        .get(path)
        .is_none_or(|f| f.original.content.is_empty());
    if needs_fetch {
        match ctx.services.host.get_file_content(path).await {
            Ok(file) => {
                let entry = state.files.entry(path.to_string()).or_insert_with(|| {
                    crate::state::TrackedFile {
                        path: path.to_string(),
                        status: FileStatus::Original,
                        original: FileVersion {
                            content: String::new(),
                            language: file.language.clone(),
                            name: file.name.clone(),
                        },
                        modified: None,
                    }
                });
                entry.original.content = file.content;
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "original content unavailable; editing blind");
            }
        }
    }

    // Planning guarantees an entry per reservation; tolerate a gap
    // anyway rather than dropping the session.
    let Some(file) = state.files.get(path).cloned() else {
        tracing::warn!(path, "reserved path missing from tracked files; skipping");
        return Ok(());
    };

    // Second and later iterations may bring in external context; the
    // runbook template stands in for a web search.
    let web_context = if state.iteration >= 1 {
        state
            .classification
            .as_ref()
            .and_then(|c| runbook::match_runbook(&state.current_log_text, c.category))
            .map(|p| p.template)
    } else {
        None
    };

    let new_content = ai::generate_fix(
        &ctx.services.llm,
        &file,
        diagnosis,
        &state.feedback,
        web_context,
    )
    .await?;

    // Lint inside the sandbox; a failure is feedback, not a stop.
    ctx.sandbox.write_file(path, &new_content).await?;
    if let Some(lint) = lint_command(path) {
        match ctx
            .sandbox
            .run_command(&lint, &ExecOptions::with_timeout(LINT_TIMEOUT))
            .await
        {
            Ok(output) if !output.success() => {
                state.feedback.push(format!(
                    "Lint failed for {path}: {}",
                    tail(&output.combined(), 300)
                ));
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(path, error = %e, "lint unavailable"),
        }
    }

    // Soft judge vote; recorded, never retried here.
    let accepted = ai::judge_fix(&ctx.services.llm, &file, &new_content, diagnosis).await;
    state.record(
        NodeKind::Execution,
        "judge",
        if accepted { "accepted" } else { "doubtful" },
    );

    let before_hash = content_hash(&file.original.content);
    let after_hash = content_hash(&new_content);

    if let Some(entry) = state.files.get_mut(path) {
        entry.status = FileStatus::Modified;
        entry.modified = Some(FileVersion {
            content: new_content,
            language: file.original.language.clone(),
            name: file.original.name.clone(),
        });
    }

    let modification = NewFileModification {
        run_id: ctx.run_id.clone(),
        path: path.to_string(),
        before_hash,
        after_hash,
    };
    if let Err(e) = ctx.services.store.insert_modification(&modification).await {
        tracing::warn!(path, error = %e, "file modification row not persisted");
    }

    ctx.log(format!("rewrote {path}"));
    state.record(NodeKind::Execution, "edit", path);
    Ok(())
}

/// Syntax-check command for a path, when the toolchain makes one cheap.
fn lint_command(path: &str) -> Option<String> {
    let quoted = format!("'{}'", path.replace('\'', r"'\''"));
    let ext = path.rsplit('.').next()?;
    match ext {
        "js" | "mjs" | "cjs" => Some(format!("node --check {quoted}")),
        "py" => Some(format!("python3 -m py_compile {quoted}")),
        "json" => Some(format!("python3 -m json.tool {quoted} > /dev/null")),
        "sh" => Some(format!("sh -n {quoted}")),
        "yml" | "yaml" => Some(format!(
            "python3 -c 'import sys,yaml; yaml.safe_load(open(sys.argv[1]))' {quoted}"
        )),
        _ => None,
    }
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
