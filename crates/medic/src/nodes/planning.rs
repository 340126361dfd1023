//! Planning node: resolve the target file, produce the detailed plan,
//! and reserve the files execution will touch.

use medic_scm::language_for_path;

use crate::ai;
use crate::context::GraphContext;
use crate::error::EngineResult;
use crate::state::{
    FileStatus, FileVersion, FixAction, GraphState, NodeKind, TrackedFile,
};

pub async fn run(ctx: &GraphContext, state: &mut GraphState) -> EngineResult<()> {
    let Some(diagnosis) = state.diagnosis.clone() else {
        state.fail("No diagnosis");
        return Ok(());
    };

    // Command fixes need no reservations and no plan expansion.
    if diagnosis.fix_action == FixAction::Command {
        state.file_reservations.clear();
        state.record(NodeKind::Planning, "skip", "command fix");
        state.current_node = NodeKind::Execution;
        return Ok(());
    }

    // Resolve the diagnosed path against the real tree. A miss is a
    // warning, not a failure; execution re-attempts the fetch.
    let mut resolved_path = diagnosis.file_path.clone();
    if let Some(path) = &diagnosis.file_path {
        match ctx.services.host.find_closest_file(path).await {
            Ok(Some(found)) => {
                if found.path != *path {
                    ctx.log(format!("resolved '{path}' to '{}'", found.path));
                }
                state.files.insert(
                    found.path.clone(),
                    TrackedFile {
                        path: found.path.clone(),
                        status: FileStatus::Original,
                        original: FileVersion {
                            content: found.file.content,
                            language: found.file.language,
                            name: found.file.name,
                        },
                        modified: None,
                    },
                );
                resolved_path = Some(found.path);
            }
            Ok(None) => {
                tracing::warn!(path = %path, "diagnosed file not found in repository");
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "closest-file lookup failed");
            }
        }
    }
    if let (Some(path), Some(diagnosis_state)) = (&resolved_path, state.diagnosis.as_mut()) {
        diagnosis_state.file_path = Some(path.clone());
    }

    let plan = ai::generate_detailed_plan(
        &ctx.services.llm,
        &diagnosis,
        state.refined_problem_statement.as_deref(),
    )
    .await?;
    ctx.log(format!("plan: {} ({} tasks)", plan.goal, plan.tasks.len()));

    // Reservations: every task's target file, falling back to the
    // diagnosed path, deduplicated. Every reserved path gets a `files`
    // entry even when the fetch fails, so the reservation invariant
    // holds.
    let mut reservations: Vec<String> = Vec::new();
    for task in &plan.tasks {
        let target = task
            .target_file
            .clone()
            .or_else(|| resolved_path.clone());
        if let Some(target) = target {
            if !reservations.contains(&target) {
                reservations.push(target);
            }
        }
    }

    for path in &reservations {
        if state.files.contains_key(path) {
            continue;
        }
        let file = match ctx.services.host.get_file_content(path).await {
            Ok(file) => FileVersion {
                content: file.content,
                language: file.language,
                name: file.name,
            },
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "file fetch failed; reserving empty");
                FileVersion {
                    content: String::new(),
                    language: language_for_path(path),
                    name: path.rsplit('/').next().unwrap_or(path).to_string(),
                }
            }
        };
        state.files.insert(
            path.clone(),
            TrackedFile {
                path: path.clone(),
                status: FileStatus::Original,
                original: file,
                modified: None,
            },
        );
    }

    state.record(
        NodeKind::Planning,
        "reserve",
        &reservations.join(","),
    );
    state.file_reservations = reservations;
    state.plan = Some(plan);
    state.current_node = NodeKind::Execution;
    Ok(())
}
