//! LLM-backed engine operations: diagnosis, planning, fix generation,
//! judging, and problem refinement.
//!
//! Prompts are plain `format!` strings. Every JSON-returning call goes
//! through `generate_json`, which re-prompts on schema violations, so a
//! malformed model response costs a retry rather than the iteration.

use medic_llm::{ChatMessage, GenerateRequest, LlmClient};
use serde::Deserialize;

use crate::error::{EngineError, EngineResult};
use crate::state::{
    Classification, DagNode, Diagnosis, ErrorDag, FixAction, Plan, PlanTask, TaskStatus,
    TrackedFile,
};

const LOG_EXCERPT_CHARS: usize = 6000;
const FILE_EXCERPT_CHARS: usize = 12_000;

#[derive(Debug, Deserialize)]
struct WireDiagnosis {
    summary: String,
    #[serde(default)]
    file_path: Option<String>,
    fix_action: String,
    #[serde(default)]
    suggested_command: Option<String>,
    #[serde(default)]
    reproduction_command: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Diagnose the failure from the log, repo context, classification, and
/// accumulated feedback.
pub async fn diagnose_error(
    llm: &LlmClient,
    log: &str,
    repo_context: &str,
    classification: &Classification,
    feedback: &[String],
) -> EngineResult<Diagnosis> {
    let feedback_block = if feedback.is_empty() {
        String::new()
    } else {
        format!(
            "\nPrevious attempts and their outcomes:\n{}\n",
            bulleted(feedback)
        )
    };

    let request = GenerateRequest {
        messages: vec![
            ChatMessage::system(
                "You are a CI-failure diagnostician. Respond as JSON:\n\
                 {\"summary\": str, \"file_path\": str|null, \"fix_action\": \"edit\"|\"command\",\n\
                  \"suggested_command\": str|null, \"reproduction_command\": str|null,\n\
                  \"confidence\": number}\n\
                 Use fix_action \"command\" when a shell command fixes the failure (e.g. a\n\
                 missing dependency), \"edit\" when source must change.",
            ),
            ChatMessage::user(format!(
                "Failure category: {} ({})\nAffected files: {}\n{feedback_block}\n\
                 Repository context:\n{}\n\nFailure log:\n```\n{}\n```",
                classification.category.as_str(),
                classification.suggested_action,
                classification.affected_files.join(", "),
                excerpt(repo_context, LOG_EXCERPT_CHARS),
                excerpt_tail(log, LOG_EXCERPT_CHARS),
            )),
        ],
        temperature: Some(0.1),
        ..Default::default()
    };

    let (wire, _) = llm
        .generate_json::<WireDiagnosis>(&request, |d| {
            match d.fix_action.as_str() {
                "edit" | "command" => {}
                other => return Err(format!("fix_action must be edit|command, got '{other}'")),
            }
            if d.fix_action == "command"
                && d.suggested_command.as_deref().unwrap_or("").trim().is_empty()
            {
                return Err("command fixes need suggested_command".into());
            }
            if d.summary.trim().is_empty() {
                return Err("summary must not be empty".into());
            }
            Ok(())
        })
        .await?;

    Ok(Diagnosis {
        summary: wire.summary,
        file_path: wire.file_path.filter(|p| !p.trim().is_empty()),
        fix_action: if wire.fix_action == "command" {
            FixAction::Command
        } else {
            FixAction::Edit
        },
        suggested_command: wire.suggested_command,
        reproduction_command: wire
            .reproduction_command
            .filter(|c| !c.trim().is_empty()),
        confidence: wire.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
    })
}

#[derive(Debug, Deserialize)]
struct WirePlanTask {
    description: String,
    #[serde(default)]
    target_file: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WirePlan {
    goal: String,
    tasks: Vec<WirePlanTask>,
}

/// Produce the detailed, pre-approved repair plan for a diagnosis.
pub async fn generate_detailed_plan(
    llm: &LlmClient,
    diagnosis: &Diagnosis,
    refined_statement: Option<&str>,
) -> EngineResult<Plan> {
    let problem = refined_statement.unwrap_or(&diagnosis.summary);
    let request = GenerateRequest {
        messages: vec![
            ChatMessage::system(
                "You plan minimal CI repairs. Respond as JSON:\n\
                 {\"goal\": str, \"tasks\": [{\"description\": str, \"target_file\": str|null,\n\
                  \"dependencies\": [str]}]}\n\
                 Keep plans to at most four tasks.",
            ),
            ChatMessage::user(format!(
                "Problem: {problem}\nPrimary file: {}\nPlan the fix.",
                diagnosis.file_path.as_deref().unwrap_or("(unknown)"),
            )),
        ],
        temperature: Some(0.2),
        ..Default::default()
    };

    let (wire, _) = llm
        .generate_json::<WirePlan>(&request, |p| {
            if p.tasks.is_empty() {
                Err("plan needs at least one task".into())
            } else {
                Ok(())
            }
        })
        .await?;

    Ok(Plan {
        goal: wire.goal,
        tasks: wire
            .tasks
            .into_iter()
            .enumerate()
            .map(|(i, t)| PlanTask {
                id: format!("task-{}", i + 1),
                description: t.description,
                status: TaskStatus::Pending,
                dependencies: t.dependencies,
                target_file: t.target_file.or_else(|| diagnosis.file_path.clone()),
            })
            .collect(),
        approved: true,
        rejection_reason: None,
    })
}

/// Generate the full replacement content for one reserved file.
pub async fn generate_fix(
    llm: &LlmClient,
    file: &TrackedFile,
    diagnosis: &Diagnosis,
    feedback: &[String],
    web_context: Option<&str>,
) -> EngineResult<String> {
    let feedback_block = if feedback.is_empty() {
        String::new()
    } else {
        format!("\nEarlier attempts failed:\n{}\n", bulleted(feedback))
    };
    let web_block = web_context
        .map(|ctx| format!("\nRelevant external context:\n{}\n", excerpt(ctx, 2000)))
        .unwrap_or_default();

    let request = GenerateRequest {
        messages: vec![
            ChatMessage::system(
                "You repair source files. Respond with the complete new file content \
                 only, no prose, no code fences.",
            ),
            ChatMessage::user(format!(
                "Problem: {}\n{feedback_block}{web_block}\nFile `{}` ({}):\n```{}\n{}\n```\n\
                 Produce the fixed file.",
                diagnosis.summary,
                file.path,
                file.original.name,
                file.original.language,
                excerpt(&file.original.content, FILE_EXCERPT_CHARS),
            )),
        ],
        temperature: Some(0.1),
        ..Default::default()
    };

    let generation = llm.generate(&request).await?;
    let content = strip_code_fences(&generation.text);
    if content.trim().is_empty() {
        return Err(EngineError::Validation("empty fix content".into()));
    }
    Ok(content)
}

#[derive(Debug, Deserialize)]
struct WireVerdict {
    acceptable: bool,
    #[serde(default)]
    reason: String,
}

/// Soft LLM gate over a generated fix. Errors count as acceptance; the
/// reproduction run is the real arbiter.
pub async fn judge_fix(
    llm: &LlmClient,
    file: &TrackedFile,
    new_content: &str,
    diagnosis: &Diagnosis,
) -> bool {
    let request = GenerateRequest {
        messages: vec![
            ChatMessage::system(
                "You review patches. Respond as JSON: {\"acceptable\": bool, \"reason\": str}",
            ),
            ChatMessage::user(format!(
                "Problem: {}\nFile: {}\n--- before ---\n{}\n--- after ---\n{}\n\
                 Does the change plausibly address the problem without destroying the file?",
                diagnosis.summary,
                file.path,
                excerpt(&file.original.content, 4000),
                excerpt(new_content, 4000),
            )),
        ],
        temperature: Some(0.0),
        ..Default::default()
    };

    match llm
        .generate_json::<WireVerdict>(&request, |_| Ok(()))
        .await
    {
        Ok((verdict, _)) => {
            if !verdict.acceptable {
                tracing::warn!(file = %file.path, reason = %verdict.reason, "judge rejected fix");
            }
            verdict.acceptable
        }
        Err(e) => {
            tracing::debug!(error = %e, "judge unavailable; accepting fix");
            true
        }
    }
}

/// Fold accumulated feedback into a refined problem statement. The
/// deterministic composition is the contract; the LLM only polishes it,
/// and the `Previous attempts:` marker always survives.
pub async fn refine_problem_statement(
    llm: &LlmClient,
    diagnosis: &Diagnosis,
    feedback: &[String],
    previous: Option<&str>,
) -> String {
    let attempts = feedback.join("; ");
    let base = match previous {
        Some(prev) => format!("{prev} Previous attempts: {attempts}"),
        None => format!("{} Previous attempts: {attempts}", diagnosis.summary),
    };

    let request = GenerateRequest {
        messages: vec![
            ChatMessage::system(
                "Rewrite the problem statement in one or two sentences, keeping the \
                 'Previous attempts:' clause verbatim. Respond with plain text.",
            ),
            ChatMessage::user(base.clone()),
        ],
        temperature: Some(0.2),
        ..Default::default()
    };

    match llm.generate(&request).await {
        Ok(generation) => {
            let refined = generation.text.trim().to_string();
            if refined.is_empty() || !refined.contains("Previous attempts:") {
                base
            } else {
                refined
            }
        }
        Err(_) => base,
    }
}

/// Summarize the repository layout for prompts; the raw listing is the
/// fallback.
pub async fn summarize_repo_context(llm: &LlmClient, listing: &str) -> String {
    let request = GenerateRequest {
        messages: vec![
            ChatMessage::system(
                "Summarize this repository layout in at most five lines: stack, entry \
                 points, test layout. Plain text.",
            ),
            ChatMessage::user(excerpt(listing, 4000).to_string()),
        ],
        temperature: Some(0.2),
        ..Default::default()
    };

    match llm.generate(&request).await {
        Ok(generation) if !generation.text.trim().is_empty() => generation.text.trim().to_string(),
        _ => listing.trim().to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct WireDagNode {
    id: String,
    problem: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    complexity: u8,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireDag {
    root_problem: String,
    nodes: Vec<WireDagNode>,
}

/// Decompose a composite failure into a sub-problem DAG. `None` when
/// the model declines or the decomposition is degenerate.
pub async fn build_error_dag(
    llm: &LlmClient,
    diagnosis: &Diagnosis,
    log: &str,
) -> Option<ErrorDag> {
    let request = GenerateRequest {
        messages: vec![
            ChatMessage::system(
                "Decompose a composite CI failure into independent sub-problems. Respond as JSON:\n\
                 {\"root_problem\": str, \"nodes\": [{\"id\": str, \"problem\": str,\n\
                  \"priority\": int, \"complexity\": int, \"dependencies\": [str]}]}\n\
                 Two to five nodes. Use dependencies only where one fix truly blocks another.",
            ),
            ChatMessage::user(format!(
                "Diagnosis: {}\nLog:\n```\n{}\n```",
                diagnosis.summary,
                excerpt_tail(log, LOG_EXCERPT_CHARS),
            )),
        ],
        temperature: Some(0.2),
        ..Default::default()
    };

    let (wire, _) = llm
        .generate_json::<WireDag>(&request, |dag| {
            if dag.nodes.len() < 2 {
                Err("decomposition needs at least two nodes".into())
            } else {
                Ok(())
            }
        })
        .await
        .ok()?;

    Some(ErrorDag {
        root_problem: wire.root_problem,
        nodes: wire
            .nodes
            .into_iter()
            .map(|n| DagNode {
                id: n.id,
                problem: n.problem,
                priority: n.priority,
                complexity: n.complexity.clamp(1, 10),
                dependencies: n.dependencies,
            })
            .collect(),
    })
}

/// Strip a wrapping code fence if the model added one anyway.
#[must_use]
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the language tag line, then the closing fence.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.strip_suffix("```")
        .unwrap_or(body)
        .trim_end_matches('\n')
        .to_string()
}

fn bulleted(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn excerpt(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn excerpt_tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_plain_text() {
        assert_eq!(strip_code_fences("let x = 1;"), "let x = 1;");
    }

    #[test]
    fn test_strip_fenced_block() {
        let text = "```typescript\nconst x = 1;\nexport default x;\n```";
        assert_eq!(strip_code_fences(text), "const x = 1;\nexport default x;");
    }

    #[test]
    fn test_strip_fence_without_language() {
        assert_eq!(strip_code_fences("```\nhello\n```"), "hello");
    }

    #[test]
    fn test_excerpt_tail_keeps_end() {
        let text = "aaaa ERROR at end";
        let tail = excerpt_tail(text, 12);
        assert!(tail.ends_with("ERROR at end"));
        assert_eq!(tail.chars().count(), 12);
    }
}
