//! Patch-candidate generation: three strategies in parallel, plus the
//! post-processing pass that cleans model artifacts out of the code.

use futures::join;
use medic_llm::{ChatMessage, GenerateRequest, LlmClient};
use serde::Deserialize;

use crate::pipeline::FaultLocalization;

/// Generation strategy, in rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    /// Minimal, surgical change.
    Direct,
    /// Defensive: guards, null checks, fallbacks.
    Conservative,
    /// Small refactor around the fault.
    Alternative,
}

impl PatchStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Conservative => "conservative",
            Self::Alternative => "alternative",
        }
    }

    #[must_use]
    pub fn temperature(self) -> f32 {
        match self {
            Self::Direct => 0.1,
            Self::Conservative => 0.2,
            Self::Alternative => 0.3,
        }
    }

    /// Tie-break score when confidences land in the same band.
    #[must_use]
    pub fn score(self) -> u8 {
        match self {
            Self::Direct => 3,
            Self::Conservative => 2,
            Self::Alternative => 1,
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            Self::Direct => "Make the smallest change that fixes the fault. Touch nothing else.",
            Self::Conservative => {
                "Fix the fault defensively: add the guards, null checks, or fallbacks that \
                 make the failing path safe."
            }
            Self::Alternative => {
                "Fix the fault by restructuring the immediate surrounding code if that \
                 yields a clearly more robust shape."
            }
        }
    }
}

/// One generated candidate.
#[derive(Debug, Clone)]
pub struct PatchCandidate {
    pub id: String,
    /// Full replacement content for the faulty file.
    pub code: String,
    pub description: String,
    pub confidence: f64,
    pub strategy: PatchStrategy,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    code: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: String,
}

/// Generate up to three candidates concurrently, one per strategy.
pub async fn generate_patch_candidates(
    llm: &LlmClient,
    localization: &FaultLocalization,
    file_content: &str,
    log_excerpt: &str,
) -> Vec<PatchCandidate> {
    let (direct, conservative, alternative) = join!(
        generate_one(llm, PatchStrategy::Direct, localization, file_content, log_excerpt),
        generate_one(
            llm,
            PatchStrategy::Conservative,
            localization,
            file_content,
            log_excerpt
        ),
        generate_one(
            llm,
            PatchStrategy::Alternative,
            localization,
            file_content,
            log_excerpt
        ),
    );

    [direct, conservative, alternative]
        .into_iter()
        .flatten()
        .collect()
}

async fn generate_one(
    llm: &LlmClient,
    strategy: PatchStrategy,
    localization: &FaultLocalization,
    file_content: &str,
    log_excerpt: &str,
) -> Option<PatchCandidate> {
    let request = GenerateRequest {
        messages: vec![
            ChatMessage::system(format!(
                "You write patches for CI failures. {}\nRespond as JSON:\n\
                 {{\"code\": \"<full new file content>\", \"description\": str,\n\
                  \"confidence\": number, \"reasoning\": str}}",
                strategy.instructions()
            )),
            ChatMessage::user(format!(
                "Fault: {} at {}:{} (confidence {:.2})\nSuggested fix: {}\n\n\
                 Failure log:\n```\n{log_excerpt}\n```\n\nCurrent file content:\n```\n{file_content}\n```",
                localization.primary.reasoning,
                localization.primary.file,
                localization.primary.line,
                localization.primary.confidence,
                localization.primary.suggested_fix,
            )),
        ],
        temperature: Some(strategy.temperature()),
        ..Default::default()
    };

    match llm
        .generate_json::<WireCandidate>(&request, |c| {
            if c.code.trim().is_empty() {
                Err("empty code".into())
            } else {
                Ok(())
            }
        })
        .await
    {
        Ok((wire, _)) => Some(PatchCandidate {
            id: format!("patch-{}", strategy.as_str()),
            code: post_process(&wire.code, &localization.primary.file),
            description: wire.description,
            confidence: wire.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            strategy,
            reasoning: wire.reasoning,
        }),
        Err(e) => {
            tracing::warn!(strategy = strategy.as_str(), error = %e, "candidate generation failed");
            None
        }
    }
}

/// Clean model artifacts: Unicode dashes in shell flags, and inline
/// comments inside continued Dockerfile `RUN` lines (which break the
/// shell continuation).
#[must_use]
pub fn post_process(code: &str, file: &str) -> String {
    let mut cleaned = fix_shell_flag_typos(code);
    if file.rsplit('/').next().unwrap_or(file).starts_with("Dockerfile") {
        cleaned = strip_dockerfile_inline_comments(&cleaned);
    }
    cleaned
}

/// Models emit em/en dashes where shell flags need `--`.
fn fix_shell_flag_typos(code: &str) -> String {
    code.replace("—", "--").replace('–', "-")
}

/// Inside a continued RUN block, a trailing `# comment` after `\` (or
/// on a continuation line) swallows the rest of the command.
fn strip_dockerfile_inline_comments(code: &str) -> String {
    let mut out = Vec::new();
    let mut in_continuation = false;
    for line in code.lines() {
        let is_run = line.trim_start().starts_with("RUN ");
        if in_continuation || is_run {
            let stripped = match line.find(" #") {
                // Keep whole-line comments outside continuations.
                Some(idx) if in_continuation || is_run => {
                    let head = line[..idx].trim_end();
                    let keeps_continuation = line.trim_end().ends_with('\\');
                    if keeps_continuation && !head.ends_with('\\') {
                        format!("{head} \\")
                    } else {
                        head.to_string()
                    }
                }
                _ => line.to_string(),
            };
            in_continuation = stripped.trim_end().ends_with('\\');
            out.push(stripped);
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_temperatures_and_scores() {
        assert!(PatchStrategy::Direct.temperature() < PatchStrategy::Alternative.temperature());
        assert!(PatchStrategy::Direct.score() > PatchStrategy::Conservative.score());
        assert!(PatchStrategy::Conservative.score() > PatchStrategy::Alternative.score());
    }

    #[test]
    fn test_fix_shell_flag_typos() {
        assert_eq!(
            fix_shell_flag_typos("npm install —save-dev jest"),
            "npm install --save-dev jest"
        );
    }

    #[test]
    fn test_dockerfile_continuation_comments_stripped() {
        let code = "FROM alpine\nRUN apk update \\ # refresh index\n    && apk add curl # tooling\nCMD [\"sh\"]";
        let cleaned = post_process(code, "Dockerfile");
        assert!(cleaned.contains("RUN apk update \\"));
        assert!(!cleaned.contains("refresh index"));
        assert!(!cleaned.contains("tooling"));
        assert!(cleaned.contains("CMD [\"sh\"]"));
    }

    #[test]
    fn test_non_dockerfile_comments_kept() {
        let code = "run_thing() # important note";
        assert_eq!(post_process(code, "script.py"), code);
    }
}
