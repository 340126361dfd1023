//! Multi-candidate repair pipeline.
//!
//! High-complexity problems bypass the single-shot edit path: localize
//! the fault from the trace, generate three candidates in parallel,
//! validate each in the sandbox, rank, and refine the best candidate
//! with validation feedback until it passes or the refinement budget
//! runs out.

pub mod candidates;
pub mod rank;
pub mod stacktrace;
pub mod validate;

pub use candidates::{generate_patch_candidates, PatchCandidate, PatchStrategy};
pub use rank::rank_patches;
pub use stacktrace::{parse_stack_trace, StackFrame};
pub use validate::{validate_patches, PatchValidation, ValidationCriteria};

use medic_llm::{ChatMessage, GenerateRequest, LlmClient};
use medic_sandbox::Sandbox;
use serde::Deserialize;

use crate::error::EngineResult;

const DEFAULT_MAX_REFINEMENT_ITERATIONS: u32 = 3;

/// One suspected fault location.
#[derive(Debug, Clone, Deserialize)]
pub struct FaultLocation {
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub suggested_fix: String,
}

/// Output of fault localization.
#[derive(Debug, Clone)]
pub struct FaultLocalization {
    pub primary: FaultLocation,
    pub alternatives: Vec<FaultLocation>,
    pub stack_trace: Vec<StackFrame>,
    pub method: &'static str,
}

#[derive(Debug, Deserialize)]
struct WireLocalization {
    primary_location: FaultLocation,
    #[serde(default)]
    alternative_locations: Vec<FaultLocation>,
}

/// Localize the fault via the LLM, seeded with the parsed stack frames.
pub async fn localize_fault(
    llm: &LlmClient,
    log: &str,
    frames: &[StackFrame],
) -> EngineResult<FaultLocalization> {
    let frame_block = frames
        .iter()
        .take(10)
        .map(|f| {
            format!(
                "- {}:{}{}",
                f.file,
                f.line,
                f.function
                    .as_deref()
                    .map(|func| format!(" in {func}"))
                    .unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let request = GenerateRequest {
        messages: vec![
            ChatMessage::system(
                "You localize faults from CI logs. Respond as JSON:\n\
                 {\"primary_location\": {\"file\": str, \"line\": int, \"confidence\": number,\n\
                  \"reasoning\": str, \"suggested_fix\": str},\n\
                  \"alternative_locations\": [ ...same shape... ]}",
            ),
            ChatMessage::user(format!(
                "Stack frames:\n{frame_block}\n\nLog (tail):\n```\n{}\n```\n\
                 Where is the root cause?",
                tail(log, 5000)
            )),
        ],
        temperature: Some(0.0),
        ..Default::default()
    };

    let (wire, _) = llm
        .generate_json::<WireLocalization>(&request, |loc| {
            if loc.primary_location.file.trim().is_empty() {
                Err("primary_location.file required".into())
            } else {
                Ok(())
            }
        })
        .await?;

    Ok(FaultLocalization {
        primary: wire.primary_location,
        alternatives: wire.alternative_locations,
        stack_trace: frames.to_vec(),
        method: "llm",
    })
}

/// Final outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub patch: PatchCandidate,
    pub validation: PatchValidation,
    pub refinement_iterations: u32,
}

/// The multi-candidate repair agent.
pub struct RepairAgent<'a> {
    llm: &'a LlmClient,
    sandbox: &'a dyn Sandbox,
    max_refinement_iterations: u32,
}

impl<'a> RepairAgent<'a> {
    #[must_use]
    pub fn new(llm: &'a LlmClient, sandbox: &'a dyn Sandbox) -> Self {
        Self {
            llm,
            sandbox,
            max_refinement_iterations: DEFAULT_MAX_REFINEMENT_ITERATIONS,
        }
    }

    #[must_use]
    pub fn with_max_refinements(mut self, max: u32) -> Self {
        self.max_refinement_iterations = max;
        self
    }

    /// Run the full pipeline. Returns the best candidate and its last
    /// validation, whether or not it ultimately passed.
    pub async fn repair(
        &self,
        log: &str,
        file_content: &str,
        test_command: &str,
        criteria: ValidationCriteria,
    ) -> EngineResult<Option<RepairOutcome>> {
        let frames = parse_stack_trace(log);
        let localization = localize_fault(self.llm, log, &frames).await?;
        tracing::info!(
            file = %localization.primary.file,
            line = localization.primary.line,
            "fault localized"
        );

        let generated =
            generate_patch_candidates(self.llm, &localization, file_content, tail(log, 4000))
                .await;
        if generated.is_empty() {
            return Ok(None);
        }

        let file_path = localization.primary.file.clone();
        let validations = validate_patches(
            self.sandbox,
            &file_path,
            &generated,
            test_command,
            criteria,
        )
        .await;

        // Pair candidates with their validations, then rank.
        let mut paired: Vec<(PatchCandidate, PatchValidation)> =
            generated.into_iter().zip(validations).collect();
        let ranked_ids: Vec<String> = rank_patches(
            paired.iter().map(|(c, _)| c.clone()).collect(),
        )
        .into_iter()
        .map(|c| c.id)
        .collect();
        paired.sort_by_key(|(c, _)| {
            ranked_ids
                .iter()
                .position(|id| *id == c.id)
                .unwrap_or(usize::MAX)
        });

        // First pass success returns immediately.
        if let Some((candidate, validation)) = paired.iter().find(|(_, v)| v.passed) {
            return Ok(Some(RepairOutcome {
                patch: candidate.clone(),
                validation: validation.clone(),
                refinement_iterations: 0,
            }));
        }

        let (mut best, mut best_validation) = paired.swap_remove(0);
        let mut feedback_history: Vec<String> = Vec::new();

        for refinement in 1..=self.max_refinement_iterations {
            let failure = best_validation
                .error_message
                .clone()
                .unwrap_or_else(|| "validation failed".to_string());
            feedback_history.push(failure.clone());

            let Some(refined) = self
                .refine(&best, &localization, file_content, &feedback_history)
                .await
            else {
                break;
            };

            let validation = validate_patches(
                self.sandbox,
                &file_path,
                std::slice::from_ref(&refined),
                test_command,
                criteria,
            )
            .await
            .pop()
            .expect("one validation per candidate");

            best = refined;
            best_validation = validation;
            if best_validation.passed {
                return Ok(Some(RepairOutcome {
                    patch: best,
                    validation: best_validation,
                    refinement_iterations: refinement,
                }));
            }
        }

        Ok(Some(RepairOutcome {
            patch: best,
            validation: best_validation,
            refinement_iterations: self.max_refinement_iterations,
        }))
    }

    async fn refine(
        &self,
        candidate: &PatchCandidate,
        localization: &FaultLocalization,
        original_content: &str,
        feedback_history: &[String],
    ) -> Option<PatchCandidate> {
        let feedback_block = feedback_history
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{}. {f}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");

        let request = GenerateRequest {
            messages: vec![
                ChatMessage::system(
                    "You refine failing patches. Respond as JSON:\n\
                     {\"code\": \"<full new file content>\", \"description\": str,\n\
                      \"confidence\": number, \"reasoning\": str}",
                ),
                ChatMessage::user(format!(
                    "Fault: {} at {}:{}\nOriginal file:\n```\n{original_content}\n```\n\
                     Your previous patch:\n```\n{}\n```\n\
                     Validation failures so far:\n{feedback_block}\n\nFix the patch.",
                    localization.primary.reasoning,
                    localization.primary.file,
                    localization.primary.line,
                    candidate.code,
                )),
            ],
            temperature: Some(0.2),
            ..Default::default()
        };

        #[derive(Debug, Deserialize)]
        struct WireRefined {
            code: String,
            #[serde(default)]
            description: String,
            #[serde(default)]
            confidence: Option<f64>,
            #[serde(default)]
            reasoning: String,
        }

        match self
            .llm
            .generate_json::<WireRefined>(&request, |c| {
                if c.code.trim().is_empty() {
                    Err("empty code".into())
                } else {
                    Ok(())
                }
            })
            .await
        {
            Ok((wire, _)) => Some(PatchCandidate {
                id: format!("{}-refined", candidate.id),
                code: candidates::post_process(&wire.code, &localization.primary.file),
                description: wire.description,
                confidence: wire.confidence.unwrap_or(candidate.confidence),
                strategy: candidate.strategy,
                reasoning: wire.reasoning,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "refinement generation failed");
                None
            }
        }
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
