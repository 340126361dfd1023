//! Per-candidate validation: syntax check, optional static analysis,
//! and the reproduction run, sequentially per patch.

use medic_sandbox::{ExecOptions, Sandbox};
use std::time::{Duration, Instant};

use crate::pipeline::candidates::PatchCandidate;

const SYNTAX_TIMEOUT: Duration = Duration::from_secs(30);
const TEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Validation criteria toggles.
#[derive(Debug, Clone, Copy)]
pub struct ValidationCriteria {
    pub run_static_analysis: bool,
}

impl Default for ValidationCriteria {
    fn default() -> Self {
        Self {
            run_static_analysis: false,
        }
    }
}

/// Detailed counters from a validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationDetails {
    pub tests_run: u32,
    pub tests_failed: u32,
    pub lint_errors: u32,
    pub type_errors: u32,
}

/// Result for one candidate.
#[derive(Debug, Clone)]
pub struct PatchValidation {
    pub passed: bool,
    pub tests_passed: bool,
    pub syntax_valid: bool,
    pub static_analysis_passed: bool,
    pub details: ValidationDetails,
    pub error_message: Option<String>,
    pub execution_time: Duration,
}

/// Validate candidates one at a time against the reproduction command.
/// Each candidate is written to the faulty file before its checks and
/// the results are returned in candidate order.
pub async fn validate_patches(
    sandbox: &dyn Sandbox,
    file_path: &str,
    candidates: &[PatchCandidate],
    test_command: &str,
    criteria: ValidationCriteria,
) -> Vec<PatchValidation> {
    let mut results = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        results.push(validate_one(sandbox, file_path, candidate, test_command, criteria).await);
    }
    results
}

async fn validate_one(
    sandbox: &dyn Sandbox,
    file_path: &str,
    candidate: &PatchCandidate,
    test_command: &str,
    criteria: ValidationCriteria,
) -> PatchValidation {
    let started = Instant::now();
    let mut validation = PatchValidation {
        passed: false,
        tests_passed: false,
        syntax_valid: false,
        static_analysis_passed: true,
        details: ValidationDetails::default(),
        error_message: None,
        execution_time: Duration::ZERO,
    };

    if let Err(e) = sandbox.write_file(file_path, &candidate.code).await {
        validation.error_message = Some(format!("write failed: {e}"));
        validation.execution_time = started.elapsed();
        return validation;
    }

    // Syntax gate.
    match syntax_check_command(file_path) {
        Some(check) => match sandbox
            .run_command(&check, &ExecOptions::with_timeout(SYNTAX_TIMEOUT))
            .await
        {
            Ok(output) if output.success() => validation.syntax_valid = true,
            Ok(output) => {
                validation.details.lint_errors += 1;
                validation.error_message = Some(format!(
                    "syntax check failed: {}",
                    output.stderr.lines().next().unwrap_or("")
                ));
                validation.execution_time = started.elapsed();
                return validation;
            }
            // No toolchain for the check; fall through to the tests.
            Err(_) => validation.syntax_valid = true,
        },
        None => validation.syntax_valid = true,
    }

    if criteria.run_static_analysis {
        if let Some(analysis) = static_analysis_command(file_path) {
            if let Ok(output) = sandbox
                .run_command(&analysis, &ExecOptions::with_timeout(SYNTAX_TIMEOUT))
                .await
            {
                validation.static_analysis_passed = output.success();
                if !output.success() {
                    validation.details.type_errors += 1;
                }
            }
        }
    }

    // The reproduction run is the arbiter.
    match sandbox
        .run_command(test_command, &ExecOptions::with_timeout(TEST_TIMEOUT))
        .await
    {
        Ok(output) => {
            validation.details.tests_run = 1;
            validation.tests_passed = output.success();
            if !output.success() {
                validation.details.tests_failed = 1;
                validation.error_message = Some(
                    output
                        .combined()
                        .lines()
                        .rev()
                        .find(|l| !l.trim().is_empty())
                        .unwrap_or("tests failed")
                        .to_string(),
                );
            }
        }
        Err(e) => {
            validation.error_message = Some(format!("test run failed: {e}"));
        }
    }

    validation.passed =
        validation.syntax_valid && validation.static_analysis_passed && validation.tests_passed;
    validation.execution_time = started.elapsed();
    validation
}

fn syntax_check_command(path: &str) -> Option<String> {
    let quoted = format!("'{}'", path.replace('\'', r"'\''"));
    match path.rsplit('.').next()? {
        "js" | "mjs" | "cjs" => Some(format!("node --check {quoted}")),
        "py" => Some(format!("python3 -m py_compile {quoted}")),
        "sh" => Some(format!("sh -n {quoted}")),
        "json" => Some(format!("python3 -m json.tool {quoted} > /dev/null")),
        _ => None,
    }
}

fn static_analysis_command(path: &str) -> Option<String> {
    let quoted = format!("'{}'", path.replace('\'', r"'\''"));
    match path.rsplit('.').next()? {
        "ts" | "tsx" => Some(format!("npx tsc --noEmit {quoted}")),
        "py" => Some(format!("python3 -m pyflakes {quoted}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::candidates::PatchStrategy;
    use medic_sandbox::SimulationSandbox;

    fn candidate(code: &str) -> PatchCandidate {
        PatchCandidate {
            id: "patch-direct".into(),
            code: code.into(),
            description: String::new(),
            confidence: 0.8,
            strategy: PatchStrategy::Direct,
            reasoning: String::new(),
        }
    }

    #[tokio::test]
    async fn test_passing_patch() {
        let sandbox = SimulationSandbox::new().unwrap();
        let results = validate_patches(
            &sandbox,
            "fix.sh",
            &[candidate("echo ok\n")],
            "sh fix.sh",
            ValidationCriteria::default(),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        assert!(results[0].syntax_valid);
        assert!(results[0].tests_passed);
        assert_eq!(results[0].details.tests_failed, 0);
    }

    #[tokio::test]
    async fn test_syntax_failure_short_circuits_tests() {
        let sandbox = SimulationSandbox::new().unwrap();
        let results = validate_patches(
            &sandbox,
            "fix.sh",
            &[candidate("if then fi broken\n")],
            "sh fix.sh",
            ValidationCriteria::default(),
        )
        .await;

        assert!(!results[0].passed);
        assert!(!results[0].syntax_valid);
        assert_eq!(results[0].details.tests_run, 0);
        assert!(results[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_failing_tests_reported() {
        let sandbox = SimulationSandbox::new().unwrap();
        let results = validate_patches(
            &sandbox,
            "fix.sh",
            &[candidate("exit 2\n")],
            "sh fix.sh",
            ValidationCriteria::default(),
        )
        .await;

        assert!(!results[0].passed);
        assert!(results[0].syntax_valid);
        assert!(!results[0].tests_passed);
        assert_eq!(results[0].details.tests_failed, 1);
    }
}
