//! Log classification and complexity estimation.
//!
//! Pattern-based: the first matching category wins, ordered from most
//! to least specific. Complexity starts from a per-category base and is
//! elevated for cascading failures (many distinct error lines).

use regex::Regex;
use std::sync::LazyLock;

use crate::state::{Classification, ErrorCategory};

static MODULE_MISSING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(ModuleNotFoundError|Cannot find module|no matching package|could not resolve dependency|unresolved import)")
        .expect("module-missing pattern")
});

static SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(SyntaxError|unexpected token|expected `|parse error|invalid syntax)")
        .expect("syntax pattern")
});

static BUILD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(error\[E\d+\]|compilation failed|cannot find symbol|build failed|undefined reference|TS\d{4}:)")
        .expect("build pattern")
});

static TEST_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+ (failing|failed)|test result: FAILED|FAILED \(|AssertionError|assertion `?failed|✗|✖|FAIL\s)")
        .expect("test-failure pattern")
});

static TIMEOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timed? ?out|ETIMEDOUT|deadline exceeded|exceeded the maximum execution time)")
        .expect("timeout pattern")
});

static RUNTIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(TypeError|ReferenceError|NullPointerException|panicked at|Traceback \(most recent call last\)|Segmentation fault|ECONNREFUSED)")
        .expect("runtime pattern")
});

static CONFIGURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(missing environment variable|ENOENT|no such file or directory|invalid config|permission denied|EACCES)")
        .expect("configuration pattern")
});

/// File paths mentioned in error output.
static PATH_IN_LOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)([A-Za-z0-9_./\-]+\.(?:rs|ts|tsx|js|jsx|py|go|java|rb|ex|yml|yaml|toml|json))(?::\d+)?")
        .expect("path pattern")
});

/// Lines that look like the start of an independent error.
static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(error|err!|e:|fatal|panic)").expect("error-line pattern")
});

/// Does the log indicate a missing module/dependency?
#[must_use]
pub fn is_module_missing(log: &str) -> bool {
    MODULE_MISSING.is_match(log)
}

/// Category with pattern precedence: dependency and syntax beat the
/// broader runtime/test buckets.
#[must_use]
pub fn categorize(log: &str) -> ErrorCategory {
    if MODULE_MISSING.is_match(log) {
        ErrorCategory::Dependency
    } else if SYNTAX.is_match(log) {
        ErrorCategory::Syntax
    } else if TIMEOUT.is_match(log) {
        ErrorCategory::Timeout
    } else if BUILD.is_match(log) {
        ErrorCategory::Build
    } else if TEST_FAILURE.is_match(log) {
        ErrorCategory::TestFailure
    } else if RUNTIME.is_match(log) {
        ErrorCategory::Runtime
    } else if CONFIGURATION.is_match(log) {
        ErrorCategory::Configuration
    } else {
        ErrorCategory::Unknown
    }
}

/// Distinct files referenced by the log, in first-seen order.
#[must_use]
pub fn affected_files(log: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for capture in PATH_IN_LOG.captures_iter(log) {
        let path = capture[1].to_string();
        // Workflow step output frequently repeats the same path.
        if !seen.contains(&path) {
            seen.push(path);
        }
        if seen.len() >= 20 {
            break;
        }
    }
    seen
}

fn suggested_action(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Syntax => "Fix the syntax error at the reported location",
        ErrorCategory::Dependency => "Install or pin the missing dependency",
        ErrorCategory::Runtime => "Trace the runtime error to its source and guard it",
        ErrorCategory::Build => "Fix the compilation error and rebuild",
        ErrorCategory::TestFailure => "Make the failing assertion pass without weakening the test",
        ErrorCategory::Timeout => "Find the hang or slow path and bound it",
        ErrorCategory::Configuration => "Correct the missing file or environment variable",
        ErrorCategory::Unknown => "Read the full log and identify the root cause",
    }
}

/// Classify a failure log, folding in attempt history: repeated passes
/// over the same category lower confidence, since the obvious reading
/// has already failed to produce a fix.
#[must_use]
pub fn classify_with_history(
    log: &str,
    main_path: Option<&str>,
    previous_categories: &[ErrorCategory],
) -> Classification {
    let category = categorize(log);
    let mut files = affected_files(log);
    if let Some(path) = main_path {
        if !files.iter().any(|f| f == path) {
            files.insert(0, path.to_string());
        }
    }

    let repeats = previous_categories
        .iter()
        .filter(|c| **c == category)
        .count() as f64;
    let base = if category == ErrorCategory::Unknown {
        0.3
    } else {
        0.85
    };
    let confidence = (base - repeats * 0.15).max(0.1);

    Classification {
        category,
        affected_files: files,
        confidence,
        suggested_action: suggested_action(category).to_string(),
    }
}

fn base_complexity(category: ErrorCategory) -> u8 {
    match category {
        ErrorCategory::Syntax => 2,
        ErrorCategory::Dependency => 3,
        ErrorCategory::Configuration => 4,
        ErrorCategory::TestFailure | ErrorCategory::Unknown => 5,
        ErrorCategory::Build | ErrorCategory::Runtime => 6,
        ErrorCategory::Timeout => 7,
    }
}

/// Problem complexity in 1..=10. Category sets the floor; cascading
/// error output raises it.
#[must_use]
pub fn estimate_complexity(log: &str, category: ErrorCategory) -> u8 {
    let mut complexity = base_complexity(category);
    let error_lines = ERROR_LINE.find_iter(log).count();
    if error_lines > 15 {
        complexity = complexity.saturating_add(3);
    } else if error_lines > 5 {
        complexity = complexity.saturating_add(2);
    }
    complexity.clamp(1, 10)
}

/// Atomicity: the last three estimates are monotone non-increasing and
/// the latest sits below 4. A problem that stops shrinking is a signal
/// to commit rather than decompose further.
#[must_use]
pub fn is_atomic(complexity_history: &[u8]) -> bool {
    const TAIL: usize = 3;
    const THRESHOLD: u8 = 4;

    if complexity_history.is_empty() {
        return false;
    }
    let tail = &complexity_history[complexity_history.len().saturating_sub(TAIL)..];
    let monotone = tail.windows(2).all(|w| w[1] <= w[0]);
    monotone && *tail.last().expect("non-empty tail") < THRESHOLD
}
