//! Static runbook patterns: structured repair templates for failure
//! shapes the fleet has seen often enough to hard-code. Read-only;
//! matched by fingerprint substring, category, and tags.

use crate::state::ErrorCategory;

/// One repair template.
#[derive(Debug, Clone)]
pub struct RunbookPattern {
    /// Substring matched against the error fingerprint/log.
    pub error_fingerprint: &'static str,
    pub error_category: ErrorCategory,
    pub tags: &'static [&'static str],
    /// The repair recipe injected into prompts.
    pub template: &'static str,
}

/// The built-in runbook.
pub const RUNBOOK: &[RunbookPattern] = &[
    RunbookPattern {
        error_fingerprint: "Cannot find module",
        error_category: ErrorCategory::Dependency,
        tags: &["node", "npm"],
        template: "Install the missing package with `npm install <name>`; if it is a \
                   workspace package, check the workspaces field in package.json.",
    },
    RunbookPattern {
        error_fingerprint: "ModuleNotFoundError",
        error_category: ErrorCategory::Dependency,
        tags: &["python", "pip"],
        template: "Add the missing module to requirements.txt (or pyproject) and \
                   `pip install -r requirements.txt`.",
    },
    RunbookPattern {
        error_fingerprint: "error[E0",
        error_category: ErrorCategory::Build,
        tags: &["rust", "cargo"],
        template: "Read the rustc error code explanation; fix the type or borrow at the \
                   reported span rather than silencing the lint.",
    },
    RunbookPattern {
        error_fingerprint: "ETIMEDOUT",
        error_category: ErrorCategory::Timeout,
        tags: &["network", "flaky"],
        template: "Retry once; if it persists, pin the registry mirror or raise the \
                   client timeout in CI config.",
    },
    RunbookPattern {
        error_fingerprint: "Permission denied",
        error_category: ErrorCategory::Configuration,
        tags: &["ci", "filesystem"],
        template: "chmod +x the script in the repo (git update-index --chmod=+x) instead \
                   of chmodding in CI.",
    },
];

/// Best template for a log and category, if the runbook knows one.
#[must_use]
pub fn match_runbook(log: &str, category: ErrorCategory) -> Option<&'static RunbookPattern> {
    RUNBOOK
        .iter()
        .find(|p| p.error_category == category && log.contains(p.error_fingerprint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_requires_category_and_fingerprint() {
        let log = "Error: Cannot find module 'lodash'";
        let hit = match_runbook(log, ErrorCategory::Dependency).unwrap();
        assert!(hit.template.contains("npm install"));

        // Same text, wrong category: no match.
        assert!(match_runbook(log, ErrorCategory::Runtime).is_none());
    }

    #[test]
    fn test_no_match_for_unknown_text() {
        assert!(match_runbook("exit status 1", ErrorCategory::Unknown).is_none());
    }
}
