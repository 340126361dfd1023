//! Path-resolution guard.
//!
//! Wraps a sandbox and intercepts file-reading commands whose target
//! path does not exist. A single fuzzy match rewrites the command to
//! the real path; multiple matches refuse with a candidate list; no
//! match records a hallucination with the loop detector, which may ask
//! for a `[SYSTEM ADVICE]` appendix on the output to steer the next
//! model turn.

use async_trait::async_trait;
use std::sync::Arc;

use crate::{ExecOptions, ExecOutput, ResourceStats, Sandbox, SandboxResult};

/// Commands whose first path argument is worth resolving.
const READ_COMMANDS: &[&str] = &["cat", "less", "more", "head", "tail"];

/// Maximum candidates enumerated before refusing outright.
const MAX_CANDIDATES: usize = 10;

/// Receiver for hallucinated-path reports. The per-session loop
/// detector implements this.
pub trait HallucinationSink: Send + Sync {
    /// Record one hallucinated path. Returns true when the consecutive
    /// count crosses the strategy-shift threshold.
    fn record_hallucination(&self, path: &str) -> bool;

    /// The advisory text appended to tool output on a strategy shift.
    fn advisory(&self, path: &str) -> String;
}

/// A sandbox wrapped with path resolution.
pub struct GuardedSandbox {
    inner: Arc<dyn Sandbox>,
    sink: Arc<dyn HallucinationSink>,
}

impl GuardedSandbox {
    pub fn new(inner: Arc<dyn Sandbox>, sink: Arc<dyn HallucinationSink>) -> Self {
        Self { inner, sink }
    }

    /// The first path-looking argument of a read command, if any.
    fn target_path(command: &str) -> Option<(String, String)> {
        let mut tokens = command.split_whitespace();
        let program = tokens.next()?;
        if !READ_COMMANDS.contains(&program) {
            return None;
        }
        let path = tokens.find(|t| !t.starts_with('-'))?;
        Some((program.to_string(), path.to_string()))
    }

    async fn path_exists(&self, path: &str) -> SandboxResult<bool> {
        let output = self
            .inner
            .run_argv(
                &["test".into(), "-e".into(), path.into()],
                &ExecOptions::default(),
            )
            .await?;
        Ok(output.success())
    }

    /// Search the sandbox tree for files matching the basename.
    async fn fuzzy_candidates(&self, path: &str) -> SandboxResult<Vec<String>> {
        let basename = path.rsplit('/').next().unwrap_or(path);
        let output = self
            .inner
            .run_argv(
                &[
                    "find".into(),
                    ".".into(),
                    "-name".into(),
                    basename.into(),
                    "-not".into(),
                    "-path".into(),
                    "*/node_modules/*".into(),
                    "-not".into(),
                    "-path".into(),
                    "*/.git/*".into(),
                ],
                &ExecOptions::default(),
            )
            .await?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(MAX_CANDIDATES + 1)
            .map(String::from)
            .collect())
    }
}

#[async_trait]
impl Sandbox for GuardedSandbox {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn init(&self) -> SandboxResult<()> {
        self.inner.init().await
    }

    async fn run_command(&self, command: &str, options: &ExecOptions) -> SandboxResult<ExecOutput> {
        let Some((program, path)) = Self::target_path(command) else {
            return self.inner.run_command(command, options).await;
        };

        if self.path_exists(&path).await? {
            return self.inner.run_command(command, options).await;
        }

        let candidates = self.fuzzy_candidates(&path).await?;
        match candidates.len() {
            0 => {
                let shift = self.sink.record_hallucination(&path);
                let mut output = self.inner.run_command(command, options).await?;
                if shift {
                    let advisory = self.sink.advisory(&path);
                    output.stderr = if output.stderr.is_empty() {
                        advisory
                    } else {
                        format!("{}\n{advisory}", output.stderr)
                    };
                }
                Ok(output)
            }
            1 => {
                let resolved = command.replacen(&path, &candidates[0], 1);
                tracing::debug!(from = %path, to = %candidates[0], "rewrote hallucinated path");
                self.inner.run_command(&resolved, options).await
            }
            found => {
                let listing = candidates.join("\n  ");
                let suffix = if found > MAX_CANDIDATES {
                    "\n  ... (more matches omitted)"
                } else {
                    ""
                };
                Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: format!(
                        "{program}: '{path}' does not exist. Did you mean one of:\n  {listing}{suffix}"
                    ),
                    exit_code: 1,
                })
            }
        }
    }

    async fn run_argv(&self, argv: &[String], options: &ExecOptions) -> SandboxResult<ExecOutput> {
        self.inner.run_argv(argv, options).await
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        self.inner.write_file(path, content).await
    }

    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        self.inner.read_file(path).await
    }

    async fn resource_stats(&self) -> SandboxResult<Option<ResourceStats>> {
        self.inner.resource_stats().await
    }

    async fn teardown(&self) -> SandboxResult<()> {
        self.inner.teardown().await
    }
}
