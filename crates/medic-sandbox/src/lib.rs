//! Uniform sandbox lifecycle over four execution backends.
//!
//! The repair graph drives one contract (init, exec, read/write files,
//! observe resources, teardown) regardless of whether commands land in
//! an ephemeral cloud micro-VM, a local Docker container, a Kubernetes
//! Job, or (for tests) a bare temp directory. All methods are fallible
//! with typed errors; see `SandboxError`.

mod docker;
mod error;
mod guard;
mod kubernetes;
mod monitor;
mod simulation;
mod vm;

pub use docker::DockerSandbox;
pub use error::{SandboxError, SandboxResult};
pub use guard::{GuardedSandbox, HallucinationSink};
pub use kubernetes::KubernetesSandbox;
pub use monitor::{ResourceHealth, ResourceMonitor};
pub use simulation::SimulationSandbox;
pub use vm::MicroVmSandbox;

use async_trait::async_trait;
use medic_config::{ExecutionBackend, RepairConfig};
use std::sync::Arc;
use std::time::Duration;

/// Exit code shells report for an unknown command.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Options for one command execution.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub cwd: Option<String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            cwd: None,
        }
    }
}

impl ExecOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            cwd: None,
        }
    }
}

/// Captured output of one command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Shell-level "command not found": exit 127 or the stderr marker.
    #[must_use]
    pub fn is_command_not_found(&self) -> bool {
        self.exit_code == EXIT_COMMAND_NOT_FOUND
            || self.stderr.to_lowercase().contains("command not found")
    }

    /// Both streams, stdout first, for feedback strings.
    #[must_use]
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Point-in-time resource usage of the sandbox environment.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub pids: u64,
}

/// The uniform sandbox contract.
///
/// One exec runs at a time per sandbox; implementations serialize
/// internally so concurrent callers queue rather than interleave.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend name for logs and telemetry.
    fn backend(&self) -> &'static str;

    /// Acquire the environment. Idempotent once successful.
    async fn init(&self) -> SandboxResult<()>;

    /// Run a shell command line (`sh -c`).
    async fn run_command(&self, command: &str, options: &ExecOptions) -> SandboxResult<ExecOutput>;

    /// Run an argv directly, without shell interpretation. The
    /// trust-sensitive paths use this variant.
    async fn run_argv(&self, argv: &[String], options: &ExecOptions) -> SandboxResult<ExecOutput>;

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()>;

    async fn read_file(&self, path: &str) -> SandboxResult<String>;

    /// Resource usage, if the backend can observe it.
    async fn resource_stats(&self) -> SandboxResult<Option<ResourceStats>>;

    /// Release all resources. Idempotent; safe to call repeatedly.
    async fn teardown(&self) -> SandboxResult<()>;
}

/// Construct the backend selected by configuration. The Kubernetes
/// backend loads the ambient cluster config, so construction itself is
/// fallible.
pub async fn create_sandbox(config: &RepairConfig) -> SandboxResult<Arc<dyn Sandbox>> {
    let sandbox: Arc<dyn Sandbox> = match config.execution_backend {
        ExecutionBackend::DockerLocal => Arc::new(DockerSandbox::new(&config.sandbox)?),
        ExecutionBackend::Kubernetes => Arc::new(KubernetesSandbox::new(&config.sandbox).await?),
        ExecutionBackend::E2b => Arc::new(MicroVmSandbox::new(&config.sandbox)?),
        ExecutionBackend::Simulation => Arc::new(SimulationSandbox::new()?),
    };
    tracing::info!(backend = sandbox.backend(), "sandbox created");
    Ok(sandbox)
}

/// Single-quote a path for embedding in a shell command line.
pub(crate) fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_not_found_detection() {
        let by_code = ExecOutput {
            exit_code: 127,
            ..Default::default()
        };
        assert!(by_code.is_command_not_found());

        let by_stderr = ExecOutput {
            exit_code: 1,
            stderr: "sh: pytest: command not found".into(),
            ..Default::default()
        };
        assert!(by_stderr.is_command_not_found());

        let plain_failure = ExecOutput {
            exit_code: 1,
            stderr: "assertion failed".into(),
            ..Default::default()
        };
        assert!(!plain_failure.is_command_not_found());
    }

    #[test]
    fn test_combined_output() {
        let output = ExecOutput {
            stdout: "ran 3 tests".into(),
            stderr: "1 failed".into(),
            exit_code: 1,
        };
        assert_eq!(output.combined(), "ran 3 tests\n1 failed");
    }

    #[test]
    fn test_shell_quote_escapes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
