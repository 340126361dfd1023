//! Simulation backend: commands run directly in a temporary directory.
//!
//! No isolation whatsoever. Exists for tests and reproduction dry-runs
//! on trusted input.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::{
    ExecOptions, ExecOutput, ResourceStats, Sandbox, SandboxError, SandboxResult,
    EXIT_COMMAND_NOT_FOUND,
};

/// Temp-directory sandbox.
pub struct SimulationSandbox {
    root: TempDir,
    exec_lock: Mutex<()>,
}

impl SimulationSandbox {
    pub fn new() -> SandboxResult<Self> {
        Ok(Self {
            root: TempDir::new()?,
            exec_lock: Mutex::new(()),
        })
    }

    /// Root directory commands run in.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let trimmed = path.trim_start_matches('/');
        self.root.path().join(trimmed)
    }

    async fn run(
        &self,
        mut command: Command,
        options: &ExecOptions,
        label: &str,
    ) -> SandboxResult<ExecOutput> {
        let _guard = self.exec_lock.lock().await;

        let cwd = options
            .cwd
            .as_ref()
            .map_or_else(|| self.root.path().to_path_buf(), |c| self.resolve(c));

        command
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::CommandNotFound {
                    command: label.to_string(),
                }
            } else {
                SandboxError::Io(e.to_string())
            }
        })?;

        let waited = tokio::time::timeout(options.timeout, child.wait_with_output()).await;
        match waited {
            Ok(Ok(output)) => Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(EXIT_COMMAND_NOT_FOUND),
            }),
            Ok(Err(e)) => Err(SandboxError::Io(e.to_string())),
            // kill_on_drop reaps the child once the future is dropped.
            Err(_) => Err(SandboxError::Timeout(options.timeout)),
        }
    }
}

#[async_trait]
impl Sandbox for SimulationSandbox {
    fn backend(&self) -> &'static str {
        "simulation"
    }

    async fn init(&self) -> SandboxResult<()> {
        Ok(())
    }

    async fn run_command(&self, command: &str, options: &ExecOptions) -> SandboxResult<ExecOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        self.run(cmd, options, command).await
    }

    async fn run_argv(&self, argv: &[String], options: &ExecOptions) -> SandboxResult<ExecOutput> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SandboxError::Io("empty argv".into()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        self.run(cmd, options, program).await
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&full).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        Ok(tokio::fs::read_to_string(self.resolve(path)).await?)
    }

    async fn resource_stats(&self) -> SandboxResult<Option<ResourceStats>> {
        Ok(None)
    }

    async fn teardown(&self) -> SandboxResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_echo_round_trip() {
        let sandbox = SimulationSandbox::new().unwrap();
        sandbox.init().await.unwrap();

        let output = sandbox
            .run_command("echo hello", &ExecOptions::default())
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_missing_command_is_127() {
        let sandbox = SimulationSandbox::new().unwrap();
        let output = sandbox
            .run_command("definitely-not-a-real-binary --version", &ExecOptions::default())
            .await
            .unwrap();
        assert!(output.is_command_not_found());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let sandbox = SimulationSandbox::new().unwrap();
        let err = sandbox
            .run_command(
                "sleep 30",
                &ExecOptions::with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let sandbox = SimulationSandbox::new().unwrap();
        sandbox
            .write_file("src/app.ts", "export const x = 1;")
            .await
            .unwrap();
        let content = sandbox.read_file("src/app.ts").await.unwrap();
        assert_eq!(content, "export const x = 1;");

        let output = sandbox
            .run_command("cat src/app.ts", &ExecOptions::default())
            .await
            .unwrap();
        assert!(output.stdout.contains("const x"));
    }

    #[tokio::test]
    async fn test_argv_variant_skips_shell() {
        let sandbox = SimulationSandbox::new().unwrap();
        let output = sandbox
            .run_argv(
                &["echo".to_string(), "$HOME".to_string()],
                &ExecOptions::default(),
            )
            .await
            .unwrap();
        // No shell expansion for the argv path.
        assert_eq!(output.stdout.trim(), "$HOME");
    }

    #[tokio::test]
    async fn test_teardown_idempotent() {
        let sandbox = SimulationSandbox::new().unwrap();
        sandbox.teardown().await.unwrap();
        sandbox.teardown().await.unwrap();
    }
}
