//! Local Docker backend.
//!
//! `init` creates a long-lived worker container running `sleep infinity`
//! under the configured image, with CPU, memory, and PID limits applied
//! at creation. Commands run as exec sessions against the worker; on a
//! timeout the container is restarted, which reaps whatever was left
//! running.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use medic_config::SandboxConfig;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    shell_quote, ExecOptions, ExecOutput, ResourceStats, Sandbox, SandboxError, SandboxResult,
};

const NANO_CPUS_PER_CPU: f64 = 1_000_000_000.0;

/// Docker worker-container sandbox.
pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
    container: Mutex<Option<String>>,
    exec_lock: Mutex<()>,
}

impl DockerSandbox {
    pub fn new(config: &SandboxConfig) -> SandboxResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        Ok(Self {
            docker,
            config: config.clone(),
            container: Mutex::new(None),
            exec_lock: Mutex::new(()),
        })
    }

    async fn container_name(&self) -> SandboxResult<String> {
        self.container
            .lock()
            .await
            .clone()
            .ok_or(SandboxError::NotInitialized)
    }

    async fn exec(
        &self,
        name: &str,
        argv: Vec<String>,
        options: &ExecOptions,
        stdin: Option<&str>,
    ) -> SandboxResult<ExecOutput> {
        let _guard = self.exec_lock.lock().await;

        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(stdin.is_some()),
                    working_dir: options.cwd.clone(),
                    cmd: Some(argv),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        let StartExecResults::Attached {
            mut output,
            mut input,
        } = started
        else {
            return Err(SandboxError::Transport("exec started detached".into()));
        };

        if let Some(content) = stdin {
            input
                .write_all(content.as_bytes())
                .await
                .map_err(|e| SandboxError::Io(e.to_string()))?;
            input
                .shutdown()
                .await
                .map_err(|e| SandboxError::Io(e.to_string()))?;
        }
        drop(input);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let collect = async {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(SandboxError::Transport(e.to_string())),
                }
            }
            Ok(())
        };

        if tokio::time::timeout(options.timeout, collect).await.is_err() {
            // Restart reaps the stuck process; the worker comes back up
            // with its `sleep infinity` entrypoint.
            if let Err(e) = self.docker.restart_container(name, None).await {
                tracing::warn!(error = %e, "failed to restart container after timeout");
            }
            return Err(SandboxError::Timeout(options.timeout));
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1) as i32,
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn backend(&self) -> &'static str {
        "docker_local"
    }

    async fn init(&self) -> SandboxResult<()> {
        let mut container = self.container.lock().await;
        if container.is_some() {
            return Ok(());
        }

        let name = format!("medic-sbx-{}", Uuid::new_v4().simple());
        let host_config = HostConfig {
            nano_cpus: Some((self.config.cpu_limit * NANO_CPUS_PER_CPU) as i64),
            memory: Some(self.config.memory_limit_bytes),
            pids_limit: Some(self.config.pids_limit),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                Config {
                    image: Some(self.config.image.as_str()),
                    cmd: Some(vec!["sleep", "infinity"]),
                    host_config: Some(host_config),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        tracing::info!(container = %name, image = %self.config.image, "docker sandbox ready");
        *container = Some(name);
        Ok(())
    }

    async fn run_command(&self, command: &str, options: &ExecOptions) -> SandboxResult<ExecOutput> {
        let name = self.container_name().await?;
        self.exec(
            &name,
            vec!["sh".into(), "-c".into(), command.into()],
            options,
            None,
        )
        .await
    }

    async fn run_argv(&self, argv: &[String], options: &ExecOptions) -> SandboxResult<ExecOutput> {
        let name = self.container_name().await?;
        self.exec(&name, argv.to_vec(), options, None).await
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        let name = self.container_name().await?;
        let quoted = shell_quote(path);
        let script = match path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => {
                format!("mkdir -p {} && cat > {quoted}", shell_quote(dir))
            }
            _ => format!("cat > {quoted}"),
        };
        let output = self
            .exec(
                &name,
                vec!["sh".into(), "-c".into(), script],
                &ExecOptions::default(),
                Some(content),
            )
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(SandboxError::Io(format!(
                "write {path} failed: {}",
                output.stderr.trim()
            )))
        }
    }

    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        let name = self.container_name().await?;
        let output = self
            .exec(
                &name,
                vec!["cat".into(), path.into()],
                &ExecOptions::default(),
                None,
            )
            .await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(SandboxError::Io(format!(
                "read {path} failed: {}",
                output.stderr.trim()
            )))
        }
    }

    async fn resource_stats(&self) -> SandboxResult<Option<ResourceStats>> {
        let name = self.container_name().await?;
        let mut stream = self.docker.stats(
            &name,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );

        let Some(stats) = stream.next().await else {
            return Ok(None);
        };
        let stats = stats.map_err(|e| SandboxError::Transport(e.to_string()))?;

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        let cpu_percent = if system_delta > 0.0 {
            cpu_delta / system_delta * online_cpus * 100.0
        } else {
            0.0
        };

        let memory_usage = stats.memory_stats.usage.unwrap_or(0) as f64;
        let memory_limit = stats.memory_stats.limit.unwrap_or(0) as f64;
        let memory_percent = if memory_limit > 0.0 {
            memory_usage / memory_limit * 100.0
        } else {
            0.0
        };

        Ok(Some(ResourceStats {
            cpu_percent,
            memory_percent,
            pids: stats.pids_stats.current.unwrap_or(0),
        }))
    }

    async fn teardown(&self) -> SandboxResult<()> {
        let mut container = self.container.lock().await;
        let Some(name) = container.take() else {
            return Ok(());
        };

        self.docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        tracing::info!(container = %name, "docker sandbox removed");
        Ok(())
    }
}
