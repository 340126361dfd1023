//! Ephemeral cloud micro-VM backend.
//!
//! Thin HTTP client against the provider API: create a VM, exec
//! commands, push/pull files, kill the VM. Bearer auth throughout. The
//! provider enforces its own resource limits; we surface whatever usage
//! it reports.

use async_trait::async_trait;
use medic_config::SandboxConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{ExecOptions, ExecOutput, ResourceStats, Sandbox, SandboxError, SandboxResult};

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    cmd: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i32,
    #[serde(default)]
    timed_out: bool,
}

#[derive(Debug, Serialize)]
struct WriteFileRequest<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReadFileResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    cpu_percent: f64,
    memory_percent: f64,
    pids: u64,
}

/// Cloud micro-VM sandbox.
pub struct MicroVmSandbox {
    client: Client,
    base_url: String,
    api_key: String,
    image: String,
    vm: Mutex<Option<String>>,
    exec_lock: Mutex<()>,
}

impl MicroVmSandbox {
    pub fn new(config: &SandboxConfig) -> SandboxResult<Self> {
        let base_url = config
            .vm_base_url
            .clone()
            .ok_or_else(|| SandboxError::Transport("vm_base_url not configured".into()))?;
        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.vm_api_key.clone().unwrap_or_default(),
            image: config.image.clone(),
            vm: Mutex::new(None),
            exec_lock: Mutex::new(()),
        })
    }

    async fn vm_id(&self) -> SandboxResult<String> {
        self.vm
            .lock()
            .await
            .clone()
            .ok_or(SandboxError::NotInitialized)
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> SandboxResult<T> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        if status == 429 || status == 507 {
            return Err(SandboxError::ResourceExhausted(
                body.chars().take(200).collect(),
            ));
        }
        if status >= 400 {
            return Err(SandboxError::Transport(format!(
                "provider returned HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| SandboxError::Transport(format!("malformed provider response: {e}")))
    }
}

#[async_trait]
impl Sandbox for MicroVmSandbox {
    fn backend(&self) -> &'static str {
        "e2b"
    }

    async fn init(&self) -> SandboxResult<()> {
        let mut vm = self.vm.lock().await;
        if vm.is_some() {
            return Ok(());
        }

        let created: CreateResponse = self
            .send(
                self.client
                    .post(format!("{}/sandboxes", self.base_url))
                    .json(&CreateRequest { image: &self.image }),
            )
            .await?;

        tracing::info!(vm = %created.id, "micro-VM sandbox ready");
        *vm = Some(created.id);
        Ok(())
    }

    async fn run_command(&self, command: &str, options: &ExecOptions) -> SandboxResult<ExecOutput> {
        let id = self.vm_id().await?;
        let _guard = self.exec_lock.lock().await;

        let response: ExecResponse = self
            .send(
                self.client
                    .post(format!("{}/sandboxes/{id}/exec", self.base_url))
                    .json(&ExecRequest {
                        cmd: command,
                        cwd: options.cwd.as_deref(),
                        timeout_ms: options.timeout.as_millis() as u64,
                    }),
            )
            .await?;

        if response.timed_out {
            return Err(SandboxError::Timeout(options.timeout));
        }
        Ok(ExecOutput {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_code: response.exit_code,
        })
    }

    async fn run_argv(&self, argv: &[String], options: &ExecOptions) -> SandboxResult<ExecOutput> {
        // The provider API is line-oriented; quote each argv element.
        let command = argv
            .iter()
            .map(|a| crate::shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        self.run_command(&command, options).await
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        let id = self.vm_id().await?;
        let _: serde_json::Value = self
            .send(
                self.client
                    .put(format!("{}/sandboxes/{id}/files", self.base_url))
                    .json(&WriteFileRequest { path, content }),
            )
            .await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        let id = self.vm_id().await?;
        let response: ReadFileResponse = self
            .send(
                self.client
                    .get(format!("{}/sandboxes/{id}/files", self.base_url))
                    .query(&[("path", path)]),
            )
            .await?;
        Ok(response.content)
    }

    async fn resource_stats(&self) -> SandboxResult<Option<ResourceStats>> {
        let id = self.vm_id().await?;
        let response: StatsResponse = self
            .send(
                self.client
                    .get(format!("{}/sandboxes/{id}/stats", self.base_url)),
            )
            .await?;
        Ok(Some(ResourceStats {
            cpu_percent: response.cpu_percent,
            memory_percent: response.memory_percent,
            pids: response.pids,
        }))
    }

    async fn teardown(&self) -> SandboxResult<()> {
        let mut vm = self.vm.lock().await;
        let Some(id) = vm.take() else {
            return Ok(());
        };

        let response = self
            .client
            .delete(format!("{}/sandboxes/{id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(SandboxError::Transport(format!(
                "teardown returned HTTP {}",
                response.status()
            )));
        }
        tracing::info!(vm = %id, "micro-VM sandbox released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> SandboxConfig {
        SandboxConfig {
            vm_base_url: Some(server.uri()),
            vm_api_key: Some("vm-key".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_init_exec_teardown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "vm-1"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sandboxes/vm-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stdout": "ok\n", "stderr": "", "exit_code": 0
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/sandboxes/vm-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let sandbox = MicroVmSandbox::new(&config_for(&server)).unwrap();
        sandbox.init().await.unwrap();
        let output = sandbox
            .run_command("echo ok", &ExecOptions::default())
            .await
            .unwrap();
        assert!(output.success());
        sandbox.teardown().await.unwrap();
        sandbox.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_provider_timeout_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "vm-2"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sandboxes/vm-2/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stdout": "", "stderr": "", "exit_code": -1, "timed_out": true
            })))
            .mount(&server)
            .await;

        let sandbox = MicroVmSandbox::new(&config_for(&server)).unwrap();
        sandbox.init().await.unwrap();
        let err = sandbox
            .run_command(
                "sleep 600",
                &ExecOptions::with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_exec_before_init_fails() {
        let server = MockServer::start().await;
        let sandbox = MicroVmSandbox::new(&config_for(&server)).unwrap();
        let err = sandbox
            .run_command("ls", &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotInitialized));
    }
}
