//! Kubernetes Job backend.
//!
//! `init` ensures namespace-scoped RBAC (a dedicated ServiceAccount
//! allowed `batch/jobs` and `pods/exec` only), creates a Job whose pod
//! sleeps forever, and waits for the pod to reach `Running` within the
//! 120 s deadline. Commands run over WebSocket-multiplexed exec
//! streams. Teardown deletes the Job with cascading (foreground)
//! deletion; finished Jobs also self-expire via
//! `ttlSecondsAfterFinished`.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use medic_config::SandboxConfig;
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    shell_quote, ExecOptions, ExecOutput, ResourceStats, Sandbox, SandboxError, SandboxResult,
};

const SERVICE_ACCOUNT: &str = "medic-sandbox";
const POD_RUNNING_DEADLINE: Duration = Duration::from_secs(120);
const POD_POLL_INTERVAL: Duration = Duration::from_secs(2);
const JOB_TTL_SECONDS: i32 = 300;

#[derive(Debug, Clone)]
struct Placement {
    job: String,
    pod: String,
}

/// Kubernetes Job sandbox.
pub struct KubernetesSandbox {
    client: Client,
    config: SandboxConfig,
    placement: Mutex<Option<Placement>>,
    exec_lock: Mutex<()>,
}

impl KubernetesSandbox {
    pub async fn new(config: &SandboxConfig) -> SandboxResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            config: config.clone(),
            placement: Mutex::new(None),
            exec_lock: Mutex::new(()),
        })
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    async fn placement(&self) -> SandboxResult<Placement> {
        self.placement
            .lock()
            .await
            .clone()
            .ok_or(SandboxError::NotInitialized)
    }

    /// Create the ServiceAccount, Role, and RoleBinding the sandbox pods
    /// run under. Existing objects are left alone.
    async fn ensure_rbac(&self) -> SandboxResult<()> {
        let namespace = &self.config.namespace;
        let service_accounts: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), namespace);
        let roles: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);

        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(SERVICE_ACCOUNT.to_string()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        let role = Role {
            metadata: ObjectMeta {
                name: Some(format!("{SERVICE_ACCOUNT}-role")),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            rules: Some(vec![
                PolicyRule {
                    api_groups: Some(vec!["batch".to_string()]),
                    resources: Some(vec!["jobs".to_string()]),
                    verbs: vec![
                        "create".to_string(),
                        "get".to_string(),
                        "list".to_string(),
                        "delete".to_string(),
                    ],
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec![String::new()]),
                    resources: Some(vec!["pods".to_string(), "pods/exec".to_string()]),
                    verbs: vec![
                        "get".to_string(),
                        "list".to_string(),
                        "create".to_string(),
                    ],
                    ..Default::default()
                },
            ]),
        };

        let binding = RoleBinding {
            metadata: ObjectMeta {
                name: Some(format!("{SERVICE_ACCOUNT}-binding")),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: format!("{SERVICE_ACCOUNT}-role"),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: SERVICE_ACCOUNT.to_string(),
                namespace: Some(namespace.clone()),
                ..Default::default()
            }]),
        };

        create_tolerating_conflict(&service_accounts, &account).await?;
        create_tolerating_conflict(&roles, &role).await?;
        create_tolerating_conflict(&bindings, &binding).await?;
        Ok(())
    }

    fn job_manifest(&self, name: &str) -> SandboxResult<Job> {
        let memory_mib = (self.config.memory_limit_bytes / (1024 * 1024)).max(64);
        serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "labels": { "app": "medic", "component": "sandbox" }
            },
            "spec": {
                "ttlSecondsAfterFinished": JOB_TTL_SECONDS,
                "backoffLimit": 0,
                "template": {
                    "metadata": {
                        "labels": { "app": "medic", "component": "sandbox" }
                    },
                    "spec": {
                        "serviceAccountName": SERVICE_ACCOUNT,
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "worker",
                            "image": self.config.image,
                            "command": ["sleep", "infinity"],
                            "resources": {
                                "limits": {
                                    "cpu": format!("{}", self.config.cpu_limit),
                                    "memory": format!("{memory_mib}Mi")
                                }
                            }
                        }]
                    }
                }
            }
        }))
        .map_err(|e| SandboxError::Io(format!("job manifest: {e}")))
    }

    async fn wait_for_pod(&self, job_name: &str) -> SandboxResult<String> {
        let pods = self.pods();
        let selector = format!("job-name={job_name}");
        let deadline = tokio::time::Instant::now() + POD_RUNNING_DEADLINE;

        loop {
            let list = pods
                .list(&ListParams::default().labels(&selector))
                .await
                .map_err(|e| SandboxError::Transport(e.to_string()))?;

            for pod in &list.items {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or("Pending");
                if phase == "Running" {
                    let name = pod
                        .metadata
                        .name
                        .clone()
                        .ok_or_else(|| SandboxError::Transport("unnamed pod".into()))?;
                    return Ok(name);
                }
                if phase == "Failed" {
                    return Err(SandboxError::Transport(format!(
                        "sandbox pod failed before running ({job_name})"
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::Timeout(POD_RUNNING_DEADLINE));
            }
            tokio::time::sleep(POD_POLL_INTERVAL).await;
        }
    }

    async fn exec(
        &self,
        argv: &[String],
        options: &ExecOptions,
        stdin: Option<&str>,
    ) -> SandboxResult<ExecOutput> {
        let placement = self.placement().await?;
        let _guard = self.exec_lock.lock().await;

        let params = AttachParams::default()
            .stdout(true)
            .stderr(true)
            .stdin(stdin.is_some());

        let run = async {
            let mut attached = self
                .pods()
                .exec(&placement.pod, argv.iter().map(String::as_str), &params)
                .await
                .map_err(|e| SandboxError::Transport(e.to_string()))?;

            if let Some(content) = stdin {
                let mut writer = attached
                    .stdin()
                    .ok_or_else(|| SandboxError::Transport("no stdin stream".into()))?;
                writer
                    .write_all(content.as_bytes())
                    .await
                    .map_err(|e| SandboxError::Io(e.to_string()))?;
                writer
                    .shutdown()
                    .await
                    .map_err(|e| SandboxError::Io(e.to_string()))?;
            }

            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut reader) = attached.stdout() {
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| SandboxError::Transport(e.to_string()))?;
                stdout = String::from_utf8_lossy(&buf).into_owned();
            }
            if let Some(mut reader) = attached.stderr() {
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| SandboxError::Transport(e.to_string()))?;
                stderr = String::from_utf8_lossy(&buf).into_owned();
            }

            let exit_code = match attached.take_status() {
                Some(status) => exit_code_from_status(status.await),
                None => 0,
            };

            Ok(ExecOutput {
                stdout,
                stderr,
                exit_code,
            })
        };

        match tokio::time::timeout(options.timeout, run).await {
            Ok(result) => result,
            // Dropping the attach future closes the websocket; the
            // remote process is bounded by the pod's resource limits.
            Err(_) => Err(SandboxError::Timeout(options.timeout)),
        }
    }
}

/// Map the exec channel's terminal Status to a shell exit code.
fn exit_code_from_status(
    status: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Status>,
) -> i32 {
    let Some(status) = status else {
        return 0;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .and_then(|d| d.causes)
        .unwrap_or_default()
        .iter()
        .find(|c| c.reason.as_deref() == Some("ExitCode"))
        .and_then(|c| c.message.as_ref())
        .and_then(|m| m.parse().ok())
        .unwrap_or(1)
}

async fn create_tolerating_conflict<K>(api: &Api<K>, object: &K) -> SandboxResult<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
        Err(e) => Err(SandboxError::Transport(e.to_string())),
    }
}

#[async_trait]
impl Sandbox for KubernetesSandbox {
    fn backend(&self) -> &'static str {
        "kubernetes"
    }

    async fn init(&self) -> SandboxResult<()> {
        let mut placement = self.placement.lock().await;
        if placement.is_some() {
            return Ok(());
        }

        self.ensure_rbac().await?;

        let job_name = format!("medic-sbx-{}", Uuid::new_v4().simple());
        let manifest = self.job_manifest(&job_name)?;
        self.jobs()
            .create(&PostParams::default(), &manifest)
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        let pod = self.wait_for_pod(&job_name).await?;
        tracing::info!(job = %job_name, pod = %pod, "kubernetes sandbox ready");
        *placement = Some(Placement { job: job_name, pod });
        Ok(())
    }

    async fn run_command(&self, command: &str, options: &ExecOptions) -> SandboxResult<ExecOutput> {
        let line = match &options.cwd {
            Some(cwd) => format!("cd {} && {command}", shell_quote(cwd)),
            None => command.to_string(),
        };
        self.exec(&["sh".into(), "-c".into(), line], options, None)
            .await
    }

    async fn run_argv(&self, argv: &[String], options: &ExecOptions) -> SandboxResult<ExecOutput> {
        self.exec(argv, options, None).await
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        let quoted = shell_quote(path);
        let script = match path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => {
                format!("mkdir -p {} && cat > {quoted}", shell_quote(dir))
            }
            _ => format!("cat > {quoted}"),
        };
        let output = self
            .exec(
                &["sh".into(), "-c".into(), script],
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
        let output = self
            .exec(
                &["cat".into(), path.into()],
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
        // Kubelet metrics are not plumbed through; monitoring falls back
        // to the container limits enforced at the pod level.
        Ok(None)
    }

    async fn teardown(&self) -> SandboxResult<()> {
        let mut placement = self.placement.lock().await;
        let Some(Placement { job, .. }) = placement.take() else {
            return Ok(());
        };

        match self.jobs().delete(&job, &DeleteParams::foreground()).await {
            Ok(_) => {
                tracing::info!(job = %job, "kubernetes sandbox deleted");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(SandboxError::Transport(e.to_string())),
        }
    }
}
