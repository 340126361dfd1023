//! Source-host capability: workflow log retrieval, file fetch, and
//! closest-file lookup.
//!
//! The engine consumes the `SourceHost` trait; the default
//! implementation talks to a GitHub-style REST API. Tests substitute
//! their own impls.

use async_trait::async_trait;
use medic_config::RepairConfig;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

/// Errors from the source-host capability.
#[derive(Debug, Error)]
pub enum ScmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("host API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("no failed job found for run {run_id}")]
    NoFailedJob { run_id: u64 },
}

pub type ScmResult<T> = Result<T, ScmError>;

/// How aggressively to look for failure logs. The analysis node walks
/// this ladder across iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStrategy {
    /// Failed jobs only, full log text.
    Extended,
    /// Any job whose conclusion is not success.
    AnyError,
    /// Latest job regardless of conclusion.
    ForceLatest,
}

impl LogStrategy {
    /// Strategy for a given 0-based iteration; `None` past the ladder.
    #[must_use]
    pub fn for_iteration(iteration: u32) -> Option<Self> {
        match iteration {
            0 => Some(Self::Extended),
            1 => Some(Self::AnyError),
            2 => Some(Self::ForceLatest),
            _ => None,
        }
    }
}

/// Retrieved workflow logs.
#[derive(Debug, Clone)]
pub struct WorkflowLogs {
    pub log_text: String,
    pub head_sha: String,
    pub job_name: Option<String>,
}

/// A fetched repository file.
#[derive(Debug, Clone)]
pub struct RepoFile {
    pub name: String,
    pub content: String,
    pub language: String,
}

/// A closest-file lookup hit.
#[derive(Debug, Clone)]
pub struct FoundFile {
    pub path: String,
    pub file: RepoFile,
}

/// The host contract the repair graph depends on.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Fetch logs for a workflow run using the given strategy.
    async fn get_workflow_logs(&self, run_id: u64, strategy: LogStrategy)
        -> ScmResult<WorkflowLogs>;

    /// Fetch one file's content at the repository head.
    async fn get_file_content(&self, path: &str) -> ScmResult<RepoFile>;

    /// Find the repository file closest to `path` (exact match first,
    /// then basename match with the fewest extra path segments).
    async fn find_closest_file(&self, path: &str) -> ScmResult<Option<FoundFile>>;
}

/// Map a file extension to a language tag for prompts.
#[must_use]
pub fn language_for_path(path: &str) -> String {
    let ext = path.rsplit('.').next().unwrap_or_default();
    match ext {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "ex" | "exs" => "elixir",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "json" => "json",
        "sh" => "shell",
        _ => "text",
    }
    .to_string()
}

// ── GitHub-style implementation ──

#[derive(Debug, Deserialize)]
struct JobsResponse {
    jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct Job {
    id: u64,
    name: String,
    conclusion: Option<String>,
    head_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

/// GitHub-flavored `SourceHost` over the REST API.
pub struct GitHubHost {
    client: Client,
    base_url: String,
    repo: String,
    token: Option<String>,
}

impl GitHubHost {
    #[must_use]
    pub fn from_config(config: &RepairConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.host.trim_end_matches('/').to_string(),
            repo: config.repo.clone(),
            token: config.token.clone(),
        }
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .get(url)
            .header("user-agent", "medic-repair-engine")
            .header("accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn get_text(&self, url: String, accept: &str) -> ScmResult<String> {
        let response = self
            .request(url)
            .header("accept", accept)
            .send()
            .await
            .map_err(|e| ScmError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ScmError::Transport(e.to_string()))?;
        match status {
            200..=299 => Ok(body),
            404 => Err(ScmError::NotFound(body.chars().take(200).collect())),
            _ => Err(ScmError::Api {
                status,
                message: body.chars().take(300).collect(),
            }),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: String) -> ScmResult<T> {
        let body = self.get_text(url, "application/vnd.github+json").await?;
        serde_json::from_str(&body)
            .map_err(|e| ScmError::Transport(format!("malformed host response: {e}")))
    }

    async fn default_branch(&self) -> ScmResult<String> {
        let info: RepoInfo = self
            .get_json(format!("{}/repos/{}", self.base_url, self.repo))
            .await?;
        Ok(info.default_branch)
    }
}

#[async_trait]
impl SourceHost for GitHubHost {
    async fn get_workflow_logs(
        &self,
        run_id: u64,
        strategy: LogStrategy,
    ) -> ScmResult<WorkflowLogs> {
        let jobs: JobsResponse = self
            .get_json(format!(
                "{}/repos/{}/actions/runs/{run_id}/jobs",
                self.base_url, self.repo
            ))
            .await?;

        tracing::debug!(run_id, ?strategy, jobs = jobs.jobs.len(), "selecting job for logs");
        let job = match strategy {
            LogStrategy::Extended => jobs
                .jobs
                .iter()
                .find(|j| j.conclusion.as_deref() == Some("failure")),
            LogStrategy::AnyError => jobs
                .jobs
                .iter()
                .find(|j| j.conclusion.as_deref().is_some_and(|c| c != "success")),
            LogStrategy::ForceLatest => jobs.jobs.last(),
        }
        .ok_or(ScmError::NoFailedJob { run_id })?;

        let log_text = self
            .get_text(
                format!(
                    "{}/repos/{}/actions/jobs/{}/logs",
                    self.base_url, self.repo, job.id
                ),
                "application/vnd.github+json",
            )
            .await?;

        Ok(WorkflowLogs {
            log_text,
            head_sha: job.head_sha.clone().unwrap_or_default(),
            job_name: Some(job.name.clone()),
        })
    }

    async fn get_file_content(&self, path: &str) -> ScmResult<RepoFile> {
        let content = self
            .get_text(
                format!(
                    "{}/repos/{}/contents/{}",
                    self.base_url, self.repo, path
                ),
                "application/vnd.github.raw+json",
            )
            .await?;

        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        Ok(RepoFile {
            name,
            language: language_for_path(path),
            content,
        })
    }

    async fn find_closest_file(&self, path: &str) -> ScmResult<Option<FoundFile>> {
        // Exact hit first; the tree walk is the fallback.
        if let Ok(file) = self.get_file_content(path).await {
            return Ok(Some(FoundFile {
                path: path.to_string(),
                file,
            }));
        }

        let branch = self.default_branch().await?;
        let tree: TreeResponse = self
            .get_json(format!(
                "{}/repos/{}/git/trees/{branch}?recursive=1",
                self.base_url, self.repo
            ))
            .await?;

        let wanted = path.rsplit('/').next().unwrap_or(path);
        let best = tree
            .tree
            .iter()
            .filter(|e| e.entry_type == "blob")
            .filter(|e| e.path.rsplit('/').next() == Some(wanted))
            .min_by_key(|e| e.path.matches('/').count());

        match best {
            Some(entry) => {
                let file = self.get_file_content(&entry.path).await?;
                Ok(Some(FoundFile {
                    path: entry.path.clone(),
                    file,
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medic_config::RepairConfig;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn host_for(server: &MockServer) -> GitHubHost {
        GitHubHost::from_config(&RepairConfig {
            host: server.uri(),
            repo: "acme/widgets".into(),
            token: Some("ghs_test".into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_strategy_ladder() {
        assert_eq!(LogStrategy::for_iteration(0), Some(LogStrategy::Extended));
        assert_eq!(LogStrategy::for_iteration(1), Some(LogStrategy::AnyError));
        assert_eq!(
            LogStrategy::for_iteration(2),
            Some(LogStrategy::ForceLatest)
        );
        assert_eq!(LogStrategy::for_iteration(3), None);
    }

    #[test]
    fn test_language_mapping() {
        assert_eq!(language_for_path("src/app.ts"), "typescript");
        assert_eq!(language_for_path("main.py"), "python");
        assert_eq!(language_for_path("Makefile"), "text");
    }

    #[tokio::test]
    async fn test_extended_picks_failed_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/repos/acme/widgets/actions/runs/7/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobs": [
                    {"id": 1, "name": "lint", "conclusion": "success", "head_sha": "abc"},
                    {"id": 2, "name": "test", "conclusion": "failure", "head_sha": "abc"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/repos/acme/widgets/actions/jobs/2/logs"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Error: boom"))
            .mount(&server)
            .await;

        let logs = host_for(&server)
            .get_workflow_logs(7, LogStrategy::Extended)
            .await
            .unwrap();
        assert_eq!(logs.log_text, "Error: boom");
        assert_eq!(logs.job_name.as_deref(), Some("test"));
        assert_eq!(logs.head_sha, "abc");
    }

    #[tokio::test]
    async fn test_no_failed_job_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/repos/acme/widgets/actions/runs/9/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobs": [{"id": 1, "name": "lint", "conclusion": "success"}]
            })))
            .mount(&server)
            .await;

        let err = host_for(&server)
            .get_workflow_logs(9, LogStrategy::Extended)
            .await
            .unwrap_err();
        assert!(matches!(err, ScmError::NoFailedJob { run_id: 9 }));
    }

    #[tokio::test]
    async fn test_closest_file_by_basename() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/repos/acme/widgets/contents/app.ts"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/repos/acme/widgets"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"default_branch": "main"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/repos/acme/widgets/git/trees/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tree": [
                    {"path": "src/app.ts", "type": "blob"},
                    {"path": "legacy/deep/nested/app.ts", "type": "blob"},
                    {"path": "src/app", "type": "tree"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/repos/acme/widgets/contents/src/app.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_string("export {}"))
            .mount(&server)
            .await;

        let hit = host_for(&server)
            .find_closest_file("app.ts")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.path, "src/app.ts");
        assert_eq!(hit.file.language, "typescript");
    }
}
