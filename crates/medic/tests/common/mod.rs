//! Shared test doubles: a scripted LLM provider routed by prompt
//! markers, a static source host, and a session builder over the
//! simulation sandbox and an in-memory store.

use async_trait::async_trait;
use medic::context::{GraphContext, Services};
use medic::loopdetect::LoopDetector;
use medic::recovery::RecoveryStrategyService;
use medic::reflection::ReflectionSystem;
use medic::reproduce::ReproductionInference;
use medic::state::{GraphState, RunGroup};
use medic::telemetry::{ReliabilityMetrics, ReliabilityTelemetry};
use medic::thresholds::AdaptiveThresholdService;
use medic_config::RepairConfig;
use medic_llm::{
    GenerateRequest, Generation, LlmClient, LlmError, LlmMetrics, LlmProvider, LlmResult,
    RetryPolicy,
};
use medic_sandbox::{GuardedSandbox, Sandbox, SimulationSandbox};
use medic_scm::{
    language_for_path, FoundFile, LogStrategy, RepoFile, ScmError, ScmResult, SourceHost,
    WorkflowLogs,
};
use medic_store::Store;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// LLM double: responses are routed by a marker substring matched
/// against the request's messages. The last response on a route
/// repeats, so loops see stable output.
#[derive(Default)]
pub struct ScriptedLlm {
    routes: Mutex<Vec<(String, VecDeque<String>)>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on(self, marker: &str, response: impl Into<String>) -> Self {
        {
            let mut routes = self.routes.lock().unwrap();
            if let Some((_, queue)) = routes.iter_mut().find(|(m, _)| m == marker) {
                queue.push_back(response.into());
            } else {
                routes.push((marker.to_string(), VecDeque::from([response.into()])));
            }
        }
        self
    }

    pub fn into_client(self) -> LlmClient {
        LlmClient::new(
            Arc::new(self),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
            Duration::from_secs(5),
        )
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn generate(&self, request: &GenerateRequest) -> LlmResult<Generation> {
        let haystack: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut routes = self.routes.lock().unwrap();
        for (marker, queue) in routes.iter_mut() {
            if haystack.contains(marker.as_str()) {
                let response = if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap_or_default()
                };
                return Ok(Generation {
                    text: response,
                    metrics: LlmMetrics {
                        tokens_input: 10,
                        tokens_output: 10,
                        cost: 0.0,
                        latency_ms: 1,
                        model: "scripted-model".to_string(),
                    },
                });
            }
        }

        let preview: String = haystack.chars().take(120).collect();
        Err(LlmError::Client {
            status: 404,
            message: format!("no scripted route matches request: {preview}"),
        })
    }
}

/// Source-host double backed by static strings.
#[derive(Default)]
pub struct StaticHost {
    pub logs: String,
    pub files: HashMap<String, String>,
}

impl StaticHost {
    pub fn new(logs: &str) -> Self {
        Self {
            logs: logs.to_string(),
            files: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }

    fn repo_file(&self, path: &str, content: &str) -> RepoFile {
        RepoFile {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            content: content.to_string(),
            language: language_for_path(path),
        }
    }
}

#[async_trait]
impl SourceHost for StaticHost {
    async fn get_workflow_logs(
        &self,
        _run_id: u64,
        _strategy: LogStrategy,
    ) -> ScmResult<WorkflowLogs> {
        Ok(WorkflowLogs {
            log_text: self.logs.clone(),
            head_sha: "abc123".to_string(),
            job_name: Some("test".to_string()),
        })
    }

    async fn get_file_content(&self, path: &str) -> ScmResult<RepoFile> {
        match self.files.get(path) {
            Some(content) => Ok(self.repo_file(path, content)),
            None => Err(ScmError::NotFound(path.to_string())),
        }
    }

    async fn find_closest_file(&self, path: &str) -> ScmResult<Option<FoundFile>> {
        if let Some(content) = self.files.get(path) {
            return Ok(Some(FoundFile {
                path: path.to_string(),
                file: self.repo_file(path, content),
            }));
        }
        let wanted = path.rsplit('/').next().unwrap_or(path);
        for (known, content) in &self.files {
            if known.rsplit('/').next() == Some(wanted) {
                return Ok(Some(FoundFile {
                    path: known.clone(),
                    file: self.repo_file(known, content),
                }));
            }
        }
        Ok(None)
    }
}

/// One wired-up session over the simulation sandbox.
pub struct TestSession {
    pub ctx: GraphContext,
    pub store: Store,
    pub state: GraphState,
    pub run_id: String,
}

pub async fn build_session(
    llm: ScriptedLlm,
    host: StaticHost,
    config: RepairConfig,
    log_text: &str,
) -> TestSession {
    let store = Store::connect_in_memory().await.unwrap();
    let services = Services {
        llm: llm.into_client(),
        host: Arc::new(host),
        store: store.clone(),
    };

    let mut state = GraphState::new(config.clone(), RunGroup::single("group-1", 42));
    state.current_log_text = log_text.to_string();

    let snapshot = serde_json::to_string(&state).unwrap();
    let run = store.create_run("group-1", &snapshot).await.unwrap();

    let detector = Arc::new(LoopDetector::new(config.loop_detector));
    let inner = Arc::new(SimulationSandbox::new().unwrap());
    let sandbox: Arc<dyn Sandbox> = Arc::new(GuardedSandbox::new(inner, detector.clone()));
    sandbox.init().await.unwrap();

    let telemetry = ReliabilityTelemetry::new(store.clone(), true);
    let recovery = RecoveryStrategyService::new(
        telemetry.clone(),
        Arc::new(ReproductionInference::new(None)),
    );
    let thresholds = AdaptiveThresholdService::new(
        config.adaptive_thresholds.clone(),
        ReliabilityMetrics::new(store.clone()),
    );
    let reflection = Arc::new(ReflectionSystem::new(store.clone()));

    let ctx = GraphContext {
        services,
        sandbox,
        loop_detector: detector,
        telemetry,
        recovery,
        thresholds,
        reflection,
        run_id: run.id.clone(),
        cancel: CancellationToken::new(),
        log_tx: None,
    };

    TestSession {
        ctx,
        store,
        state,
        run_id: run.id,
    }
}

/// Reload the persisted state snapshot for a run.
pub async fn persisted_state(store: &Store, run_id: &str) -> GraphState {
    let run = store.get_run(run_id).await.unwrap();
    serde_json::from_str(&run.state).unwrap()
}
