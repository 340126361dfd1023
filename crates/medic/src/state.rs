//! Graph state for one repair session.
//!
//! `GraphState` is a plain serde value: no service handles, no database
//! connections. Context (services, sandbox, telemetry) travels
//! separately so the state can be snapshotted into the `agent_runs`
//! table at every transition and reloaded cold.

use chrono::{DateTime, Utc};
use medic_config::RepairConfig;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Session status. Terminal nodes set anything but `Working`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Working,
    Success,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// The five graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Analysis,
    Planning,
    Execution,
    Verification,
    Finish,
}

impl NodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Planning => "planning",
            Self::Execution => "execution",
            Self::Verification => "verification",
            Self::Finish => "finish",
        }
    }
}

/// Failure classification categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Syntax,
    Dependency,
    Runtime,
    Build,
    TestFailure,
    Timeout,
    Configuration,
    Unknown,
}

impl ErrorCategory {
    /// Lowercase name used in persisted notes and trajectories.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Dependency => "dependency",
            Self::Runtime => "runtime",
            Self::Build => "build",
            Self::TestFailure => "test_failure",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        }
    }
}

/// How the fix is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixAction {
    Edit,
    Command,
}

/// Output of the diagnosis step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub summary: String,
    #[serde(default)]
    pub file_path: Option<String>,
    pub fix_action: FixAction,
    #[serde(default)]
    pub suggested_command: Option<String>,
    #[serde(default)]
    pub reproduction_command: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

/// Output of classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    #[serde(default)]
    pub affected_files: Vec<String>,
    pub confidence: f64,
    pub suggested_action: String,
}

/// Status of one plan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
}

/// One task inside a detailed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub target_file: Option<String>,
}

/// A detailed repair plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub tasks: Vec<PlanTask>,
    pub approved: bool,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

/// Whether a tracked file still carries its original content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Original,
    Modified,
}

/// One version of a file's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub content: String,
    pub language: String,
    pub name: String,
}

/// A file the session has touched or reserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedFile {
    pub path: String,
    pub status: FileStatus,
    pub original: FileVersion,
    #[serde(default)]
    pub modified: Option<FileVersion>,
}

/// One history entry; `history` reflects the true in-session order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node: NodeKind,
    pub action: String,
    pub result: String,
    pub timestamp: DateTime<Utc>,
}

/// A sub-problem in the optional error DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    pub id: String,
    pub problem: String,
    pub priority: i32,
    pub complexity: u8,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Decomposition of a composite failure into ordered sub-problems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDag {
    pub nodes: Vec<DagNode>,
    pub root_problem: String,
}

/// Reference to one workflow run in the session's group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunRef {
    pub run_id: u64,
    /// The main run identifies the failure under repair.
    #[serde(default)]
    pub main: bool,
}

/// The set of related workflow runs driving this session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunGroup {
    pub group_id: String,
    pub runs: Vec<WorkflowRunRef>,
}

impl RunGroup {
    #[must_use]
    pub fn single(group_id: impl Into<String>, run_id: u64) -> Self {
        Self {
            group_id: group_id.into(),
            runs: vec![WorkflowRunRef { run_id, main: true }],
        }
    }

    /// The main run, falling back to the first member.
    #[must_use]
    pub fn main_run(&self) -> Option<u64> {
        self.runs
            .iter()
            .find(|r| r.main)
            .or_else(|| self.runs.first())
            .map(|r| r.run_id)
    }
}

/// In-memory state of the repair machine for one AgentRun.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphState {
    pub config: RepairConfig,
    pub group: RunGroup,
    /// 0-based iteration counter.
    pub iteration: u32,
    pub max_iterations: u32,
    pub status: RunStatus,
    pub current_node: NodeKind,
    #[serde(default)]
    pub current_log_text: String,
    #[serde(default)]
    pub initial_log_text: String,
    #[serde(default)]
    pub initial_repo_context: String,
    #[serde(default)]
    pub diagnosis: Option<Diagnosis>,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub plan: Option<Plan>,
    /// Files keyed by path. Every reserved path has an entry here.
    #[serde(default)]
    pub files: BTreeMap<String, TrackedFile>,
    #[serde(default)]
    pub file_reservations: Vec<String>,
    /// Human-readable attempt summaries, accumulated across iterations.
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// One complexity estimate per completed analysis pass.
    #[serde(default)]
    pub complexity_history: Vec<u8>,
    #[serde(default)]
    pub problem_complexity: Option<u8>,
    #[serde(default)]
    pub refined_problem_statement: Option<String>,
    #[serde(default)]
    pub is_atomic: Option<bool>,
    #[serde(default)]
    pub error_dag: Option<ErrorDag>,
    #[serde(default)]
    pub solved_nodes: Vec<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GraphState {
    /// Fresh state at admission.
    #[must_use]
    pub fn new(config: RepairConfig, group: RunGroup) -> Self {
        let max_iterations = config.max_iterations;
        Self {
            config,
            group,
            iteration: 0,
            max_iterations,
            status: RunStatus::Working,
            current_node: NodeKind::Analysis,
            current_log_text: String::new(),
            initial_log_text: String::new(),
            initial_repo_context: String::new(),
            diagnosis: None,
            classification: None,
            plan: None,
            files: BTreeMap::new(),
            file_reservations: Vec::new(),
            feedback: Vec::new(),
            history: Vec::new(),
            complexity_history: Vec::new(),
            problem_complexity: None,
            refined_problem_statement: None,
            is_atomic: None,
            error_dag: None,
            solved_nodes: Vec::new(),
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Working
    }

    /// Append a history entry in true order.
    pub fn record(&mut self, node: NodeKind, action: &str, result: &str) {
        self.history.push(HistoryEntry {
            node,
            action: action.to_string(),
            result: result.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Mark the session failed and route to the terminal node.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.status = RunStatus::Failed;
        self.failure_reason = Some(reason.clone());
        self.current_node = NodeKind::Finish;
        self.record(NodeKind::Finish, "fail", &reason);
    }

    /// Mark the session successful and route to the terminal node.
    pub fn succeed(&mut self) {
        self.status = RunStatus::Success;
        self.current_node = NodeKind::Finish;
        self.record(NodeKind::Finish, "succeed", "repair verified");
    }

    /// Paths modified during the current iteration.
    #[must_use]
    pub fn modified_paths(&self) -> Vec<String> {
        self.files
            .values()
            .filter(|f| f.status == FileStatus::Modified)
            .map(|f| f.path.clone())
            .collect()
    }

    /// Checksum over all modified content, for loop fingerprints.
    #[must_use]
    pub fn modified_content_checksum(&self) -> String {
        let mut hasher = Sha1::new();
        for file in self.files.values() {
            if let Some(modified) = &file.modified {
                hasher.update(file.path.as_bytes());
                hasher.update(modified.content.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Debug-time structural invariants. Cheap; called after every node.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.iteration > self.max_iterations {
            return Err(format!(
                "iteration {} exceeds max {}",
                self.iteration, self.max_iterations
            ));
        }
        for path in &self.file_reservations {
            if !self.files.contains_key(path) {
                return Err(format!("reserved path '{path}' missing from files"));
            }
        }
        if self.current_node == NodeKind::Finish && !self.is_terminal() {
            return Err("finish node with working status".to_string());
        }
        Ok(())
    }
}

/// SHA-1 hex digest of file content, for modification rows.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> GraphState {
        GraphState::new(RepairConfig::default(), RunGroup::single("g1", 42))
    }

    #[test]
    fn test_state_serialization_round_trip() {
        let mut state = state();
        state.diagnosis = Some(Diagnosis {
            summary: "Missing module lodash".into(),
            file_path: None,
            fix_action: FixAction::Command,
            suggested_command: Some("npm install lodash".into()),
            reproduction_command: Some("node -e \"require('lodash')\"".into()),
            confidence: 0.9,
        });
        state.complexity_history.push(7);
        state.record(NodeKind::Analysis, "diagnose", "dependency error");

        let json = serde_json::to_string(&state).unwrap();
        let loaded: GraphState = serde_json::from_str(&json).unwrap();

        assert_eq!(loaded.group.main_run(), Some(42));
        assert_eq!(loaded.complexity_history, vec![7]);
        assert_eq!(loaded.history.len(), 1);
        assert!(matches!(
            loaded.diagnosis.unwrap().fix_action,
            FixAction::Command
        ));
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Working).unwrap(),
            "\"working\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCategory::TestFailure).unwrap(),
            "\"TEST_FAILURE\""
        );
    }

    #[test]
    fn test_fail_routes_to_finish() {
        let mut state = state();
        state.fail("Max iterations exceeded");
        assert!(state.is_terminal());
        assert_eq!(state.current_node, NodeKind::Finish);
        assert_eq!(
            state.failure_reason.as_deref(),
            Some("Max iterations exceeded")
        );
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_reservation_invariant() {
        let mut state = state();
        state.file_reservations.push("src/app.ts".into());
        assert!(state.check_invariants().is_err());

        state.files.insert(
            "src/app.ts".into(),
            TrackedFile {
                path: "src/app.ts".into(),
                status: FileStatus::Original,
                original: FileVersion {
                    content: "x".into(),
                    language: "typescript".into(),
                    name: "app.ts".into(),
                },
                modified: None,
            },
        );
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_iteration_cap_invariant() {
        let mut state = state();
        state.iteration = state.max_iterations + 1;
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_checksum_tracks_modified_content() {
        let mut state = state();
        let empty = state.modified_content_checksum();

        state.files.insert(
            "src/a.rs".into(),
            TrackedFile {
                path: "src/a.rs".into(),
                status: FileStatus::Modified,
                original: FileVersion {
                    content: "old".into(),
                    language: "rust".into(),
                    name: "a.rs".into(),
                },
                modified: Some(FileVersion {
                    content: "new".into(),
                    language: "rust".into(),
                    name: "a.rs".into(),
                }),
            },
        );
        let with_content = state.modified_content_checksum();
        assert_ne!(empty, with_content);
        assert_eq!(state.modified_paths(), vec!["src/a.rs".to_string()]);
    }

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }
}
