//! Per-session loop detection.
//!
//! Two defenses live here. State duplication: every iteration is
//! fingerprinted from its changed files, modified-content checksum, and
//! error fingerprint; a repeated fingerprint means the session is going
//! in circles. Hallucination tracking: consecutive reads of the same
//! nonexistent path trigger a strategy shift injected into the tool
//! output. The detector is a pure per-session value; the verification
//! node owns recording telemetry for hits.

use chrono::{DateTime, Utc};
use medic_config::LoopDetectorConfig;
use medic_sandbox::HallucinationSink;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Snapshot of one iteration's externally observable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStateSnapshot {
    pub iteration: u32,
    pub files_changed: Vec<String>,
    pub content_checksum: String,
    pub error_fingerprint: String,
    pub timestamp: DateTime<Utc>,
}

impl LoopStateSnapshot {
    #[must_use]
    pub fn new(
        iteration: u32,
        files_changed: Vec<String>,
        content_checksum: impl Into<String>,
        error_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            iteration,
            files_changed,
            content_checksum: content_checksum.into(),
            error_fingerprint: error_fingerprint.into(),
            timestamp: Utc::now(),
        }
    }

    /// Deterministic fingerprint:
    /// `sort(files).join(",") | checksum | error_fingerprint`.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut files = self.files_changed.clone();
        files.sort();
        format!(
            "{}|{}|{}",
            files.join(","),
            self.content_checksum,
            self.error_fingerprint
        )
    }
}

/// Result of a duplicate check.
#[derive(Debug, Clone, Default)]
pub struct LoopDetection {
    pub detected: bool,
    pub duplicate_of_iteration: Option<u32>,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
struct HallucinationState {
    counts: HashMap<String, u32>,
    last_path: Option<String>,
    consecutive: u32,
}

#[derive(Debug, Default)]
struct DetectorState {
    history: Vec<LoopStateSnapshot>,
    state_map: HashMap<String, u32>,
    hallucinations: HallucinationState,
    shifts_triggered: u32,
}

/// Per-session loop detector.
pub struct LoopDetector {
    config: LoopDetectorConfig,
    state: Mutex<DetectorState>,
}

impl LoopDetector {
    #[must_use]
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Check a snapshot against everything seen this session, then
    /// remember it.
    pub fn detect_loop(&self, snapshot: &LoopStateSnapshot) -> LoopDetection {
        let fingerprint = snapshot.fingerprint();
        let mut state = self.state.lock().expect("detector lock");

        let detection = match state.state_map.get(&fingerprint) {
            Some(&first) => LoopDetection {
                detected: true,
                duplicate_of_iteration: Some(first),
                message: Some(format!(
                    "iteration {} repeats the state first seen at iteration {first}",
                    snapshot.iteration
                )),
            },
            None => {
                state.state_map.insert(fingerprint, snapshot.iteration);
                LoopDetection::default()
            }
        };

        state.history.push(snapshot.clone());
        if detection.detected {
            tracing::warn!(
                iteration = snapshot.iteration,
                duplicate_of = ?detection.duplicate_of_iteration,
                "strategy loop detected"
            );
        }
        detection
    }

    /// Count one hallucinated path; tracks the consecutive streak.
    pub fn record_path_hallucination(&self, path: &str) {
        let mut state = self.state.lock().expect("detector lock");
        let h = &mut state.hallucinations;
        *h.counts.entry(path.to_string()).or_insert(0) += 1;
        if h.last_path.as_deref() == Some(path) {
            h.consecutive += 1;
        } else {
            h.last_path = Some(path.to_string());
            h.consecutive = 1;
        }
    }

    /// True iff the same path has been hallucinated enough times in a
    /// row to warrant steering the model elsewhere.
    #[must_use]
    pub fn should_trigger_strategy_shift(&self, path: &str) -> bool {
        let state = self.state.lock().expect("detector lock");
        let h = &state.hallucinations;
        h.last_path.as_deref() == Some(path)
            && h.consecutive >= self.config.strategy_shift_consecutive
    }

    /// The canned advisory the sandbox guard appends to tool output.
    #[must_use]
    pub fn trigger_automated_recovery(&self, path: &str) -> String {
        let mut state = self.state.lock().expect("detector lock");
        state.shifts_triggered += 1;
        format!(
            "[SYSTEM ADVICE] The path '{path}' does not exist in this repository. \
             Stop guessing paths; use `glob(\"**/<name>\")` to search for the file by name, \
             then read the path the search returns."
        )
    }

    /// How many strategy shifts this session has already issued.
    #[must_use]
    pub fn shifts_triggered(&self) -> u32 {
        self.state.lock().expect("detector lock").shifts_triggered
    }

    /// Total hallucinations recorded for a path.
    #[must_use]
    pub fn hallucination_count(&self, path: &str) -> u32 {
        let state = self.state.lock().expect("detector lock");
        state.hallucinations.counts.get(path).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn snapshots_seen(&self) -> usize {
        self.state.lock().expect("detector lock").history.len()
    }
}

impl HallucinationSink for LoopDetector {
    fn record_hallucination(&self, path: &str) -> bool {
        self.record_path_hallucination(path);
        self.should_trigger_strategy_shift(path)
    }

    fn advisory(&self, path: &str) -> String {
        self.trigger_automated_recovery(path)
    }
}
