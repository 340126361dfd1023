//! Reflection and learning.
//!
//! An in-process store of failure and success patterns plus an async
//! persistence queue. The in-memory tables stay authoritative for
//! reads; the queue batches trajectory writes into the database from a
//! single flusher task so a burst of recordings never blocks a session.

use chrono::{DateTime, Utc};
use medic_store::{Store, TrajectorySample};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Bounded queue depth; sends beyond this are dropped and counted as
/// failed writes rather than blocking the caller.
const QUEUE_CAPACITY: usize = 10_000;

/// How often failures must repeat before `reflect` reports them.
const REFLECT_MIN_FREQUENCY: u64 = 3;

/// A recurring failure shape.
#[derive(Debug, Clone)]
pub struct FailurePattern {
    pub error_type: String,
    pub failure_reason: String,
    pub frequency: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub attempted_fix: String,
    pub context: String,
}

/// A known-good fix shape; overwritten on every success.
#[derive(Debug, Clone)]
pub struct SuccessPattern {
    pub error_type: String,
    pub fix_description: String,
    pub frequency: u64,
    pub last_seen: DateTime<Utc>,
}

/// Output of `reflect`.
#[derive(Debug, Clone, Default)]
pub struct ReflectionReport {
    pub insights: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Counters exposed by the persistence queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueTelemetry {
    pub queue_size: usize,
    pub writes_succeeded: u64,
    pub writes_failed: u64,
    pub avg_latency_ms: f64,
}

/// Async write-behind queue for trajectory samples.
pub struct PersistenceQueue {
    tx: mpsc::Sender<TrajectorySample>,
    pending: Arc<AtomicUsize>,
    succeeded: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    latency_total_us: Arc<AtomicU64>,
}

impl PersistenceQueue {
    /// Spawn the single flusher task over `store`.
    #[must_use]
    pub fn spawn(store: Store) -> Self {
        let (tx, mut rx) = mpsc::channel::<TrajectorySample>(QUEUE_CAPACITY);
        let pending = Arc::new(AtomicUsize::new(0));
        let succeeded = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let latency_total_us = Arc::new(AtomicU64::new(0));

        {
            let pending = pending.clone();
            let succeeded = succeeded.clone();
            let failed = failed.clone();
            let latency_total_us = latency_total_us.clone();
            tokio::spawn(async move {
                while let Some(sample) = rx.recv().await {
                    let started = std::time::Instant::now();
                    match store.record_trajectory(&sample).await {
                        Ok(()) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(error = %e, "trajectory write failed");
                        }
                    }
                    latency_total_us
                        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
            });
        }

        Self {
            tx,
            pending,
            succeeded,
            failed,
            latency_total_us,
        }
    }

    /// Enqueue without blocking. A full queue counts as a failed write.
    pub fn enqueue(&self, sample: TrajectorySample) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.try_send(sample).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("persistence queue saturated; dropping sample");
        }
    }

    /// Wait until every enqueued sample has been written.
    pub async fn flush(&self) {
        while self.pending.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[must_use]
    pub fn telemetry(&self) -> QueueTelemetry {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let written = succeeded + failed;
        let avg_latency_ms = if written == 0 {
            0.0
        } else {
            self.latency_total_us.load(Ordering::Relaxed) as f64 / written as f64 / 1000.0
        };
        QueueTelemetry {
            queue_size: self.pending.load(Ordering::Acquire),
            writes_succeeded: succeeded,
            writes_failed: failed,
            avg_latency_ms,
        }
    }
}

/// Process-wide reflection store.
pub struct ReflectionSystem {
    failures: RwLock<HashMap<(String, String), FailurePattern>>,
    successes: RwLock<HashMap<String, SuccessPattern>>,
    queue: PersistenceQueue,
}

impl ReflectionSystem {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            failures: RwLock::new(HashMap::new()),
            successes: RwLock::new(HashMap::new()),
            queue: PersistenceQueue::spawn(store),
        }
    }

    /// Record one failed attempt. In-memory counters update
    /// synchronously; the trajectory write is queued.
    pub fn record_failure(
        &self,
        error_type: &str,
        failure_reason: &str,
        attempted_fix: &str,
        context: &str,
        complexity: u8,
    ) {
        let now = Utc::now();
        {
            let mut failures = self.failures.write().expect("failures lock");
            failures
                .entry((error_type.to_string(), failure_reason.to_string()))
                .and_modify(|p| {
                    p.frequency += 1;
                    p.last_seen = now;
                    p.attempted_fix = attempted_fix.to_string();
                })
                .or_insert_with(|| FailurePattern {
                    error_type: error_type.to_string(),
                    failure_reason: failure_reason.to_string(),
                    frequency: 1,
                    first_seen: now,
                    last_seen: now,
                    attempted_fix: attempted_fix.to_string(),
                    context: context.to_string(),
                });
        }

        self.queue.enqueue(TrajectorySample {
            error_category: error_type.to_string(),
            complexity,
            tool_sequence: vec![attempted_fix.to_string()],
            success: false,
            cost: 0.0,
            latency_ms: 0.0,
            reward: 0.0,
        });
    }

    /// Record a successful repair; overwrites the per-type entry.
    pub fn record_success(&self, error_type: &str, fix_description: &str, complexity: u8) {
        let now = Utc::now();
        {
            let mut successes = self.successes.write().expect("successes lock");
            let entry = successes
                .entry(error_type.to_string())
                .or_insert_with(|| SuccessPattern {
                    error_type: error_type.to_string(),
                    fix_description: fix_description.to_string(),
                    frequency: 0,
                    last_seen: now,
                });
            entry.frequency += 1;
            entry.fix_description = fix_description.to_string();
            entry.last_seen = now;
        }

        self.queue.enqueue(TrajectorySample {
            error_category: error_type.to_string(),
            complexity,
            tool_sequence: vec![fix_description.to_string()],
            success: true,
            cost: 0.0,
            latency_ms: 0.0,
            reward: 1.0,
        });
    }

    /// Failure rate for an error type across everything recorded.
    #[must_use]
    pub fn failure_rate(&self, error_type: &str) -> f64 {
        let failures: u64 = self
            .failures
            .read()
            .expect("failures lock")
            .values()
            .filter(|p| p.error_type == error_type)
            .map(|p| p.frequency)
            .sum();
        let successes = self
            .successes
            .read()
            .expect("successes lock")
            .get(error_type)
            .map_or(0, |p| p.frequency);

        let total = failures + successes;
        if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        }
    }

    /// Rank recurring failures and emit improvement suggestions for the
    /// error types that fail more often than they succeed.
    #[must_use]
    pub fn reflect(&self) -> ReflectionReport {
        let mut recurring: Vec<FailurePattern> = self
            .failures
            .read()
            .expect("failures lock")
            .values()
            .filter(|p| p.frequency >= REFLECT_MIN_FREQUENCY)
            .cloned()
            .collect();
        recurring.sort_by(|a, b| b.frequency.cmp(&a.frequency));

        let mut report = ReflectionReport::default();
        let mut suggested_types: Vec<String> = Vec::new();
        for pattern in recurring {
            report.insights.push(format!(
                "'{}' failed {} times with reason '{}' (last fix tried: {})",
                pattern.error_type,
                pattern.frequency,
                pattern.failure_reason,
                pattern.attempted_fix
            ));

            if self.failure_rate(&pattern.error_type) > 0.5
                && !suggested_types.contains(&pattern.error_type)
            {
                suggested_types.push(pattern.error_type.clone());
                report.suggestions.push(format!(
                    "failure rate for '{}' exceeds 50%; try a different strategy than '{}'",
                    pattern.error_type, pattern.attempted_fix
                ));
            }
        }
        report
    }

    #[must_use]
    pub fn queue_telemetry(&self) -> QueueTelemetry {
        self.queue.telemetry()
    }

    /// Drain the persistence queue.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }
}
