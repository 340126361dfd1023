//! FixTrajectory rows: tool sequences recorded per error category for
//! offline mining. Counters are running totals; reward is a running
//! average over occurrences.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::{StoreError, StoreResult};
use crate::Store;

/// One observed repair trajectory.
#[derive(Debug, Clone)]
pub struct TrajectorySample {
    pub error_category: String,
    pub complexity: u8,
    /// Ordered tool names, e.g. `["diagnose", "patch", "verify"]`.
    pub tool_sequence: Vec<String>,
    pub success: bool,
    pub cost: f64,
    pub latency_ms: f64,
    pub reward: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct FixTrajectoryRow {
    pub id: i64,
    pub error_category: String,
    pub complexity: i64,
    tool_sequence: String,
    pub success: bool,
    pub occurrence_count: i64,
    pub total_cost: f64,
    pub total_latency: f64,
    pub reward: f64,
    pub last_used: DateTime<Utc>,
}

impl FixTrajectoryRow {
    pub fn tool_sequence(&self) -> StoreResult<Vec<String>> {
        serde_json::from_str(&self.tool_sequence).map_err(|source| StoreError::Json {
            column: "fix_trajectories.tool_sequence",
            source,
        })
    }

    #[must_use]
    pub fn average_latency_ms(&self) -> f64 {
        if self.occurrence_count == 0 {
            0.0
        } else {
            self.total_latency / self.occurrence_count as f64
        }
    }
}

impl Store {
    /// Record a trajectory, merging into the existing row for the same
    /// `(category, complexity, tools, success)` key when present.
    pub async fn record_trajectory(&self, sample: &TrajectorySample) -> StoreResult<()> {
        let tools = serde_json::to_string(&sample.tool_sequence).map_err(|source| {
            StoreError::Json {
                column: "fix_trajectories.tool_sequence",
                source,
            }
        })?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO fix_trajectories
                 (error_category, complexity, tool_sequence, success,
                  occurrence_count, total_cost, total_latency, reward, last_used)
             VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?)
             ON CONFLICT (error_category, complexity, tool_sequence, success)
             DO UPDATE SET
                 occurrence_count = occurrence_count + 1,
                 total_cost = total_cost + excluded.total_cost,
                 total_latency = total_latency + excluded.total_latency,
                 reward = (reward * occurrence_count + excluded.reward)
                          / (occurrence_count + 1),
                 last_used = excluded.last_used",
        )
        .bind(&sample.error_category)
        .bind(i64::from(sample.complexity))
        .bind(tools)
        .bind(sample.success)
        .bind(sample.cost)
        .bind(sample.latency_ms)
        .bind(sample.reward)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "record_trajectory"))?;

        Ok(())
    }

    /// Best-rewarded trajectories for a category, successful first.
    pub async fn trajectories_for_category(
        &self,
        error_category: &str,
        limit: i64,
    ) -> StoreResult<Vec<FixTrajectoryRow>> {
        sqlx::query_as::<_, FixTrajectoryRow>(
            "SELECT id, error_category, complexity, tool_sequence, success,
                    occurrence_count, total_cost, total_latency, reward, last_used
             FROM fix_trajectories WHERE error_category = ?
             ORDER BY success DESC, reward DESC LIMIT ?",
        )
        .bind(error_category)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "trajectories_for_category"))
    }
}
