//! AgentRun rows: one per repair session.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::Store;

/// One repair session as persisted. `state` is the serialized
/// `GraphState` snapshot; the engine owns its shape.
#[derive(Debug, Clone, FromRow)]
pub struct AgentRunRow {
    pub id: String,
    pub group_id: String,
    /// One of `working`, `success`, `failed`.
    pub status: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRunRow {
    /// Whether the session has reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status != "working"
    }
}

/// Aggregate view over stored runs.
#[derive(Debug, Default, Clone)]
pub struct RunStatistics {
    pub total: u64,
    pub working: u64,
    pub success: u64,
    pub failed: u64,
}

impl RunStatistics {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let finished = self.success + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.success as f64 / finished as f64
        }
    }
}

impl Store {
    /// Create a new AgentRun in `working` status with the initial state
    /// snapshot.
    pub async fn create_run(&self, group_id: &str, state_json: &str) -> StoreResult<AgentRunRow> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO agent_runs (id, group_id, status, state, created_at, updated_at)
             VALUES (?, ?, 'working', ?, ?, ?)",
        )
        .bind(&id)
        .bind(group_id)
        .bind(state_json)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "insert agent_run"))?;

        Ok(AgentRunRow {
            id,
            group_id: group_id.to_string(),
            status: "working".to_string(),
            state: state_json.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_run(&self, id: &str) -> StoreResult<AgentRunRow> {
        sqlx::query_as::<_, AgentRunRow>(
            "SELECT id, group_id, status, state, created_at, updated_at
             FROM agent_runs WHERE id = ?",
        )
        .bind(id)
        .fetch_one(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "get agent_run"))
    }

    /// Persist the latest state snapshot and status for a run.
    pub async fn update_run(&self, id: &str, status: &str, state_json: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE agent_runs SET status = ?, state = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(state_json)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "update agent_run"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                context: format!("agent_run {id}"),
            });
        }
        Ok(())
    }

    /// Delete a run and, through FK cascade, all of its artifacts.
    pub async fn delete_run(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM agent_runs WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::from_sqlx(e, "delete agent_run"))?;
        Ok(())
    }

    /// Runs belonging to a workflow-run group, newest first.
    pub async fn runs_for_group(&self, group_id: &str) -> StoreResult<Vec<AgentRunRow>> {
        sqlx::query_as::<_, AgentRunRow>(
            "SELECT id, group_id, status, state, created_at, updated_at
             FROM agent_runs WHERE group_id = ? ORDER BY created_at DESC",
        )
        .bind(group_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "runs_for_group"))
    }

    /// Counts by status across all stored runs.
    pub async fn run_statistics(&self) -> StoreResult<RunStatistics> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM agent_runs GROUP BY status")
                .fetch_all(self.pool())
                .await
                .map_err(|e| StoreError::from_sqlx(e, "run_statistics"))?;

        let mut stats = RunStatistics::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            stats.total += count;
            match status.as_str() {
                "working" => stats.working += count,
                "success" => stats.success += count,
                "failed" => stats.failed += count,
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = Store::connect_in_memory().await.unwrap();
        let run = store.create_run("wf-42", "{\"iteration\":0}").await.unwrap();
        assert_eq!(run.status, "working");
        assert!(!run.is_terminal());

        store
            .update_run(&run.id, "success", "{\"iteration\":1}")
            .await
            .unwrap();
        let loaded = store.get_run(&run.id).await.unwrap();
        assert_eq!(loaded.status, "success");
        assert!(loaded.is_terminal());
        assert!(loaded.state.contains("\"iteration\":1"));
    }

    #[tokio::test]
    async fn test_update_missing_run() {
        let store = Store::connect_in_memory().await.unwrap();
        let err = store.update_run("nope", "failed", "{}").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_statistics() {
        let store = Store::connect_in_memory().await.unwrap();
        let a = store.create_run("g", "{}").await.unwrap();
        let b = store.create_run("g", "{}").await.unwrap();
        store.create_run("g", "{}").await.unwrap();
        store.update_run(&a.id, "success", "{}").await.unwrap();
        store.update_run(&b.id, "failed", "{}").await.unwrap();

        let stats = store.run_statistics().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.working, 1);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
    }
}
