//! SQLite persistence for Medic repair sessions.
//!
//! One `Store` per process; each session borrows the pool. Rows are
//! partitioned by `run_id` under the `agent_runs` parent, and deleting an
//! `AgentRun` cascades to every per-session artifact. JSON-typed columns
//! (`notes`, `context`, `state`) are stored as TEXT and parsed on read;
//! unknown fields are ignored.

mod error;
mod facts;
mod modifications;
mod reliability;
mod runs;
mod trajectories;

pub use error::{StoreError, StoreResult};
pub use facts::{ErrorFactRow, FactNotes, NewErrorFact};
pub use modifications::{FileModificationRow, NewFileModification};
pub use reliability::{NewReliabilityEvent, ReliabilityEventRow};
pub use runs::{AgentRunRow, RunStatistics};
pub use trajectories::{FixTrajectoryRow, TrajectorySample};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS agent_runs (
    id          TEXT PRIMARY KEY,
    group_id    TEXT NOT NULL,
    status      TEXT NOT NULL,
    state       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS error_facts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES agent_runs(id) ON DELETE CASCADE,
    summary     TEXT NOT NULL,
    file_path   TEXT,
    fix_action  TEXT NOT NULL,
    notes       TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_modifications (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       TEXT NOT NULL REFERENCES agent_runs(id) ON DELETE CASCADE,
    path         TEXT NOT NULL,
    before_hash  TEXT NOT NULL,
    after_hash   TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reliability_events (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    layer                TEXT NOT NULL,
    triggered            INTEGER NOT NULL,
    threshold            REAL NOT NULL,
    context              TEXT NOT NULL,
    outcome              TEXT NOT NULL,
    recovery_strategy    TEXT,
    recovery_successful  INTEGER,
    created_at           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fix_trajectories (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    error_category   TEXT NOT NULL,
    complexity       INTEGER NOT NULL,
    tool_sequence    TEXT NOT NULL,
    success          INTEGER NOT NULL,
    occurrence_count INTEGER NOT NULL,
    total_cost       REAL NOT NULL,
    total_latency    REAL NOT NULL,
    reward           REAL NOT NULL,
    last_used        TEXT NOT NULL,
    UNIQUE (error_category, complexity, tool_sequence, success)
);

CREATE INDEX IF NOT EXISTS idx_error_facts_run ON error_facts(run_id);
CREATE INDEX IF NOT EXISTS idx_file_modifications_run ON file_modifications(run_id);
CREATE INDEX IF NOT EXISTS idx_reliability_layer_time ON reliability_events(layer, created_at);
";

/// Handle to the engine database. Cheap to clone; wraps a pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and run the
    /// schema bootstrap. Foreign keys are enforced on every connection.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|source| StoreError::Connect {
                url: url.to_string(),
                source,
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Connect {
                url: url.to_string(),
                source,
            })?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps the
    /// shared cache alive for the store's lifetime.
    pub async fn connect_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|source| StoreError::Connect {
                url: "sqlite::memory:".to_string(),
                source,
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Connect {
                url: "sqlite::memory:".to_string(),
                source,
            })?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Migrate)?;
        }
        tracing::debug!("database schema up to date");
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = Store::connect_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let store = Store::connect_in_memory().await.unwrap();
        let run = store.create_run("group-1", "{}").await.unwrap();

        store
            .insert_fact(&NewErrorFact {
                run_id: run.id.clone(),
                summary: "boom".into(),
                file_path: None,
                fix_action: "command".into(),
                notes: FactNotes::default(),
            })
            .await
            .unwrap();
        store
            .insert_modification(&NewFileModification {
                run_id: run.id.clone(),
                path: "src/app.ts".into(),
                before_hash: "aa".into(),
                after_hash: "bb".into(),
            })
            .await
            .unwrap();

        store.delete_run(&run.id).await.unwrap();
        assert!(store.facts_for_run(&run.id).await.unwrap().is_empty());
        assert!(store
            .modifications_for_run(&run.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_orphan_fact_rejected() {
        let store = Store::connect_in_memory().await.unwrap();
        let err = store
            .insert_fact(&NewErrorFact {
                run_id: "missing-run".into(),
                summary: "boom".into(),
                file_path: None,
                fix_action: "edit".into(),
                notes: FactNotes::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey { .. }));
    }
}
