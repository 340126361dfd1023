//! FileModification rows: one per file write performed by the execution
//! node. Append-only within a run.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::{StoreError, StoreResult};
use crate::Store;

#[derive(Debug, Clone)]
pub struct NewFileModification {
    pub run_id: String,
    pub path: String,
    pub before_hash: String,
    pub after_hash: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct FileModificationRow {
    pub id: i64,
    pub run_id: String,
    pub path: String,
    pub before_hash: String,
    pub after_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub async fn insert_modification(
        &self,
        modification: &NewFileModification,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO file_modifications (run_id, path, before_hash, after_hash, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&modification.run_id)
        .bind(&modification.path)
        .bind(&modification.before_hash)
        .bind(&modification.after_hash)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "insert file_modification"))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn modifications_for_run(
        &self,
        run_id: &str,
    ) -> StoreResult<Vec<FileModificationRow>> {
        sqlx::query_as::<_, FileModificationRow>(
            "SELECT id, run_id, path, before_hash, after_hash, created_at
             FROM file_modifications WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "modifications_for_run"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_only_ordering() {
        let store = Store::connect_in_memory().await.unwrap();
        let run = store.create_run("g", "{}").await.unwrap();

        for (path, after) in [("src/a.rs", "h1"), ("src/b.rs", "h2")] {
            store
                .insert_modification(&NewFileModification {
                    run_id: run.id.clone(),
                    path: path.into(),
                    before_hash: "h0".into(),
                    after_hash: after.into(),
                })
                .await
                .unwrap();
        }

        let rows = store.modifications_for_run(&run.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].path, "src/a.rs");
        assert_eq!(rows[1].after_hash, "h2");
    }

    #[tokio::test]
    async fn test_requires_parent_run() {
        let store = Store::connect_in_memory().await.unwrap();
        let err = store
            .insert_modification(&NewFileModification {
                run_id: "ghost".into(),
                path: "x".into(),
                before_hash: "a".into(),
                after_hash: "b".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey { .. }));
    }
}
