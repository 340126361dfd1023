//! ErrorFact rows: the persisted per-iteration diagnosis summary.
//!
//! Facts are written once, on iteration 0, and read back to detect
//! repeat attempts against the same failure fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{StoreError, StoreResult};
use crate::Store;

/// Structured content of the JSON `notes` column. Unknown fields from
/// older writers are ignored on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactNotes {
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub is_atomic: Option<bool>,
    #[serde(default)]
    pub classification_category: Option<String>,
}

/// A new fact to insert.
#[derive(Debug, Clone)]
pub struct NewErrorFact {
    pub run_id: String,
    pub summary: String,
    pub file_path: Option<String>,
    /// `edit` or `command`.
    pub fix_action: String,
    pub notes: FactNotes,
}

/// A fact as read back.
#[derive(Debug, Clone, FromRow)]
pub struct ErrorFactRow {
    pub id: i64,
    pub run_id: String,
    pub summary: String,
    pub file_path: Option<String>,
    pub fix_action: String,
    notes: String,
    pub created_at: DateTime<Utc>,
}

impl ErrorFactRow {
    /// Parse the JSON notes column.
    pub fn notes(&self) -> StoreResult<FactNotes> {
        serde_json::from_str(&self.notes).map_err(|source| StoreError::Json {
            column: "error_facts.notes",
            source,
        })
    }
}

impl Store {
    pub async fn insert_fact(&self, fact: &NewErrorFact) -> StoreResult<i64> {
        let notes = serde_json::to_string(&fact.notes).map_err(|source| StoreError::Json {
            column: "error_facts.notes",
            source,
        })?;

        let result = sqlx::query(
            "INSERT INTO error_facts (run_id, summary, file_path, fix_action, notes, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&fact.run_id)
        .bind(&fact.summary)
        .bind(&fact.file_path)
        .bind(&fact.fix_action)
        .bind(notes)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "insert error_fact"))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn facts_for_run(&self, run_id: &str) -> StoreResult<Vec<ErrorFactRow>> {
        sqlx::query_as::<_, ErrorFactRow>(
            "SELECT id, run_id, summary, file_path, fix_action, notes, created_at
             FROM error_facts WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "facts_for_run"))
    }

    /// Facts across all runs whose summary matches, newest first. Used to
    /// spot repeat attempts on the same failure fingerprint.
    pub async fn facts_matching_summary(
        &self,
        summary: &str,
        limit: i64,
    ) -> StoreResult<Vec<ErrorFactRow>> {
        sqlx::query_as::<_, ErrorFactRow>(
            "SELECT id, run_id, summary, file_path, fix_action, notes, created_at
             FROM error_facts WHERE summary = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(summary)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "facts_matching_summary"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notes_round_trip() {
        let store = Store::connect_in_memory().await.unwrap();
        let run = store.create_run("g", "{}").await.unwrap();

        store
            .insert_fact(&NewErrorFact {
                run_id: run.id.clone(),
                summary: "Missing module lodash".into(),
                file_path: None,
                fix_action: "command".into(),
                notes: FactNotes {
                    complexity: Some(3),
                    is_atomic: Some(true),
                    classification_category: Some("dependency".into()),
                },
            })
            .await
            .unwrap();

        let facts = store.facts_for_run(&run.id).await.unwrap();
        assert_eq!(facts.len(), 1);
        let notes = facts[0].notes().unwrap();
        assert_eq!(notes.complexity, Some(3));
        assert_eq!(notes.classification_category.as_deref(), Some("dependency"));
    }

    #[tokio::test]
    async fn test_unknown_note_fields_ignored() {
        let store = Store::connect_in_memory().await.unwrap();
        let run = store.create_run("g", "{}").await.unwrap();
        sqlx::query(
            "INSERT INTO error_facts (run_id, summary, file_path, fix_action, notes, created_at)
             VALUES (?, 'x', NULL, 'edit', '{\"complexity\":5,\"experimental\":true}', ?)",
        )
        .bind(&run.id)
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();

        let facts = store.facts_for_run(&run.id).await.unwrap();
        assert_eq!(facts[0].notes().unwrap().complexity, Some(5));
    }

    #[tokio::test]
    async fn test_repeat_fingerprint_lookup() {
        let store = Store::connect_in_memory().await.unwrap();
        for _ in 0..3 {
            let run = store.create_run("g", "{}").await.unwrap();
            store
                .insert_fact(&NewErrorFact {
                    run_id: run.id,
                    summary: "TypeError at app.ts:10".into(),
                    file_path: Some("src/app.ts".into()),
                    fix_action: "edit".into(),
                    notes: FactNotes::default(),
                })
                .await
                .unwrap();
        }

        let matches = store
            .facts_matching_summary("TypeError at app.ts:10", 10)
            .await
            .unwrap();
        assert_eq!(matches.len(), 3);
        assert!(matches[0].id > matches[2].id);
    }
}
