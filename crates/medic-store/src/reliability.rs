//! ReliabilityEvent rows: the immutable audit trail for the defense
//! layers. Append-only, except for the recovery-outcome update which
//! mutates the strategy/outcome columns of an earlier row. Pruned by TTL.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;

use crate::error::{StoreError, StoreResult};
use crate::Store;

/// A new event to append.
#[derive(Debug, Clone)]
pub struct NewReliabilityEvent {
    /// Defense layer, e.g. `phase2-reproduction`, `phase3-loop-detection`.
    pub layer: String,
    pub triggered: bool,
    pub threshold: f64,
    /// Free-form JSON context.
    pub context: serde_json::Value,
    /// `passed`, `triggered`, `recovered-by-<strategy>`, `human-requested`.
    pub outcome: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReliabilityEventRow {
    pub id: i64,
    pub layer: String,
    pub triggered: bool,
    pub threshold: f64,
    context: String,
    pub outcome: String,
    pub recovery_strategy: Option<String>,
    pub recovery_successful: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl ReliabilityEventRow {
    pub fn context(&self) -> StoreResult<serde_json::Value> {
        serde_json::from_str(&self.context).map_err(|source| StoreError::Json {
            column: "reliability_events.context",
            source,
        })
    }
}

/// Per-layer counters used by the metrics aggregator.
#[derive(Debug, Default, Clone, Copy)]
pub struct LayerCounts {
    pub total_events: u64,
    pub triggered_events: u64,
    pub recovery_attempts: u64,
    pub recovery_successes: u64,
}

impl Store {
    /// Append an event; returns its id for later outcome updates.
    pub async fn insert_reliability_event(
        &self,
        event: &NewReliabilityEvent,
    ) -> StoreResult<i64> {
        let context = event.context.to_string();
        let result = sqlx::query(
            "INSERT INTO reliability_events
                 (layer, triggered, threshold, context, outcome, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.layer)
        .bind(event.triggered)
        .bind(event.threshold)
        .bind(context)
        .bind(&event.outcome)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "insert reliability_event"))?;

        Ok(result.last_insert_rowid())
    }

    /// Record the recovery attempt made for an earlier event. The outcome
    /// becomes `recovered-by-<strategy>` or `failed-<strategy>`.
    pub async fn update_recovery_outcome(
        &self,
        event_id: i64,
        strategy: &str,
        success: bool,
    ) -> StoreResult<()> {
        let outcome = if success {
            format!("recovered-by-{strategy}")
        } else {
            format!("failed-{strategy}")
        };

        let result = sqlx::query(
            "UPDATE reliability_events
             SET recovery_strategy = ?, recovery_successful = ?, outcome = ?
             WHERE id = ?",
        )
        .bind(strategy)
        .bind(success)
        .bind(outcome)
        .bind(event_id)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "update_recovery_outcome"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                context: format!("reliability_event {event_id}"),
            });
        }
        Ok(())
    }

    /// Overwrite the outcome of an earlier event, e.g. `human-requested`.
    pub async fn set_event_outcome(&self, event_id: i64, outcome: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE reliability_events SET outcome = ? WHERE id = ?")
            .bind(outcome)
            .bind(event_id)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::from_sqlx(e, "set_event_outcome"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                context: format!("reliability_event {event_id}"),
            });
        }
        Ok(())
    }

    pub async fn recent_events(
        &self,
        layer: &str,
        limit: i64,
    ) -> StoreResult<Vec<ReliabilityEventRow>> {
        sqlx::query_as::<_, ReliabilityEventRow>(
            "SELECT id, layer, triggered, threshold, context, outcome,
                    recovery_strategy, recovery_successful, created_at
             FROM reliability_events WHERE layer = ?
             ORDER BY id DESC LIMIT ?",
        )
        .bind(layer)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "recent_events"))
    }

    /// Events for a layer since the cutoff, oldest first. Feeds trend
    /// analysis.
    pub async fn events_since(
        &self,
        layer: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ReliabilityEventRow>> {
        sqlx::query_as::<_, ReliabilityEventRow>(
            "SELECT id, layer, triggered, threshold, context, outcome,
                    recovery_strategy, recovery_successful, created_at
             FROM reliability_events WHERE layer = ? AND created_at >= ?
             ORDER BY id",
        )
        .bind(layer)
        .bind(since)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "events_since"))
    }

    /// Counters backing `getLayerMetrics`.
    pub async fn layer_counts(&self, layer: &str) -> StoreResult<LayerCounts> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COALESCE(SUM(triggered), 0),
                    COALESCE(SUM(recovery_strategy IS NOT NULL), 0),
                    COALESCE(SUM(recovery_successful = 1), 0)
             FROM reliability_events WHERE layer = ?",
        )
        .bind(layer)
        .fetch_one(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "layer_counts"))?;

        Ok(LayerCounts {
            total_events: row.0.max(0) as u64,
            triggered_events: row.1.max(0) as u64,
            recovery_attempts: row.2.max(0) as u64,
            recovery_successes: row.3.max(0) as u64,
        })
    }

    /// Distinct layers with at least one event.
    pub async fn known_layers(&self) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT layer FROM reliability_events ORDER BY layer")
                .fetch_all(self.pool())
                .await
                .map_err(|e| StoreError::from_sqlx(e, "known_layers"))?;
        Ok(rows.into_iter().map(|(layer,)| layer).collect())
    }

    /// TTL pruning. Returns the number of deleted rows.
    pub async fn delete_old_events(&self, days: u32) -> StoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let result = sqlx::query("DELETE FROM reliability_events WHERE created_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::from_sqlx(e, "delete_old_events"))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(layer: &str, triggered: bool) -> NewReliabilityEvent {
        NewReliabilityEvent {
            layer: layer.into(),
            triggered,
            threshold: 0.5,
            context: json!({"run": "r1"}),
            outcome: if triggered { "triggered" } else { "passed" }.into(),
        }
    }

    #[tokio::test]
    async fn test_counts_and_trigger_rate_inputs() {
        let store = Store::connect_in_memory().await.unwrap();
        for triggered in [true, true, false, true] {
            store
                .insert_reliability_event(&event("phase2-reproduction", triggered))
                .await
                .unwrap();
        }

        let counts = store.layer_counts("phase2-reproduction").await.unwrap();
        assert_eq!(counts.total_events, 4);
        assert_eq!(counts.triggered_events, 3);
        assert_eq!(counts.recovery_attempts, 0);
    }

    #[tokio::test]
    async fn test_recovery_outcome_update() {
        let store = Store::connect_in_memory().await.unwrap();
        let id = store
            .insert_reliability_event(&event("phase2-reproduction", true))
            .await
            .unwrap();

        store
            .update_recovery_outcome(id, "infer-command", true)
            .await
            .unwrap();

        let events = store.recent_events("phase2-reproduction", 1).await.unwrap();
        assert_eq!(events[0].outcome, "recovered-by-infer-command");
        assert_eq!(events[0].recovery_successful, Some(true));

        let counts = store.layer_counts("phase2-reproduction").await.unwrap();
        assert_eq!(counts.recovery_attempts, 1);
        assert_eq!(counts.recovery_successes, 1);
    }

    #[tokio::test]
    async fn test_failed_recovery_outcome() {
        let store = Store::connect_in_memory().await.unwrap();
        let id = store
            .insert_reliability_event(&event("phase3-loop-detection", true))
            .await
            .unwrap();
        store
            .update_recovery_outcome(id, "shift-strategy", false)
            .await
            .unwrap();

        let events = store
            .recent_events("phase3-loop-detection", 1)
            .await
            .unwrap();
        assert_eq!(events[0].outcome, "failed-shift-strategy");
    }

    #[tokio::test]
    async fn test_context_json_round_trip() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .insert_reliability_event(&NewReliabilityEvent {
                layer: "phase2-reproduction".into(),
                triggered: true,
                threshold: 0.4,
                context: json!({"iteration": 2, "repo": "acme/widgets"}),
                outcome: "triggered".into(),
            })
            .await
            .unwrap();

        let events = store.recent_events("phase2-reproduction", 1).await.unwrap();
        let context = events[0].context().unwrap();
        assert_eq!(context["iteration"], 2);
    }

    #[tokio::test]
    async fn test_ttl_prune_keeps_recent() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .insert_reliability_event(&event("phase2-reproduction", false))
            .await
            .unwrap();
        let deleted = store.delete_old_events(30).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(
            store
                .layer_counts("phase2-reproduction")
                .await
                .unwrap()
                .total_events,
            1
        );
    }
}
