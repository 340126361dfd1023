//! Reliability telemetry and metrics.
//!
//! Every defense-layer checkpoint appends an immutable event; recovery
//! attempts mutate the outcome of the event they answer. The metrics
//! half aggregates those rows for the adaptive-threshold service and
//! the dashboard. Recovery-outcome updates are eventually consistent
//! with concurrent metric reads; there is no serialization lock.

use chrono::{Duration, Utc};
use medic_store::{NewReliabilityEvent, ReliabilityEventRow, Store};
use serde_json::Value;

use crate::error::EngineResult;

/// Defense layer names.
pub const LAYER_REPRODUCTION: &str = "phase2-reproduction";
pub const LAYER_LOOP_DETECTION: &str = "phase3-loop-detection";
pub const LAYER_COMPLEXITY: &str = "phase3-complexity";

/// Append-side telemetry handle.
#[derive(Clone)]
pub struct ReliabilityTelemetry {
    store: Store,
    enabled: bool,
}

impl ReliabilityTelemetry {
    #[must_use]
    pub fn new(store: Store, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Append one event. Returns the event id, or `None` when the
    /// layers are disabled.
    pub async fn record_event(
        &self,
        layer: &str,
        triggered: bool,
        threshold: f64,
        context: Value,
        outcome: &str,
    ) -> EngineResult<Option<i64>> {
        if !self.enabled {
            return Ok(None);
        }
        let id = self
            .store
            .insert_reliability_event(&NewReliabilityEvent {
                layer: layer.to_string(),
                triggered,
                threshold,
                context,
                outcome: outcome.to_string(),
            })
            .await?;
        Ok(Some(id))
    }

    /// Convenience: the reproduction layer fired because no command was
    /// available.
    pub async fn record_reproduction_required(
        &self,
        context: Value,
        threshold: f64,
    ) -> EngineResult<Option<i64>> {
        self.record_event(LAYER_REPRODUCTION, true, threshold, context, "triggered")
            .await
    }

    /// Convenience: the loop-detection layer fired.
    pub async fn record_strategy_loop_detected(
        &self,
        context: Value,
        threshold: f64,
    ) -> EngineResult<Option<i64>> {
        self.record_event(LAYER_LOOP_DETECTION, true, threshold, context, "triggered")
            .await
    }

    /// Record how a recovery attempt for an earlier event went.
    pub async fn update_recovery_outcome(
        &self,
        event_id: i64,
        strategy: &str,
        success: bool,
    ) -> EngineResult<()> {
        self.store
            .update_recovery_outcome(event_id, strategy, success)
            .await?;
        Ok(())
    }

    /// Mark an event as escalated to a human.
    pub async fn mark_human_requested(&self, event_id: i64) -> EngineResult<()> {
        self.store
            .set_event_outcome(event_id, "human-requested")
            .await?;
        Ok(())
    }

    pub async fn get_recent_events(
        &self,
        layer: &str,
        n: i64,
    ) -> EngineResult<Vec<ReliabilityEventRow>> {
        Ok(self.store.recent_events(layer, n).await?)
    }

    /// TTL pruning of old events.
    pub async fn delete_old_events(&self, days: u32) -> EngineResult<u64> {
        let deleted = self.store.delete_old_events(days).await?;
        if deleted > 0 {
            tracing::info!(deleted, days, "pruned old reliability events");
        }
        Ok(deleted)
    }
}

/// Aggregated per-layer counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerMetrics {
    pub total_events: u64,
    pub triggered_events: u64,
    pub trigger_rate: f64,
    pub recovery_attempts: u64,
    pub recovery_successes: u64,
}

/// Threshold analysis for one layer.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdAnalysis {
    pub current_threshold: f64,
    pub suggested: f64,
    pub confidence: f64,
    pub data_points: u64,
}

/// One day of trigger-rate history.
#[derive(Debug, Clone)]
pub struct TrendPoint {
    pub day: String,
    pub total: u64,
    pub triggered: u64,
}

/// Dashboard rollup across layers.
#[derive(Debug, Clone, Default)]
pub struct DashboardSummary {
    pub layers: Vec<(String, LayerMetrics)>,
}

/// Read-side metrics aggregator.
#[derive(Clone)]
pub struct ReliabilityMetrics {
    store: Store,
}

impl ReliabilityMetrics {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Counters for one layer. `trigger_rate` is exactly
    /// `triggered / total`.
    pub async fn layer_metrics(&self, layer: &str) -> EngineResult<LayerMetrics> {
        let counts = self.store.layer_counts(layer).await?;
        let trigger_rate = if counts.total_events == 0 {
            0.0
        } else {
            counts.triggered_events as f64 / counts.total_events as f64
        };
        Ok(LayerMetrics {
            total_events: counts.total_events,
            triggered_events: counts.triggered_events,
            trigger_rate,
            recovery_attempts: counts.recovery_attempts,
            recovery_successes: counts.recovery_successes,
        })
    }

    /// Suggest a threshold move for a layer. Confidence scales linearly
    /// until `min_sample` events exist. A hot layer (high trigger rate)
    /// gets a looser threshold, a cold one a tighter threshold.
    pub async fn analyze_threshold(
        &self,
        layer: &str,
        current: f64,
        min: f64,
        max: f64,
        min_sample: u64,
    ) -> EngineResult<ThresholdAnalysis> {
        let metrics = self.layer_metrics(layer).await?;
        let data_points = metrics.total_events;
        let confidence = if min_sample == 0 {
            1.0
        } else {
            (data_points as f64 / min_sample as f64).min(1.0)
        };

        let suggested = if metrics.trigger_rate > 0.5 {
            max.min(current + (max - min) * 0.1)
        } else if metrics.trigger_rate < 0.1 && data_points > 0 {
            min.max(current - (max - min) * 0.1)
        } else {
            current
        };

        Ok(ThresholdAnalysis {
            current_threshold: current,
            suggested,
            confidence,
            data_points,
        })
    }

    /// Daily trigger counts over the trailing window.
    pub async fn threshold_trend(&self, layer: &str, days: u32) -> EngineResult<Vec<TrendPoint>> {
        let since = Utc::now() - Duration::days(i64::from(days));
        let events = self.store.events_since(layer, since).await?;

        let mut points: Vec<TrendPoint> = Vec::new();
        for event in events {
            let day = event.created_at.format("%Y-%m-%d").to_string();
            match points.last_mut() {
                Some(point) if point.day == day => {
                    point.total += 1;
                    if event.triggered {
                        point.triggered += 1;
                    }
                }
                _ => points.push(TrendPoint {
                    day,
                    total: 1,
                    triggered: u64::from(event.triggered),
                }),
            }
        }
        Ok(points)
    }

    /// Per-layer rollup for every layer that has recorded anything.
    pub async fn dashboard_summary(&self) -> EngineResult<DashboardSummary> {
        let mut summary = DashboardSummary::default();
        for layer in self.store.known_layers().await? {
            let metrics = self.layer_metrics(&layer).await?;
            summary.layers.push((layer, metrics));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn telemetry() -> (ReliabilityTelemetry, ReliabilityMetrics) {
        let store = Store::connect_in_memory().await.unwrap();
        (
            ReliabilityTelemetry::new(store.clone(), true),
            ReliabilityMetrics::new(store),
        )
    }

    #[tokio::test]
    async fn test_trigger_rate_is_exact() {
        let (telemetry, metrics) = telemetry().await;
        for triggered in [true, false, false, true] {
            telemetry
                .record_event(
                    LAYER_REPRODUCTION,
                    triggered,
                    0.5,
                    json!({}),
                    if triggered { "triggered" } else { "passed" },
                )
                .await
                .unwrap();
        }

        let layer = metrics.layer_metrics(LAYER_REPRODUCTION).await.unwrap();
        assert_eq!(layer.total_events, 4);
        assert_eq!(layer.triggered_events, 2);
        assert!((layer.trigger_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_disabled_telemetry_records_nothing() {
        let store = Store::connect_in_memory().await.unwrap();
        let telemetry = ReliabilityTelemetry::new(store.clone(), false);
        let id = telemetry
            .record_reproduction_required(json!({}), 0.5)
            .await
            .unwrap();
        assert!(id.is_none());
        assert_eq!(
            store
                .layer_counts(LAYER_REPRODUCTION)
                .await
                .unwrap()
                .total_events,
            0
        );
    }

    #[tokio::test]
    async fn test_confidence_scales_with_samples() {
        let (telemetry, metrics) = telemetry().await;
        for _ in 0..5 {
            telemetry
                .record_event(LAYER_LOOP_DETECTION, true, 3.0, json!({}), "triggered")
                .await
                .unwrap();
        }

        let analysis = metrics
            .analyze_threshold(LAYER_LOOP_DETECTION, 3.0, 2.0, 8.0, 20)
            .await
            .unwrap();
        assert_eq!(analysis.data_points, 5);
        assert!((analysis.confidence - 0.25).abs() < f64::EPSILON);
        // All-triggered layer asks for a looser threshold.
        assert!(analysis.suggested > analysis.current_threshold);
    }

    #[tokio::test]
    async fn test_suggestion_stays_within_bounds() {
        let (telemetry, metrics) = telemetry().await;
        for _ in 0..30 {
            telemetry
                .record_event(LAYER_REPRODUCTION, true, 0.88, json!({}), "triggered")
                .await
                .unwrap();
        }

        let analysis = metrics
            .analyze_threshold(LAYER_REPRODUCTION, 0.88, 0.1, 0.9, 20)
            .await
            .unwrap();
        assert!(analysis.suggested <= 0.9);
        assert!((analysis.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_human_requested_outcome() {
        let (telemetry, _) = telemetry().await;
        let id = telemetry
            .record_strategy_loop_detected(json!({"iteration": 2}), 3.0)
            .await
            .unwrap()
            .unwrap();
        telemetry.mark_human_requested(id).await.unwrap();

        let events = telemetry
            .get_recent_events(LAYER_LOOP_DETECTION, 1)
            .await
            .unwrap();
        assert_eq!(events[0].outcome, "human-requested");
    }

    #[tokio::test]
    async fn test_dashboard_lists_known_layers() {
        let (telemetry, metrics) = telemetry().await;
        telemetry
            .record_reproduction_required(json!({}), 0.5)
            .await
            .unwrap();
        telemetry
            .record_strategy_loop_detected(json!({}), 3.0)
            .await
            .unwrap();

        let summary = metrics.dashboard_summary().await.unwrap();
        assert_eq!(summary.layers.len(), 2);
    }
}
