//! Adaptive threshold service.
//!
//! Single writer over the process-wide thresholds config; everyone else
//! reads snapshots. An adjustment is applied only when the metrics are
//! confident (enough samples) and the suggested move clears a
//! hysteresis bound, and it always stays inside the configured
//! `[min, max]` clamp.

use medic_config::{AdaptiveThresholdsConfig, LayerThresholds};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::EngineResult;
use crate::telemetry::{
    ReliabilityMetrics, LAYER_COMPLEXITY, LAYER_LOOP_DETECTION, LAYER_REPRODUCTION,
};

/// Minimum analysis confidence before an adjustment is trusted.
const CONFIDENCE_FLOOR: f64 = 0.8;

/// One applied adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdAdjustment {
    pub layer: String,
    pub previous: f64,
    pub current: f64,
    pub confidence: f64,
    pub data_points: u64,
}

/// Owner of the hot thresholds config.
#[derive(Clone)]
pub struct AdaptiveThresholdService {
    config: Arc<RwLock<AdaptiveThresholdsConfig>>,
    metrics: ReliabilityMetrics,
}

impl AdaptiveThresholdService {
    #[must_use]
    pub fn new(config: AdaptiveThresholdsConfig, metrics: ReliabilityMetrics) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics,
        }
    }

    /// Read-only snapshot of the current config.
    pub async fn snapshot(&self) -> AdaptiveThresholdsConfig {
        self.config.read().await.clone()
    }

    /// Current threshold for a layer.
    pub async fn threshold_for(&self, layer: &str) -> f64 {
        let config = self.config.read().await;
        match layer {
            LAYER_REPRODUCTION => config.phase2_reproduction.threshold,
            LAYER_LOOP_DETECTION => config.phase3_iteration_threshold.threshold,
            LAYER_COMPLEXITY => config.phase3_complexity_threshold.threshold,
            _ => config.phase3_complexity_threshold.threshold,
        }
    }

    /// Analyze every configured layer and apply the adjustments that
    /// clear the confidence floor and hysteresis bound. Returns the
    /// applied diffs.
    pub async fn analyze_and_adjust(
        &self,
        min_sample_override: Option<u64>,
    ) -> EngineResult<Vec<ThresholdAdjustment>> {
        let snapshot = self.snapshot().await;
        if !snapshot.enabled {
            return Ok(Vec::new());
        }

        let layers: [(&str, LayerThresholds); 3] = [
            (LAYER_REPRODUCTION, snapshot.phase2_reproduction),
            (LAYER_LOOP_DETECTION, snapshot.phase3_iteration_threshold),
            (LAYER_COMPLEXITY, snapshot.phase3_complexity_threshold),
        ];

        let mut adjustments = Vec::new();
        for (layer, tuning) in layers {
            let min_sample = min_sample_override.unwrap_or(tuning.min_sample);
            let analysis = self
                .metrics
                .analyze_threshold(layer, tuning.threshold, tuning.min, tuning.max, min_sample)
                .await?;

            if analysis.confidence < CONFIDENCE_FLOOR {
                continue;
            }

            let delta = analysis.suggested - tuning.threshold;
            let hysteresis = tuning.adjust_step / 2.0;
            if delta.abs() <= hysteresis {
                continue;
            }

            let step = tuning.adjust_step.copysign(delta);
            let adjusted = (tuning.threshold + step).clamp(tuning.min, tuning.max);
            if (adjusted - tuning.threshold).abs() < f64::EPSILON {
                continue;
            }

            {
                let mut config = self.config.write().await;
                let target = match layer {
                    LAYER_REPRODUCTION => &mut config.phase2_reproduction,
                    LAYER_COMPLEXITY => &mut config.phase3_complexity_threshold,
                    _ => &mut config.phase3_iteration_threshold,
                };
                target.threshold = adjusted;
            }

            tracing::info!(
                layer,
                previous = tuning.threshold,
                current = adjusted,
                confidence = analysis.confidence,
                "adjusted reliability threshold"
            );
            adjustments.push(ThresholdAdjustment {
                layer: layer.to_string(),
                previous: tuning.threshold,
                current: adjusted,
                confidence: analysis.confidence,
                data_points: analysis.data_points,
            });
        }
        Ok(adjustments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ReliabilityTelemetry;
    use medic_store::Store;
    use serde_json::json;

    async fn service_with_events(
        triggered: usize,
        passed: usize,
    ) -> (AdaptiveThresholdService, ReliabilityTelemetry) {
        let store = Store::connect_in_memory().await.unwrap();
        let telemetry = ReliabilityTelemetry::new(store.clone(), true);
        for _ in 0..triggered {
            telemetry
                .record_event(LAYER_REPRODUCTION, true, 0.5, json!({}), "triggered")
                .await
                .unwrap();
        }
        for _ in 0..passed {
            telemetry
                .record_event(LAYER_REPRODUCTION, false, 0.5, json!({}), "passed")
                .await
                .unwrap();
        }
        let service = AdaptiveThresholdService::new(
            AdaptiveThresholdsConfig::default(),
            ReliabilityMetrics::new(store),
        );
        (service, telemetry)
    }

    #[tokio::test]
    async fn test_no_adjustment_below_confidence_floor() {
        // 20-sample minimum; only 4 events recorded.
        let (service, _) = service_with_events(4, 0).await;
        let adjustments = service.analyze_and_adjust(None).await.unwrap();
        assert!(adjustments.is_empty());
    }

    #[tokio::test]
    async fn test_hot_layer_loosens_threshold_within_bounds() {
        let (service, _) = service_with_events(25, 0).await;
        let before = service.threshold_for(LAYER_REPRODUCTION).await;

        let adjustments = service.analyze_and_adjust(None).await.unwrap();
        assert_eq!(adjustments.len(), 1);
        let adjustment = &adjustments[0];
        assert_eq!(adjustment.layer, LAYER_REPRODUCTION);
        assert!(adjustment.current > before);

        let snapshot = service.snapshot().await;
        let layer = snapshot.phase2_reproduction;
        assert!(adjustment.current <= layer.max);
        assert!(adjustment.current >= layer.min);
        assert!(
            (service.threshold_for(LAYER_REPRODUCTION).await - adjustment.current).abs()
                < f64::EPSILON
        );
    }

    #[tokio::test]
    async fn test_balanced_layer_untouched() {
        // Trigger rate 0.3 sits inside the dead band.
        let (service, _) = service_with_events(9, 21).await;
        let adjustments = service.analyze_and_adjust(None).await.unwrap();
        assert!(adjustments.is_empty());
    }

    #[tokio::test]
    async fn test_complexity_layer_adjusts_too() {
        let store = Store::connect_in_memory().await.unwrap();
        let telemetry = ReliabilityTelemetry::new(store.clone(), true);
        for _ in 0..25 {
            telemetry
                .record_event(LAYER_COMPLEXITY, true, 7.0, json!({}), "triggered")
                .await
                .unwrap();
        }
        let service = AdaptiveThresholdService::new(
            AdaptiveThresholdsConfig::default(),
            ReliabilityMetrics::new(store),
        );

        let before = service.threshold_for(LAYER_COMPLEXITY).await;
        let adjustments = service.analyze_and_adjust(None).await.unwrap();
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].layer, LAYER_COMPLEXITY);
        assert!(service.threshold_for(LAYER_COMPLEXITY).await > before);

        let snapshot = service.snapshot().await;
        assert!(
            snapshot.phase3_complexity_threshold.threshold
                <= snapshot.phase3_complexity_threshold.max
        );
    }

    #[tokio::test]
    async fn test_disabled_master_switch() {
        let store = Store::connect_in_memory().await.unwrap();
        let service = AdaptiveThresholdService::new(
            AdaptiveThresholdsConfig {
                enabled: false,
                ..Default::default()
            },
            ReliabilityMetrics::new(store),
        );
        assert!(service.analyze_and_adjust(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_adjustments_respect_clamp() {
        let (service, telemetry) = service_with_events(40, 0).await;
        for _ in 0..40 {
            telemetry
                .record_event(LAYER_REPRODUCTION, true, 0.5, json!({}), "triggered")
                .await
                .unwrap();
        }

        for _ in 0..20 {
            service.analyze_and_adjust(None).await.unwrap();
        }
        let snapshot = service.snapshot().await;
        assert!(
            snapshot.phase2_reproduction.threshold <= snapshot.phase2_reproduction.max
        );
    }
}
