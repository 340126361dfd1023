//! Candidate ranking: confidence bands of 0.1, strategy score as the
//! tie-break (direct > conservative > alternative).

use crate::pipeline::candidates::PatchCandidate;

const CONFIDENCE_BAND: f64 = 0.1;

/// Rank candidates best-first.
#[must_use]
pub fn rank_patches(mut candidates: Vec<PatchCandidate>) -> Vec<PatchCandidate> {
    candidates.sort_by(|a, b| {
        let band_a = (a.confidence / CONFIDENCE_BAND).floor() as i64;
        let band_b = (b.confidence / CONFIDENCE_BAND).floor() as i64;
        band_b
            .cmp(&band_a)
            .then_with(|| b.strategy.score().cmp(&a.strategy.score()))
            .then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::candidates::PatchStrategy;

    fn candidate(strategy: PatchStrategy, confidence: f64) -> PatchCandidate {
        PatchCandidate {
            id: format!("patch-{}", strategy.as_str()),
            code: String::new(),
            description: String::new(),
            confidence,
            strategy,
            reasoning: String::new(),
        }
    }

    #[test]
    fn test_higher_band_wins_over_strategy() {
        let ranked = rank_patches(vec![
            candidate(PatchStrategy::Direct, 0.62),
            candidate(PatchStrategy::Alternative, 0.91),
        ]);
        assert_eq!(ranked[0].strategy, PatchStrategy::Alternative);
    }

    #[test]
    fn test_same_band_prefers_direct() {
        let ranked = rank_patches(vec![
            candidate(PatchStrategy::Alternative, 0.88),
            candidate(PatchStrategy::Direct, 0.82),
            candidate(PatchStrategy::Conservative, 0.85),
        ]);
        assert_eq!(ranked[0].strategy, PatchStrategy::Direct);
        assert_eq!(ranked[1].strategy, PatchStrategy::Conservative);
        assert_eq!(ranked[2].strategy, PatchStrategy::Alternative);
    }

    #[test]
    fn test_stable_on_exact_tie() {
        let ranked = rank_patches(vec![
            candidate(PatchStrategy::Direct, 0.75),
            candidate(PatchStrategy::Direct, 0.75),
        ]);
        assert_eq!(ranked.len(), 2);
    }
}
