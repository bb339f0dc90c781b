//! Composite provider scoring.
//!
//! Each provider input is normalized to [0,1] with a monotonic transform
//! (larger model higher, lower latency higher, lower cost higher) and the
//! composite is a weighted sum. Missing inputs (encoded as zero) take a
//! neutral 0.5 so a brand-new provider is never disqualified by absence.

use serde::{Deserialize, Serialize};

use loom_core::types::ProviderConfig;

/// Providers whose scores are within this distance of the top score are
/// considered tied and rotated round-robin.
pub const TIE_EPSILON: f64 = 0.01;

/// Neutral sub-score used when an input is unknown.
const NEUTRAL: f64 = 0.5;

/// Model size (billions) at which the size sub-score reaches 0.5.
const SIZE_MIDPOINT_B: f64 = 20.0;

/// Latency (ms) at which a latency sub-score reaches 0.5.
const LATENCY_MIDPOINT_MS: f64 = 1000.0;

/// Cost ($/Mtok) at which the cost sub-score reaches 0.5.
const COST_MIDPOINT: f64 = 5.0;

// ---------------------------------------------------------------------------
// ScorerWeights
// ---------------------------------------------------------------------------

/// Weights for the four scoring inputs. Any positive total is accepted; the
/// composite normalizes by the sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorerWeights {
    pub size: f64,
    pub rtt: f64,
    pub request_latency: f64,
    pub cost: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            size: 0.4,
            rtt: 0.2,
            request_latency: 0.3,
            cost: 0.1,
        }
    }
}

impl ScorerWeights {
    fn total(&self) -> f64 {
        self.size + self.rtt + self.request_latency + self.cost
    }
}

// ---------------------------------------------------------------------------
// Sub-score transforms
// ---------------------------------------------------------------------------

/// Larger models score higher; saturating curve with 0.5 at the midpoint.
fn size_score(size_b: f64) -> f64 {
    if size_b <= 0.0 {
        return NEUTRAL;
    }
    size_b / (size_b + SIZE_MIDPOINT_B)
}

/// Lower latency scores higher.
fn latency_score(latency_ms: f64) -> f64 {
    if latency_ms <= 0.0 {
        return NEUTRAL;
    }
    LATENCY_MIDPOINT_MS / (LATENCY_MIDPOINT_MS + latency_ms)
}

/// Lower cost scores higher.
fn cost_score(cost_per_mtok: f64) -> f64 {
    if cost_per_mtok <= 0.0 {
        return NEUTRAL;
    }
    COST_MIDPOINT / (COST_MIDPOINT + cost_per_mtok)
}

// ---------------------------------------------------------------------------
// Composite
// ---------------------------------------------------------------------------

/// Compute the composite capability score for a provider, in [0,1].
pub fn composite_score(provider: &ProviderConfig, weights: &ScorerWeights) -> f64 {
    let total = weights.total();
    if total <= 0.0 {
        return NEUTRAL;
    }

    let weighted = weights.size * size_score(provider.model_size_b)
        + weights.rtt * latency_score(provider.heartbeat_latency_ms)
        + weights.request_latency * latency_score(provider.avg_request_latency_ms)
        + weights.cost * cost_score(provider.cost_per_mtok);

    (weighted / total).clamp(0.0, 1.0)
}

/// Whether `score` ties with the `top` score.
pub fn is_tied_with_top(top: f64, score: f64) -> bool {
    top - score <= TIE_EPSILON
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::types::ProviderType;

    fn provider(size_b: f64, hb_ms: f64, req_ms: f64, cost: f64) -> ProviderConfig {
        let mut p = ProviderConfig::new("p", ProviderType::OpenaiCompatible, "http://x", "m");
        p.model_size_b = size_b;
        p.heartbeat_latency_ms = hb_ms;
        p.avg_request_latency_ms = req_ms;
        p.cost_per_mtok = cost;
        p
    }

    #[test]
    fn larger_model_scores_higher() {
        let weights = ScorerWeights::default();
        let small = composite_score(&provider(7.0, 100.0, 500.0, 1.0), &weights);
        let large = composite_score(&provider(70.0, 100.0, 500.0, 1.0), &weights);
        assert!(large > small);
    }

    #[test]
    fn lower_latency_scores_higher() {
        let weights = ScorerWeights::default();
        let slow = composite_score(&provider(32.0, 100.0, 4000.0, 1.0), &weights);
        let fast = composite_score(&provider(32.0, 100.0, 200.0, 1.0), &weights);
        assert!(fast > slow);
    }

    #[test]
    fn lower_cost_scores_higher() {
        let weights = ScorerWeights::default();
        let pricey = composite_score(&provider(32.0, 100.0, 500.0, 60.0), &weights);
        let cheap = composite_score(&provider(32.0, 100.0, 500.0, 0.5), &weights);
        assert!(cheap > pricey);
    }

    #[test]
    fn missing_inputs_take_neutral_defaults() {
        let weights = ScorerWeights::default();
        let unknown = composite_score(&provider(0.0, 0.0, 0.0, 0.0), &weights);
        assert!((unknown - 0.5).abs() < 1e-9);
    }

    #[test]
    fn score_is_bounded() {
        let weights = ScorerWeights::default();
        let extreme = composite_score(&provider(100_000.0, 0.001, 0.001, 0.0001), &weights);
        assert!((0.0..=1.0).contains(&extreme));
    }

    #[test]
    fn weights_normalize_by_total() {
        // Doubling every weight must not change the composite.
        let base = ScorerWeights::default();
        let doubled = ScorerWeights {
            size: base.size * 2.0,
            rtt: base.rtt * 2.0,
            request_latency: base.request_latency * 2.0,
            cost: base.cost * 2.0,
        };
        let p = provider(32.0, 120.0, 800.0, 2.0);
        let a = composite_score(&p, &base);
        let b = composite_score(&p, &doubled);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn zero_weights_degrade_to_neutral() {
        let weights = ScorerWeights {
            size: 0.0,
            rtt: 0.0,
            request_latency: 0.0,
            cost: 0.0,
        };
        let p = provider(32.0, 120.0, 800.0, 2.0);
        assert!((composite_score(&p, &weights) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn tie_window_is_one_hundredth() {
        assert!(is_tied_with_top(0.82, 0.815));
        assert!(is_tied_with_top(0.82, 0.81));
        assert!(!is_tied_with_top(0.82, 0.80));
    }
}
