//! Reward shaping for the bandit feedback loop.
//!
//! Converts raw outcome metrics (cost, latency, quality signal) into one
//! normalized scalar in `[0, 1]`. Pure functions only; the breakdown is
//! created once per completed request and logged for analysis.

use serde::{Deserialize, Serialize};

use crate::{Outcome, QualitySignals};

/// Per-component weights for reward shaping. Fully overridable per tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardWeights {
    #[serde(default = "default_cost_weight")]
    pub cost: f64,
    #[serde(default = "default_latency_weight")]
    pub latency: f64,
    #[serde(default)]
    pub quality: f64,
}

fn default_cost_weight() -> f64 {
    0.5
}

fn default_latency_weight() -> f64 {
    0.5
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            cost: default_cost_weight(),
            latency: default_latency_weight(),
            quality: 0.0,
        }
    }
}

/// Immutable record of how one request's reward was computed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub cost_component: f64,
    pub latency_component: f64,
    pub quality_component: f64,
    pub weights: RewardWeights,
    /// Weighted mean of the components, clamped to `[0, 1]`.
    pub total: f64,
}

fn clamp01(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.0;
    }
    v.clamp(0.0, 1.0)
}

/// Compute the shaped reward for one completed request.
///
/// Cost and latency are normalized against the supplied references
/// (`1 - min(1, actual/reference)`); the quality signal is passed through
/// unchanged. The total is the weighted mean over non-zero weights; when all
/// weights are zero the total is 0.
pub fn compute_reward(
    outcome: &Outcome,
    signals: &QualitySignals,
    weights: &RewardWeights,
    reference_cost_usd: f64,
    latency_window_ms: u64,
) -> RewardBreakdown {
    let cost_component = if reference_cost_usd > 0.0 {
        clamp01(1.0 - (outcome.cost_usd / reference_cost_usd).min(1.0))
    } else {
        0.0
    };
    let latency_component = if latency_window_ms > 0 {
        clamp01(1.0 - (outcome.latency_ms as f64 / latency_window_ms as f64).min(1.0))
    } else {
        0.0
    };
    let quality_component = clamp01(signals.quality.unwrap_or(0.0));

    let weight_sum = weights.cost.max(0.0) + weights.latency.max(0.0) + weights.quality.max(0.0);
    let total = if weight_sum > 0.0 {
        clamp01(
            (weights.cost.max(0.0) * cost_component
                + weights.latency.max(0.0) * latency_component
                + weights.quality.max(0.0) * quality_component)
                / weight_sum,
        )
    } else {
        0.0
    };

    RewardBreakdown {
        cost_component,
        latency_component,
        quality_component,
        weights: *weights,
        total,
    }
}
