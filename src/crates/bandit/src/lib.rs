//! Online bandit policies for adaptive model selection
//!
//! This crate provides the recommend-and-update algorithms used by the router
//! to pick a model per request and learn from realized outcomes:
//!
//! - [`EpsilonGreedy`] - uniform exploration with probability epsilon
//! - [`Ucb1`] - deterministic upper-confidence-bound scoring
//! - [`ThompsonSampling`] - Beta-Bernoulli posterior sampling with an
//!   entropy watchdog that recovers from premature convergence
//! - [`LinUcb`] - contextual linear bandit with a periodically recomputed
//!   cached matrix inverse
//!
//! All policies accept scalar rewards in `[0, 1]`, are seedable so selection
//! is reproducible in tests, and serialize to [`state::PolicyState`] for
//! per-tenant persistence.

pub mod epsilon_greedy;
pub mod linucb;
pub mod state;
pub mod thompson;
pub mod ucb;

pub use epsilon_greedy::{EpsilonGreedy, EpsilonGreedyConfig};
pub use linucb::{LinUcb, LinUcbConfig};
pub use state::PolicyState;
pub use thompson::{ThompsonConfig, ThompsonSampling};
pub use ucb::Ucb1;

use thiserror::Error;

/// Errors that can occur inside a bandit policy
#[derive(Debug, Error)]
pub enum BanditError {
    /// Context feature vector has the wrong dimension
    #[error("context dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Context feature vector failed the quality gate
    #[error("context norm {norm} outside accepted range [{min}, {max}]")]
    ContextRejected { norm: f64, min: f64, max: f64 },

    /// Persisted state could not be applied to this policy
    #[error("invalid policy state: {0}")]
    InvalidState(String),
}

/// Result type for bandit operations
pub type Result<T> = std::result::Result<T, BanditError>;

/// Clamp a reward into `[0, 1]`, mapping non-finite values to 0.
pub(crate) fn clamp01(r: f64) -> f64 {
    if !r.is_finite() {
        return 0.0;
    }
    r.clamp(0.0, 1.0)
}

/// Shannon entropy (bits) of an unnormalized non-negative weight vector.
///
/// Weights are normalized to a distribution first; zero or degenerate inputs
/// yield 0. Used both for the Thompson posterior-mean watchdog and for
/// selection-count diversity in the router registry.
pub fn shannon_entropy_bits(weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mut h = 0.0;
    for w in weights {
        if w.is_finite() && *w > 0.0 {
            let p = w / total;
            h -= p * p.log2();
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entropy_uniform_two_arms() {
        let h = shannon_entropy_bits(&[1.0, 1.0]);
        assert!((h - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_entropy_degenerate() {
        assert_eq!(shannon_entropy_bits(&[]), 0.0);
        assert_eq!(shannon_entropy_bits(&[0.0, 0.0]), 0.0);
        assert_eq!(shannon_entropy_bits(&[5.0]), 0.0);
    }

    #[test]
    fn test_entropy_skewed_below_uniform() {
        let uniform = shannon_entropy_bits(&[1.0, 1.0, 1.0]);
        let skewed = shannon_entropy_bits(&[100.0, 1.0, 1.0]);
        assert!(skewed < uniform);
    }

    #[test]
    fn test_clamp01() {
        assert_eq!(clamp01(-0.5), 0.0);
        assert_eq!(clamp01(1.5), 1.0);
        assert_eq!(clamp01(f64::NAN), 0.0);
        assert_eq!(clamp01(0.3), 0.3);
    }
}
