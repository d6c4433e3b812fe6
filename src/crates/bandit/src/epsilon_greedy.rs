//! Epsilon-greedy bandit policy.
//!
//! With probability epsilon the policy explores uniformly at random; otherwise
//! it exploits the arm with the highest running mean reward. Ties are broken
//! by first-seen order, so selection is fully deterministic under a fixed seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::clamp01;

/// Configuration for epsilon-greedy selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EpsilonGreedyConfig {
    /// Exploration probability in `[0, 1]`.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// RNG seed (deterministic by default).
    #[serde(default)]
    pub seed: u64,
}

fn default_epsilon() -> f64 {
    0.1
}

impl Default for EpsilonGreedyConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            seed: 0,
        }
    }
}

/// Running mean statistics for one arm.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MeanStats {
    /// Number of rewarded pulls.
    pub pulls: u64,
    /// Incremental mean reward.
    pub mean: f64,
}

/// Seedable epsilon-greedy bandit.
#[derive(Debug, Clone)]
pub struct EpsilonGreedy {
    cfg: EpsilonGreedyConfig,
    order: Vec<String>,
    stats: HashMap<String, MeanStats>,
    rng: StdRng,
}

impl EpsilonGreedy {
    pub fn new(cfg: EpsilonGreedyConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            cfg,
            order: Vec::new(),
            stats: HashMap::new(),
        }
    }

    /// Per-arm statistics.
    pub fn stats(&self) -> &HashMap<String, MeanStats> {
        &self.stats
    }

    /// Arms in the order they were first presented.
    pub fn arm_order(&self) -> &[String] {
        &self.order
    }

    fn register(&mut self, arms: &[String]) {
        for arm in arms {
            if !self.stats.contains_key(arm) {
                self.order.push(arm.clone());
                self.stats.insert(arm.clone(), MeanStats::default());
            }
        }
    }

    /// First-seen rank of an arm, used for deterministic tie-breaking.
    fn seen_rank(&self, arm: &str) -> usize {
        self.order.iter().position(|a| a == arm).unwrap_or(usize::MAX)
    }

    /// Select an arm from `arms`.
    ///
    /// Explores uniformly with probability epsilon, otherwise picks the arm
    /// with the highest mean reward (ties to the earliest-seen arm).
    pub fn select(&mut self, arms: &[String]) -> Option<String> {
        if arms.is_empty() {
            return None;
        }
        self.register(arms);

        if self.rng.gen::<f64>() < self.cfg.epsilon.clamp(0.0, 1.0) {
            let idx = self.rng.gen_range(0..arms.len());
            return Some(arms[idx].clone());
        }

        let mut best: Option<&String> = None;
        let mut best_mean = f64::NEG_INFINITY;
        let mut best_rank = usize::MAX;
        for arm in arms {
            let mean = self.stats.get(arm).map(|s| s.mean).unwrap_or(0.0);
            let rank = self.seen_rank(arm);
            if mean > best_mean || (mean == best_mean && rank < best_rank) {
                best_mean = mean;
                best_rank = rank;
                best = Some(arm);
            }
        }
        best.cloned()
    }

    /// Update the chosen arm with a bounded reward in `[0, 1]`.
    pub fn update(&mut self, arm: &str, reward: f64) {
        let r = clamp01(reward);
        if !self.stats.contains_key(arm) {
            self.order.push(arm.to_string());
        }
        let stats = self.stats.entry(arm.to_string()).or_default();
        stats.mean += (r - stats.mean) / (stats.pulls as f64 + 1.0);
        stats.pulls += 1;
    }

    pub(crate) fn restore_parts(&mut self, order: Vec<String>, stats: HashMap<String, MeanStats>) {
        self.order = order;
        self.stats = stats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exploit_picks_highest_mean() {
        let cfg = EpsilonGreedyConfig {
            epsilon: 0.0,
            seed: 7,
        };
        let mut eg = EpsilonGreedy::new(cfg);
        let candidates = arms(&["a", "b", "c"]);

        eg.update("a", 0.2);
        eg.update("b", 0.9);
        eg.update("c", 0.5);

        assert_eq!(eg.select(&candidates).unwrap(), "b");
    }

    #[test]
    fn test_tie_broken_by_first_seen_order() {
        let cfg = EpsilonGreedyConfig {
            epsilon: 0.0,
            seed: 0,
        };
        let mut eg = EpsilonGreedy::new(cfg);
        let candidates = arms(&["x", "y"]);

        // Both arms untouched: identical means, "x" was seen first.
        assert_eq!(eg.select(&candidates).unwrap(), "x");

        eg.update("x", 0.5);
        eg.update("y", 0.5);
        assert_eq!(eg.select(&candidates).unwrap(), "x");
    }

    #[test]
    fn test_incremental_mean() {
        let mut eg = EpsilonGreedy::new(EpsilonGreedyConfig::default());
        eg.update("a", 1.0);
        eg.update("a", 0.0);
        eg.update("a", 0.5);

        let stats = eg.stats().get("a").unwrap();
        assert_eq!(stats.pulls, 3);
        assert!((stats.mean - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_full_exploration_stays_in_candidate_set() {
        let cfg = EpsilonGreedyConfig {
            epsilon: 1.0,
            seed: 42,
        };
        let mut eg = EpsilonGreedy::new(cfg);
        let candidates = arms(&["a", "b"]);
        for _ in 0..50 {
            let chosen = eg.select(&candidates).unwrap();
            assert!(candidates.contains(&chosen));
        }
    }

    #[test]
    fn test_deterministic_given_seed() {
        let cfg = EpsilonGreedyConfig {
            epsilon: 0.5,
            seed: 99,
        };
        let mut a = EpsilonGreedy::new(cfg);
        let mut b = EpsilonGreedy::new(cfg);
        let candidates = arms(&["m1", "m2", "m3"]);
        for _ in 0..20 {
            assert_eq!(a.select(&candidates), b.select(&candidates));
        }
    }

    #[test]
    fn test_empty_candidates() {
        let mut eg = EpsilonGreedy::new(EpsilonGreedyConfig::default());
        assert!(eg.select(&[]).is_none());
    }
}
