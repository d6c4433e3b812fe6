//! UCB1 bandit policy.
//!
//! Deterministic upper-confidence-bound selection: any arm that has never been
//! pulled is selected first (exploration floor, in input order); once every arm
//! has at least one pull, arms are scored by
//! `mean + sqrt(2 * ln(total_pulls) / pulls)` and the maximum wins.

use std::collections::HashMap;

use crate::clamp01;
use crate::epsilon_greedy::MeanStats;

/// UCB1 bandit. Needs no RNG; selection is a pure function of history.
#[derive(Debug, Clone, Default)]
pub struct Ucb1 {
    order: Vec<String>,
    stats: HashMap<String, MeanStats>,
    total_pulls: u64,
}

impl Ucb1 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-arm statistics.
    pub fn stats(&self) -> &HashMap<String, MeanStats> {
        &self.stats
    }

    /// Total updates across all arms.
    pub fn total_pulls(&self) -> u64 {
        self.total_pulls
    }

    fn register(&mut self, arms: &[String]) {
        for arm in arms {
            if !self.stats.contains_key(arm) {
                self.order.push(arm.clone());
                self.stats.insert(arm.clone(), MeanStats::default());
            }
        }
    }

    fn seen_rank(&self, arm: &str) -> usize {
        self.order.iter().position(|a| a == arm).unwrap_or(usize::MAX)
    }

    /// Upper confidence bound for one arm, or `None` if it was never pulled.
    fn score(&self, arm: &str) -> Option<f64> {
        let stats = self.stats.get(arm)?;
        if stats.pulls == 0 {
            return None;
        }
        let total = self.total_pulls.max(1) as f64;
        let bonus = (2.0 * total.ln() / stats.pulls as f64).sqrt();
        Some(stats.mean + bonus)
    }

    /// Select an arm from `arms`.
    pub fn select(&mut self, arms: &[String]) -> Option<String> {
        if arms.is_empty() {
            return None;
        }
        self.register(arms);

        // Exploration floor: every arm gets pulled once, in input order.
        for arm in arms {
            if self.stats.get(arm).map(|s| s.pulls).unwrap_or(0) == 0 {
                return Some(arm.clone());
            }
        }

        let mut best: Option<&String> = None;
        let mut best_score = f64::NEG_INFINITY;
        let mut best_rank = usize::MAX;
        for arm in arms {
            let score = self.score(arm).unwrap_or(f64::NEG_INFINITY);
            let rank = self.seen_rank(arm);
            if score > best_score || (score == best_score && rank < best_rank) {
                best_score = score;
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
        self.total_pulls += 1;
    }

    pub(crate) fn restore_parts(
        &mut self,
        order: Vec<String>,
        stats: HashMap<String, MeanStats>,
        total_pulls: u64,
    ) {
        self.order = order;
        self.stats = stats;
        self.total_pulls = total_pulls;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unpulled_arms_selected_first_in_input_order() {
        let mut ucb = Ucb1::new();
        let candidates = arms(&["a", "b", "c"]);

        assert_eq!(ucb.select(&candidates).unwrap(), "a");
        ucb.update("a", 0.5);
        assert_eq!(ucb.select(&candidates).unwrap(), "b");
        ucb.update("b", 0.5);
        assert_eq!(ucb.select(&candidates).unwrap(), "c");
    }

    #[test]
    fn test_ucb_score_favors_undersampled_arm() {
        let mut ucb = Ucb1::new();
        let candidates = arms(&["a", "b"]);

        // Equal means, but "b" has far fewer pulls: its bonus dominates.
        for _ in 0..20 {
            ucb.update("a", 0.5);
        }
        ucb.update("b", 0.5);

        assert_eq!(ucb.select(&candidates).unwrap(), "b");
    }

    #[test]
    fn test_higher_mean_wins_at_equal_pulls() {
        let mut ucb = Ucb1::new();
        let candidates = arms(&["a", "b"]);

        for _ in 0..5 {
            ucb.update("a", 0.9);
            ucb.update("b", 0.1);
        }

        assert_eq!(ucb.select(&candidates).unwrap(), "a");
    }

    #[test]
    fn test_total_pulls_accumulates() {
        let mut ucb = Ucb1::new();
        ucb.update("a", 1.0);
        ucb.update("b", 0.0);
        ucb.update("a", 1.0);
        assert_eq!(ucb.total_pulls(), 3);
        assert_eq!(ucb.stats().get("a").unwrap().pulls, 2);
    }

    #[test]
    fn test_empty_candidates() {
        let mut ucb = Ucb1::new();
        assert!(ucb.select(&[]).is_none());
    }
}
