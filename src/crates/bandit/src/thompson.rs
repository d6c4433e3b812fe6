//! Thompson sampling bandit policy.
//!
//! Beta-Bernoulli sampling generalized to bounded rewards: an update with
//! reward `r` in `[0, 1]` applies `alpha += r` and `beta += 1 - r`, so the
//! posterior treats the reward as a fractional success.
//!
//! An entropy watchdog guards against premature convergence: after each update
//! the Shannon entropy of the normalized posterior means is checked, and once
//! it stays below the configured threshold for a configured number of
//! consecutive updates, every arm is decayed back toward the prior (never
//! zeroed) so exploration can resume.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{clamp01, shannon_entropy_bits};

/// Configuration for Thompson sampling.
///
/// The watchdog fields are required tuning inputs: `entropy_threshold` is in
/// bits over the normalized posterior means (`0.0` disables the watchdog),
/// `entropy_window` is the number of consecutive low-entropy updates that
/// trigger a decay, and `entropy_decay` is the retained fraction of the
/// distance from the prior (`0.5` halves learned state, `1.0` is a no-op).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThompsonConfig {
    /// Prior alpha (must be > 0; non-positive values fall back to 1.0).
    #[serde(default = "default_prior")]
    pub prior_alpha: f64,

    /// Prior beta (must be > 0; non-positive values fall back to 1.0).
    #[serde(default = "default_prior")]
    pub prior_beta: f64,

    /// Posterior-mean entropy floor in bits; `0.0` disables the watchdog.
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,

    /// Consecutive low-entropy updates required to trigger a decay.
    #[serde(default = "default_entropy_window")]
    pub entropy_window: u32,

    /// Retained fraction of learned state on decay, in `(0, 1]`.
    #[serde(default = "default_entropy_decay")]
    pub entropy_decay: f64,

    /// RNG seed (deterministic by default).
    #[serde(default)]
    pub seed: u64,
}

fn default_prior() -> f64 {
    1.0
}

fn default_entropy_threshold() -> f64 {
    0.5
}

fn default_entropy_window() -> u32 {
    10
}

fn default_entropy_decay() -> f64 {
    0.5
}

impl Default for ThompsonConfig {
    fn default() -> Self {
        Self {
            prior_alpha: default_prior(),
            prior_beta: default_prior(),
            entropy_threshold: default_entropy_threshold(),
            entropy_window: default_entropy_window(),
            entropy_decay: default_entropy_decay(),
            seed: 0,
        }
    }
}

/// Beta posterior state for one arm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BetaArm {
    pub alpha: f64,
    pub beta: f64,
    pub pulls: u64,
}

impl BetaArm {
    /// Posterior mean `alpha / (alpha + beta)`.
    pub fn posterior_mean(&self) -> f64 {
        let denom = self.alpha + self.beta;
        if denom <= 0.0 {
            0.5
        } else {
            self.alpha / denom
        }
    }
}

/// Seedable Thompson-sampling bandit with an entropy watchdog.
#[derive(Debug, Clone)]
pub struct ThompsonSampling {
    cfg: ThompsonConfig,
    order: Vec<String>,
    arms: HashMap<String, BetaArm>,
    rng: StdRng,
    low_entropy_streak: u32,
}

impl ThompsonSampling {
    pub fn new(cfg: ThompsonConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            cfg,
            order: Vec::new(),
            arms: HashMap::new(),
            low_entropy_streak: 0,
        }
    }

    /// Per-arm posterior state.
    pub fn arms(&self) -> &HashMap<String, BetaArm> {
        &self.arms
    }

    /// Posterior state for a single arm.
    pub fn arm_state(&self, arm: &str) -> Option<&BetaArm> {
        self.arms.get(arm)
    }

    fn prior(&self) -> (f64, f64) {
        let a = self.cfg.prior_alpha;
        let b = self.cfg.prior_beta;
        (
            if a.is_finite() && a > 0.0 { a } else { 1.0 },
            if b.is_finite() && b > 0.0 { b } else { 1.0 },
        )
    }

    fn register(&mut self, arms: &[String]) {
        let (a, b) = self.prior();
        for arm in arms {
            if !self.arms.contains_key(arm) {
                self.order.push(arm.clone());
                self.arms.insert(
                    arm.clone(),
                    BetaArm {
                        alpha: a,
                        beta: b,
                        pulls: 0,
                    },
                );
            }
        }
    }

    fn sample_beta(&mut self, alpha: f64, beta: f64) -> f64 {
        if !(alpha.is_finite() && beta.is_finite()) || alpha <= 0.0 || beta <= 0.0 {
            return 0.5;
        }
        match Beta::new(alpha, beta) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0.5,
        }
    }

    fn seen_rank(&self, arm: &str) -> usize {
        self.order.iter().position(|a| a == arm).unwrap_or(usize::MAX)
    }

    /// Select an arm from `arms`.
    ///
    /// Any arm never pulled is selected first (input order); otherwise each
    /// arm's Beta posterior is sampled and the maximum draw wins, with ties
    /// going to the earliest-seen arm.
    pub fn select(&mut self, arms: &[String]) -> Option<String> {
        if arms.is_empty() {
            return None;
        }
        self.register(arms);

        for arm in arms {
            if self.arms.get(arm).map(|a| a.pulls).unwrap_or(0) == 0 {
                return Some(arm.clone());
            }
        }

        let mut best: Option<String> = None;
        let mut best_draw = f64::NEG_INFINITY;
        let mut best_rank = usize::MAX;
        for arm in arms {
            let state = match self.arms.get(arm) {
                Some(s) => *s,
                None => continue,
            };
            let draw = self.sample_beta(state.alpha, state.beta);
            let rank = self.seen_rank(arm);
            if draw > best_draw || (draw == best_draw && rank < best_rank) {
                best_draw = draw;
                best_rank = rank;
                best = Some(arm.clone());
            }
        }
        best
    }

    /// Update the chosen arm with a bounded reward in `[0, 1]`, then run the
    /// entropy watchdog.
    pub fn update(&mut self, arm: &str, reward: f64) {
        let r = clamp01(reward);
        let (a, b) = self.prior();
        if !self.arms.contains_key(arm) {
            self.order.push(arm.to_string());
        }
        let state = self.arms.entry(arm.to_string()).or_insert(BetaArm {
            alpha: a,
            beta: b,
            pulls: 0,
        });
        state.alpha += r;
        state.beta += 1.0 - r;
        state.pulls += 1;

        self.check_entropy();
    }

    /// Shannon entropy (bits) of the normalized posterior means across arms.
    pub fn posterior_entropy(&self) -> f64 {
        let means: Vec<f64> = self.arms.values().map(|a| a.posterior_mean()).collect();
        shannon_entropy_bits(&means)
    }

    fn check_entropy(&mut self) {
        if self.cfg.entropy_threshold <= 0.0 || self.arms.len() < 2 {
            return;
        }
        if self.posterior_entropy() < self.cfg.entropy_threshold {
            self.low_entropy_streak += 1;
        } else {
            self.low_entropy_streak = 0;
        }
        if self.low_entropy_streak >= self.cfg.entropy_window.max(1) {
            self.decay_toward_prior();
            self.low_entropy_streak = 0;
        }
    }

    /// Pull every arm's posterior back toward the prior, retaining
    /// `entropy_decay` of the learned offset. State is never reset to zero.
    pub fn decay_toward_prior(&mut self) {
        let (pa, pb) = self.prior();
        let decay = if self.cfg.entropy_decay.is_finite() && self.cfg.entropy_decay > 0.0 {
            self.cfg.entropy_decay.min(1.0)
        } else {
            0.5
        };
        for state in self.arms.values_mut() {
            state.alpha = pa + (state.alpha - pa) * decay;
            state.beta = pb + (state.beta - pb) * decay;
        }
    }

    pub(crate) fn restore_parts(&mut self, order: Vec<String>, arms: HashMap<String, BetaArm>) {
        self.order = order;
        self.arms = arms;
        self.low_entropy_streak = 0;
    }
}

impl Default for ThompsonSampling {
    fn default() -> Self {
        Self::new(ThompsonConfig::default())
    }
}
