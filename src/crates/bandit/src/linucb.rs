//! Contextual linear bandit (LinUCB).
//!
//! Each arm keeps ridge-regression sufficient statistics `A` (d x d, seeded as
//! `lambda * I`) and `b` (d-vector). Scoring uses
//! `x . theta + alpha * sqrt(x . A_inv . x)` with `theta = A_inv b`.
//!
//! The inverse of `A` is cached and only recomputed once a staleness counter
//! reaches `recompute_interval`; between recomputations scoring uses the stale
//! cached inverse. That bounded approximation error is an accepted tradeoff
//! for a ranking heuristic and keeps update cost flat.
//!
//! Contexts are validated before use: a wrong dimension or an L2 norm outside
//! `[min_context_norm, max_context_norm]` is reported as a typed error so the
//! caller can fall back to a non-contextual policy for that decision.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{clamp01, BanditError, Result};

/// Configuration for LinUCB.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinUcbConfig {
    /// Feature vector dimension (must be >= 1).
    #[serde(default = "default_dim")]
    pub dim: usize,

    /// Ridge regularization lambda (must be > 0).
    #[serde(default = "default_lambda")]
    pub lambda: f64,

    /// Exploration strength.
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Updates between recomputations of the cached inverse.
    #[serde(default = "default_recompute_interval")]
    pub recompute_interval: u32,

    /// Minimum accepted context L2 norm.
    #[serde(default = "default_min_norm")]
    pub min_context_norm: f64,

    /// Maximum accepted context L2 norm.
    #[serde(default = "default_max_norm")]
    pub max_context_norm: f64,
}

fn default_dim() -> usize {
    8
}

fn default_lambda() -> f64 {
    1.0
}

fn default_alpha() -> f64 {
    1.0
}

fn default_recompute_interval() -> u32 {
    10
}

fn default_min_norm() -> f64 {
    1e-6
}

fn default_max_norm() -> f64 {
    1e3
}

impl Default for LinUcbConfig {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            lambda: default_lambda(),
            alpha: default_alpha(),
            recompute_interval: default_recompute_interval(),
            min_context_norm: default_min_norm(),
            max_context_norm: default_max_norm(),
        }
    }
}

/// Ridge-regression state for one arm; matrices stored as flat row-major vecs.
#[derive(Debug, Clone)]
pub struct LinearArm {
    /// `A = lambda * I + sum(x x^T)`, row-major `dim * dim`.
    pub a: Vec<f64>,
    /// `b = sum(reward * x)`.
    pub b: Vec<f64>,
    /// Cached inverse of `A`, possibly stale.
    a_inv: Vec<f64>,
    /// Updates applied since the cached inverse was last recomputed.
    stale_updates: u32,
    pub pulls: u64,
}

impl LinearArm {
    fn new(dim: usize, lambda: f64) -> Self {
        let mut a = vec![0.0; dim * dim];
        let mut a_inv = vec![0.0; dim * dim];
        let lambda = if lambda.is_finite() && lambda > 0.0 {
            lambda
        } else {
            1.0
        };
        for i in 0..dim {
            a[i * dim + i] = lambda;
            a_inv[i * dim + i] = 1.0 / lambda;
        }
        Self {
            a,
            b: vec![0.0; dim],
            a_inv,
            stale_updates: 0,
            pulls: 0,
        }
    }

    /// The cached (possibly stale) inverse of `A`.
    pub fn cached_inverse(&self) -> &[f64] {
        &self.a_inv
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn mat_vec(m: &[f64], dim: usize, x: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; dim];
    for i in 0..dim {
        out[i] = dot(&m[i * dim..(i + 1) * dim], x);
    }
    out
}

/// Gauss-Jordan inversion with partial pivoting. Returns `None` for a
/// singular matrix; `A = lambda*I + sum(x x^T)` is positive definite so this
/// only happens on corrupted state.
fn invert(m: &[f64], dim: usize) -> Option<Vec<f64>> {
    let mut work = m.to_vec();
    let mut inv = vec![0.0; dim * dim];
    for i in 0..dim {
        inv[i * dim + i] = 1.0;
    }

    for col in 0..dim {
        let mut pivot = col;
        let mut pivot_abs = work[col * dim + col].abs();
        for row in (col + 1)..dim {
            let v = work[row * dim + col].abs();
            if v > pivot_abs {
                pivot = row;
                pivot_abs = v;
            }
        }
        if pivot_abs < 1e-12 {
            return None;
        }
        if pivot != col {
            for j in 0..dim {
                work.swap(col * dim + j, pivot * dim + j);
                inv.swap(col * dim + j, pivot * dim + j);
            }
        }
        let diag = work[col * dim + col];
        for j in 0..dim {
            work[col * dim + j] /= diag;
            inv[col * dim + j] /= diag;
        }
        for row in 0..dim {
            if row == col {
                continue;
            }
            let factor = work[row * dim + col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..dim {
                work[row * dim + j] -= factor * work[col * dim + j];
                inv[row * dim + j] -= factor * inv[col * dim + j];
            }
        }
    }
    Some(inv)
}

/// Contextual LinUCB bandit.
#[derive(Debug, Clone)]
pub struct LinUcb {
    cfg: LinUcbConfig,
    order: Vec<String>,
    arms: HashMap<String, LinearArm>,
}

impl LinUcb {
    pub fn new(cfg: LinUcbConfig) -> Self {
        Self {
            cfg,
            order: Vec::new(),
            arms: HashMap::new(),
        }
    }

    pub fn config(&self) -> &LinUcbConfig {
        &self.cfg
    }

    /// Per-arm regression state.
    pub fn arms(&self) -> &HashMap<String, LinearArm> {
        &self.arms
    }

    pub fn arm_state(&self, arm: &str) -> Option<&LinearArm> {
        self.arms.get(arm)
    }

    fn dim(&self) -> usize {
        self.cfg.dim.max(1)
    }

    /// Validate a context vector against the configured dimension and the
    /// feature-quality norm gate.
    pub fn validate_context(&self, context: &[f64]) -> Result<()> {
        if context.len() != self.dim() {
            return Err(BanditError::DimensionMismatch {
                expected: self.dim(),
                actual: context.len(),
            });
        }
        let norm = dot(context, context).sqrt();
        if !norm.is_finite() || norm < self.cfg.min_context_norm || norm > self.cfg.max_context_norm
        {
            return Err(BanditError::ContextRejected {
                norm,
                min: self.cfg.min_context_norm,
                max: self.cfg.max_context_norm,
            });
        }
        Ok(())
    }

    fn register(&mut self, arms: &[String]) {
        let dim = self.dim();
        let lambda = self.cfg.lambda;
        for arm in arms {
            if !self.arms.contains_key(arm) {
                self.order.push(arm.clone());
                self.arms.insert(arm.clone(), LinearArm::new(dim, lambda));
            }
        }
    }

    fn seen_rank(&self, arm: &str) -> usize {
        self.order.iter().position(|a| a == arm).unwrap_or(usize::MAX)
    }

    /// UCB score of one arm under the cached inverse.
    fn score(&self, state: &LinearArm, x: &[f64]) -> f64 {
        let dim = self.dim();
        let theta = mat_vec(&state.a_inv, dim, &state.b);
        let mean = dot(&theta, x);
        let ax = mat_vec(&state.a_inv, dim, x);
        let var = dot(x, &ax).max(0.0);
        let alpha = if self.cfg.alpha.is_finite() && self.cfg.alpha >= 0.0 {
            self.cfg.alpha
        } else {
            1.0
        };
        mean + alpha * var.sqrt()
    }

    /// Select an arm for the given context.
    ///
    /// Returns an error if the context fails validation; the caller decides
    /// whether to fall back to a non-contextual policy.
    pub fn select_with_context(&mut self, arms: &[String], context: &[f64]) -> Result<Option<String>> {
        self.validate_context(context)?;
        if arms.is_empty() {
            return Ok(None);
        }
        self.register(arms);

        let mut best: Option<&String> = None;
        let mut best_score = f64::NEG_INFINITY;
        let mut best_rank = usize::MAX;
        for arm in arms {
            let state = match self.arms.get(arm) {
                Some(s) => s,
                None => continue,
            };
            let score = self.score(state, context);
            let rank = self.seen_rank(arm);
            if score > best_score || (score == best_score && rank < best_rank) {
                best_score = score;
                best_rank = rank;
                best = Some(arm);
            }
        }
        Ok(best.cloned())
    }

    /// Apply `A += x x^T; b += reward * x` for the chosen arm, recomputing the
    /// cached inverse only when the staleness counter reaches the configured
    /// interval.
    pub fn update_with_context(&mut self, arm: &str, context: &[f64], reward: f64) -> Result<()> {
        self.validate_context(context)?;
        let r = clamp01(reward);
        let dim = self.dim();
        let lambda = self.cfg.lambda;
        let interval = self.cfg.recompute_interval.max(1);

        if !self.arms.contains_key(arm) {
            self.order.push(arm.to_string());
        }
        let state = self
            .arms
            .entry(arm.to_string())
            .or_insert_with(|| LinearArm::new(dim, lambda));

        for i in 0..dim {
            for j in 0..dim {
                state.a[i * dim + j] += context[i] * context[j];
            }
            state.b[i] += r * context[i];
        }
        state.pulls += 1;
        state.stale_updates += 1;

        if state.stale_updates >= interval {
            if let Some(inv) = invert(&state.a, dim) {
                state.a_inv = inv;
            }
            state.stale_updates = 0;
        }
        Ok(())
    }

    pub(crate) fn restore_arm(&mut self, arm: String, a: Vec<f64>, b: Vec<f64>, pulls: u64) -> Result<()> {
        let dim = self.dim();
        if a.len() != dim * dim || b.len() != dim {
            return Err(BanditError::InvalidState(format!(
                "linucb arm {arm}: expected {}x{} state, got a={} b={}",
                dim,
                dim,
                a.len(),
                b.len()
            )));
        }
        if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
            return Err(BanditError::InvalidState(format!(
                "linucb arm {arm}: non-finite state"
            )));
        }
        let a_inv = invert(&a, dim).ok_or_else(|| {
            BanditError::InvalidState(format!("linucb arm {arm}: singular A matrix"))
        })?;
        if !self.arms.contains_key(&arm) {
            self.order.push(arm.clone());
        }
        self.arms.insert(
            arm,
            LinearArm {
                a,
                b,
                a_inv,
                stale_updates: 0,
                pulls,
            },
        );
        Ok(())
    }
}
