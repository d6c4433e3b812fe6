//! Serializable policy snapshots.
//!
//! Every policy can be snapshotted into a [`PolicyState`] JSON document
//! (`{arm_id: {alpha, beta}}` for Thompson, `{arm_id: {pulls, mean}}` for the
//! mean-based policies, flat arrays for LinUCB) and restored into a fresh
//! instance. Restore validates invariants: Beta parameters must be finite and
//! strictly positive, matrix dimensions must match the configured policy, and
//! non-finite values are rejected rather than loaded.
//!
//! Arm first-seen order is not persisted; restored instances re-establish it
//! in sorted key order and then by presentation order as requests arrive.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::epsilon_greedy::{EpsilonGreedy, MeanStats};
use crate::linucb::LinUcb;
use crate::thompson::{BetaArm, ThompsonSampling};
use crate::ucb::Ucb1;
use crate::{BanditError, Result};

/// Persisted mean statistics for one arm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MeanArmState {
    pub pulls: u64,
    pub mean: f64,
}

/// Persisted Beta posterior for one arm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BetaArmState {
    pub alpha: f64,
    pub beta: f64,
    #[serde(default)]
    pub pulls: u64,
}

/// Persisted ridge-regression state for one arm; `a` is row-major `dim * dim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearArmState {
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    #[serde(default)]
    pub pulls: u64,
}

/// Snapshot of a policy's learned state, serialized per tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PolicyState {
    EpsilonGreedy {
        arms: BTreeMap<String, MeanArmState>,
    },
    Ucb1 {
        arms: BTreeMap<String, MeanArmState>,
        total_pulls: u64,
    },
    Thompson {
        arms: BTreeMap<String, BetaArmState>,
    },
    LinUcb {
        dim: usize,
        arms: BTreeMap<String, LinearArmState>,
    },
}

fn validate_mean(arm: &str, state: &MeanArmState) -> Result<()> {
    if !state.mean.is_finite() {
        return Err(BanditError::InvalidState(format!(
            "arm {arm}: non-finite mean"
        )));
    }
    Ok(())
}

fn validate_beta(arm: &str, state: &BetaArmState) -> Result<()> {
    if !(state.alpha.is_finite() && state.beta.is_finite())
        || state.alpha <= 0.0
        || state.beta <= 0.0
    {
        return Err(BanditError::InvalidState(format!(
            "arm {arm}: alpha/beta must be finite and > 0, got ({}, {})",
            state.alpha, state.beta
        )));
    }
    Ok(())
}

impl EpsilonGreedy {
    pub fn snapshot(&self) -> PolicyState {
        let arms = self
            .stats()
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    MeanArmState {
                        pulls: v.pulls,
                        mean: v.mean,
                    },
                )
            })
            .collect();
        PolicyState::EpsilonGreedy { arms }
    }

    pub fn restore(&mut self, state: PolicyState) -> Result<()> {
        let arms = match state {
            PolicyState::EpsilonGreedy { arms } => arms,
            other => {
                return Err(BanditError::InvalidState(format!(
                    "expected epsilon_greedy state, got {other:?}"
                )))
            }
        };
        let mut order = Vec::with_capacity(arms.len());
        let mut stats = HashMap::with_capacity(arms.len());
        for (arm, s) in arms {
            validate_mean(&arm, &s)?;
            order.push(arm.clone());
            stats.insert(
                arm,
                MeanStats {
                    pulls: s.pulls,
                    mean: s.mean,
                },
            );
        }
        self.restore_parts(order, stats);
        Ok(())
    }
}

impl Ucb1 {
    pub fn snapshot(&self) -> PolicyState {
        let arms = self
            .stats()
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    MeanArmState {
                        pulls: v.pulls,
                        mean: v.mean,
                    },
                )
            })
            .collect();
        PolicyState::Ucb1 {
            arms,
            total_pulls: self.total_pulls(),
        }
    }

    pub fn restore(&mut self, state: PolicyState) -> Result<()> {
        let (arms, total_pulls) = match state {
            PolicyState::Ucb1 { arms, total_pulls } => (arms, total_pulls),
            other => {
                return Err(BanditError::InvalidState(format!(
                    "expected ucb1 state, got {other:?}"
                )))
            }
        };
        let mut order = Vec::with_capacity(arms.len());
        let mut stats = HashMap::with_capacity(arms.len());
        for (arm, s) in arms {
            validate_mean(&arm, &s)?;
            order.push(arm.clone());
            stats.insert(
                arm,
                MeanStats {
                    pulls: s.pulls,
                    mean: s.mean,
                },
            );
        }
        self.restore_parts(order, stats, total_pulls);
        Ok(())
    }
}

impl ThompsonSampling {
    pub fn snapshot(&self) -> PolicyState {
        let arms = self
            .arms()
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    BetaArmState {
                        alpha: v.alpha,
                        beta: v.beta,
                        pulls: v.pulls,
                    },
                )
            })
            .collect();
        PolicyState::Thompson { arms }
    }

    pub fn restore(&mut self, state: PolicyState) -> Result<()> {
        let arms = match state {
            PolicyState::Thompson { arms } => arms,
            other => {
                return Err(BanditError::InvalidState(format!(
                    "expected thompson state, got {other:?}"
                )))
            }
        };
        let mut order = Vec::with_capacity(arms.len());
        let mut restored = HashMap::with_capacity(arms.len());
        for (arm, s) in arms {
            validate_beta(&arm, &s)?;
            order.push(arm.clone());
            restored.insert(
                arm,
                BetaArm {
                    alpha: s.alpha,
                    beta: s.beta,
                    pulls: s.pulls,
                },
            );
        }
        self.restore_parts(order, restored);
        Ok(())
    }
}

impl LinUcb {
    pub fn snapshot(&self) -> PolicyState {
        let arms = self
            .arms()
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    LinearArmState {
                        a: v.a.clone(),
                        b: v.b.clone(),
                        pulls: v.pulls,
                    },
                )
            })
            .collect();
        PolicyState::LinUcb {
            dim: self.config().dim,
            arms,
        }
    }

    pub fn restore(&mut self, state: PolicyState) -> Result<()> {
        let (dim, arms) = match state {
            PolicyState::LinUcb { dim, arms } => (dim, arms),
            other => {
                return Err(BanditError::InvalidState(format!(
                    "expected linucb state, got {other:?}"
                )))
            }
        };
        if dim != self.config().dim {
            return Err(BanditError::DimensionMismatch {
                expected: self.config().dim,
                actual: dim,
            });
        }
        for (arm, s) in arms {
            self.restore_arm(arm, s.a, s.b, s.pulls)?;
        }
        Ok(())
    }
}
