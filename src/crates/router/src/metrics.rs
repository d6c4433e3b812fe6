//! Event counters for the routing pipeline.
//!
//! The router counts what happens at each decision point (selections per arm,
//! cache hits, budget denials, breaker transitions, observed rewards) and
//! exposes a serializable snapshot. How those numbers are stored or exposed
//! is an external collaborator's concern.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide routing counters. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    selections: DashMap<String, u64>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    budget_denials: AtomicU64,
    circuit_rejections: AtomicU64,
    breaker_transitions: AtomicU64,
    dispatch_failures: AtomicU64,
    reward_count: AtomicU64,
    reward_sum: Mutex<f64>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_selection(&self, model: &str) {
        *self.selections.entry(model.to_string()).or_insert(0) += 1;
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_budget_denial(&self) {
        self.budget_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_transition(&self) {
        self.breaker_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reward(&self, reward: f64) {
        self.reward_count.fetch_add(1, Ordering::Relaxed);
        *self.reward_sum.lock() += reward;
    }

    /// Fraction of cache lookups that hit; 0 when nothing was looked up.
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let misses = self.cache_misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let reward_count = self.reward_count.load(Ordering::Relaxed);
        let reward_sum = *self.reward_sum.lock();
        MetricsSnapshot {
            selections: self
                .selections
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_ratio: self.cache_hit_ratio(),
            budget_denials: self.budget_denials.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            reward_count,
            mean_reward: if reward_count > 0 {
                reward_sum / reward_count as f64
            } else {
                0.0
            },
        }
    }
}

/// Serializable copy of the router counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub selections: HashMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
    pub budget_denials: u64,
    pub circuit_rejections: u64,
    pub breaker_transitions: u64,
    pub dispatch_failures: u64,
    pub reward_count: u64,
    pub mean_reward: f64,
}
