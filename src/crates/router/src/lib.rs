//! Adaptive model request routing
//!
//! This crate is the control plane for outbound model calls: for every request
//! it selects a backend model with an online bandit policy, enforces
//! per-tenant cost budgets before dispatch, shields the call with retry and
//! circuit breaking, short-circuits on semantic cache hits, and feeds realized
//! cost/latency/quality back into the learner as a shaped reward.
//!
//! The pipeline is wired in [`route::ModelRouter`]; each concern lives in its
//! own module and can be used independently:
//!
//! - [`registry`] - per-tenant bandit instances and selection entropy
//! - [`reward`] - outcome metrics to scalar reward shaping
//! - [`budget`] - token/cost estimation, preflight checks, downshift
//! - [`retry`] / [`circuit`] - resilience around the dispatch boundary
//! - [`cache`] - tenant-isolated semantic response cache
//! - [`config`] - global defaults plus per-tenant YAML overlays

pub mod budget;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod retry;
pub mod reward;
pub mod route;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use config::RouterConfig;
pub use reward::{RewardBreakdown, RewardWeights};
pub use route::{DispatchOutput, ModelDispatcher, ModelRouter};

/// Errors surfaced by the routing pipeline.
///
/// Budget and exhaustion conditions propagate to the caller; everything the
/// router can recover from locally (malformed context, cache trouble,
/// persistence failures) is degraded to a safe default instead.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Projected spend would exceed a tenant budget cap. Never retried.
    #[error(
        "budget exceeded for task '{task_type}': projected ${projected_usd:.6} \
         against cap ${cap_usd:.6} (spent ${spent_usd:.6} in the current window)"
    )]
    BudgetExceeded {
        task_type: String,
        projected_usd: f64,
        cap_usd: f64,
        spent_usd: f64,
    },

    /// Every candidate was pruned by the budget meter. Never retried.
    #[error("no affordable candidate for task '{task_type}': all {candidates} candidates over cap")]
    NoAffordableCandidate { task_type: String, candidates: usize },

    /// The circuit for this model/provider is open; callers may retry after
    /// the reported backoff.
    #[error("circuit open for {model}@{provider}, retry after {retry_after_ms}ms")]
    CircuitOpen {
        model: String,
        provider: String,
        retry_after_ms: u64,
    },

    /// The injected dispatcher reported a failure.
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    /// All retry attempts were consumed.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Bandit state could not be loaded or saved.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration invalid or missing.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// Whether a caller may reasonably retry this error after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RouterError::CircuitOpen { .. } | RouterError::RetriesExhausted { .. }
        )
    }
}

/// Result type for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Isolation key for all bandit state, budgets, and caches.
///
/// Every lookup in the router is scoped by this pair; no state crosses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub workspace_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workspace_id: workspace_id.into(),
        }
    }

    /// Stable key used for registry maps, ledgers, and state file names.
    pub fn storage_key(&self) -> String {
        format!("{}__{}", self.tenant_id, self.workspace_id)
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.workspace_id)
    }
}

/// A routing request presented by the orchestrator.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub tenant: TenantContext,
    pub task_type: String,
    pub prompt: String,
    /// Candidate models; empty means "resolve from routing configuration".
    pub candidates: Vec<String>,
    /// Optional context features for the contextual policy.
    pub context_features: Option<Vec<f64>>,
}

impl RouteRequest {
    pub fn new(
        tenant: TenantContext,
        task_type: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            tenant,
            task_type: task_type.into(),
            prompt: prompt.into(),
            candidates: Vec::new(),
            context_features: None,
        }
    }

    /// Restrict the candidate set instead of using routing configuration.
    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Attach context features for contextual selection.
    pub fn with_features(mut self, features: Vec<f64>) -> Self {
        self.context_features = Some(features);
        self
    }
}

/// The outcome of a bandit selection, returned to the caller as metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub request_id: Uuid,
    pub model: String,
    pub task_type: String,
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
    /// Candidates that survived budget pruning; the bandit chose among these.
    pub affordable_candidates: Vec<String>,
    /// True when the contextual policy fell back to its non-contextual shadow.
    pub contextual_fallback: bool,
    pub selected_at: DateTime<Utc>,
}

/// Realized metrics for a completed request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Outcome {
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// Caller-supplied quality signals for a completed request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualitySignals {
    /// Quality score in `[0, 1]`, if the caller can judge it.
    pub quality: Option<f64>,
}

/// Response returned by [`route::ModelRouter::execute`].
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub request_id: Uuid,
    /// Model that produced the payload (also set for cache hits).
    pub model: String,
    pub payload: serde_json::Value,
    pub cached: bool,
    /// `"semantic"` for cache hits, absent otherwise.
    pub cache_type: Option<String>,
    /// Reward attributed to the learner; absent for cache hits.
    pub reward: Option<RewardBreakdown>,
    pub latency_ms: u64,
    pub cost_usd: f64,
}
