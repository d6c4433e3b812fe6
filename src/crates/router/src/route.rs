//! Orchestration entry point for routed model calls.
//!
//! [`ModelRouter`] wires the pipeline in the order the request flows:
//! semantic-cache gate, budget preflight with downshift pruning, bandit
//! selection, circuit-breaker gate, retried dispatch through an injected
//! [`ModelDispatcher`], then budget settlement, cache insertion, and the
//! reward update that closes the learning loop.
//!
//! The actual network call is the caller's concern; the router only sees an
//! opaque awaited dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::budget::{estimate_tokens, BudgetMeter, Reservation};
use crate::cache::SemanticCache;
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::config::{RouterConfig, TenantOverlay};
use crate::metrics::RouterMetrics;
use crate::persistence::StateStore;
use crate::registry::BanditRegistry;
use crate::retry::retry_with_backoff;
use crate::reward::{compute_reward, RewardBreakdown};
use crate::{
    Outcome, QualitySignals, Result, RouteRequest, RoutedResponse, RouterError, Selection,
    TenantContext,
};

/// What an injected dispatcher reports back for one model call.
#[derive(Debug, Clone)]
pub struct DispatchOutput {
    pub payload: serde_json::Value,
    /// Realized cost; the selection's estimate is used when absent.
    pub cost_usd: Option<f64>,
    /// Realized latency; wall-clock around the dispatch is used when absent.
    pub latency_ms: Option<u64>,
    /// Quality signal in `[0, 1]`, if the dispatcher can judge it.
    pub quality: Option<f64>,
}

/// The dispatch seam: the orchestrator injects the thing that actually talks
/// to a model endpoint.
#[async_trait]
pub trait ModelDispatcher: Send + Sync {
    async fn dispatch(&self, model: &str, prompt: &str) -> Result<DispatchOutput>;
}

/// The adaptive request router.
pub struct ModelRouter {
    global: Arc<RouterConfig>,
    tenant_configs: RwLock<HashMap<String, Arc<RouterConfig>>>,
    registry: BanditRegistry,
    budget: BudgetMeter,
    breaker: CircuitBreaker,
    cache: SemanticCache,
    metrics: Arc<RouterMetrics>,
    /// Reservations taken by [`select`](Self::select) awaiting an outcome.
    pending: Mutex<HashMap<Uuid, Reservation>>,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Result<Self> {
        config.validate()?;
        let store = match (&config.state_dir, config.flags.persistence_enabled) {
            (Some(dir), true) => Some(StateStore::new(dir)?),
            _ => None,
        };
        Ok(Self {
            registry: BanditRegistry::new(store),
            budget: BudgetMeter::new(),
            breaker: CircuitBreaker::new(config.breaker),
            cache: SemanticCache::new(config.cache),
            metrics: Arc::new(RouterMetrics::new()),
            tenant_configs: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            global: Arc::new(config),
        })
    }

    /// Shared handle to the event counters.
    pub fn metrics(&self) -> Arc<RouterMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Selection entropy for a tenant, if it has routed anything yet.
    pub fn selection_entropy(&self, tenant: &TenantContext) -> Option<f64> {
        self.registry.selection_entropy(tenant)
    }

    /// Register a tenant's configuration overlay on top of the global
    /// defaults. Later requests from this tenant use the resolved config.
    pub fn register_tenant_overlay(
        &self,
        tenant: &TenantContext,
        overlay: &TenantOverlay,
    ) -> Result<()> {
        let resolved = self.global.for_tenant(overlay);
        resolved.validate()?;
        self.tenant_configs
            .write()
            .insert(tenant.storage_key(), Arc::new(resolved));
        Ok(())
    }

    fn tenant_config(&self, tenant: &TenantContext) -> Arc<RouterConfig> {
        self.tenant_configs
            .read()
            .get(&tenant.storage_key())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.global))
    }

    /// Selection API: preflight the budget, prune unaffordable candidates,
    /// and let the tenant's bandit pick among the remainder.
    ///
    /// The chosen model's projected cost is reserved against the tenant's
    /// daily ledger; [`record_selection_outcome`](Self::record_selection_outcome)
    /// settles it to the realized cost. An abandoned selection keeps the
    /// conservative estimate charged and leaves learner statistics untouched.
    pub fn select(&self, request: &RouteRequest) -> Result<Selection> {
        let cfg = self.tenant_config(&request.tenant);
        let (selection, reservation) = self.select_inner(request, &cfg)?;
        self.pending.lock().insert(selection.request_id, reservation);
        Ok(selection)
    }

    fn select_inner(
        &self,
        request: &RouteRequest,
        cfg: &RouterConfig,
    ) -> Result<(Selection, Reservation)> {
        let candidates = if request.candidates.is_empty() {
            cfg.routing.candidates_for(&request.task_type)
        } else {
            request.candidates.clone()
        };
        if candidates.is_empty() {
            return Err(RouterError::Config(format!(
                "no candidate models for task '{}'",
                request.task_type
            )));
        }

        let tokens = estimate_tokens(&request.prompt, cfg.budgets.long_text_threshold);
        let affordable = self.budget.affordable_candidates(
            &request.tenant,
            &cfg.budgets,
            &request.task_type,
            &candidates,
            tokens,
        );
        if affordable.is_empty() {
            self.metrics.record_budget_denial();
            return Err(RouterError::NoAffordableCandidate {
                task_type: request.task_type.clone(),
                candidates: candidates.len(),
            });
        }
        let affordable_models: Vec<String> = affordable.iter().map(|(m, _)| m.clone()).collect();

        let bandit = self.registry.get_or_create(&request.tenant, cfg);
        let (choice, contextual_fallback) =
            bandit.select(&affordable_models, request.context_features.as_deref());
        let model = choice.ok_or_else(|| {
            RouterError::Config("bandit produced no selection from a non-empty candidate set".into())
        })?;
        let estimated_cost_usd = affordable
            .iter()
            .find(|(m, _)| *m == model)
            .map(|(_, c)| *c)
            .unwrap_or(0.0);

        let reservation = match self.budget.try_reserve(
            &request.tenant,
            &cfg.budgets,
            &request.task_type,
            estimated_cost_usd,
        ) {
            Ok(r) => r,
            Err(e) => {
                self.metrics.record_budget_denial();
                return Err(e);
            }
        };

        bandit.record_selection(&model);
        self.metrics.record_selection(&model);
        debug!(
            tenant = %request.tenant,
            task_type = %request.task_type,
            model = %model,
            estimated_cost_usd,
            affordable = affordable_models.len(),
            pruned = candidates.len() - affordable_models.len(),
            contextual_fallback,
            "model selected"
        );

        Ok((
            Selection {
                request_id: Uuid::new_v4(),
                model,
                task_type: request.task_type.clone(),
                estimated_tokens: tokens,
                estimated_cost_usd,
                affordable_candidates: affordable_models,
                contextual_fallback,
                selected_at: Utc::now(),
            },
            reservation,
        ))
    }

    /// Feedback API: close the learning loop for a completed request.
    ///
    /// Computes the shaped reward under the tenant's weights, applies it to
    /// the arm that served the request, and persists state when enabled.
    pub fn record_outcome(
        &self,
        tenant: &TenantContext,
        model: &str,
        outcome: Outcome,
        signals: QualitySignals,
    ) -> RewardBreakdown {
        let cfg = self.tenant_config(tenant);
        self.record_outcome_inner(tenant, model, outcome, signals, None, &cfg)
    }

    /// Like [`record_outcome`](Self::record_outcome), but settles the budget
    /// reservation taken by [`select`](Self::select) and attributes the
    /// reward under the selection's context features.
    pub fn record_selection_outcome(
        &self,
        tenant: &TenantContext,
        selection: &Selection,
        outcome: Outcome,
        signals: QualitySignals,
        features: Option<&[f64]>,
    ) -> RewardBreakdown {
        if let Some(reservation) = self.pending.lock().remove(&selection.request_id) {
            self.budget.settle(&reservation, outcome.cost_usd);
        }
        let cfg = self.tenant_config(tenant);
        self.record_outcome_inner(tenant, &selection.model, outcome, signals, features, &cfg)
    }

    fn record_outcome_inner(
        &self,
        tenant: &TenantContext,
        model: &str,
        outcome: Outcome,
        signals: QualitySignals,
        features: Option<&[f64]>,
        cfg: &RouterConfig,
    ) -> RewardBreakdown {
        let breakdown = compute_reward(
            &outcome,
            &signals,
            &cfg.rl.weights,
            cfg.rl.reference_cost_usd,
            cfg.rl.latency_window_ms,
        );

        let bandit = self.registry.get_or_create(tenant, cfg);
        bandit.update(model, breakdown.total, features);
        self.metrics.record_reward(breakdown.total);
        if cfg.flags.persistence_enabled {
            self.registry.save(tenant);
        }

        info!(
            tenant = %tenant,
            model = %model,
            cost_usd = outcome.cost_usd,
            latency_ms = outcome.latency_ms,
            quality = signals.quality,
            reward = breakdown.total,
            "outcome recorded"
        );
        breakdown
    }

    fn note_breaker_transition(&self, transition: (CircuitState, CircuitState)) {
        if transition.0 != transition.1 {
            self.metrics.record_breaker_transition();
        }
    }

    /// Full pipeline: cache gate, selection, shielded dispatch, feedback.
    pub async fn execute(
        &self,
        request: &RouteRequest,
        dispatcher: &dyn ModelDispatcher,
    ) -> Result<RoutedResponse> {
        let cfg = self.tenant_config(&request.tenant);

        // Cache gate: a hit bypasses routing, dispatch, and reward entirely.
        if let Some(hit) = self.cache.get(&request.tenant, &request.prompt) {
            self.metrics.record_cache_hit();
            info!(
                tenant = %request.tenant,
                model = %hit.model,
                similarity = hit.similarity,
                "semantic cache hit, routing bypassed"
            );
            return Ok(RoutedResponse {
                request_id: Uuid::new_v4(),
                model: hit.model,
                payload: hit.payload,
                cached: true,
                cache_type: Some("semantic".to_string()),
                reward: None,
                latency_ms: 0,
                cost_usd: 0.0,
            });
        }
        self.metrics.record_cache_miss();

        let (selection, reservation) = self.select_inner(request, &cfg)?;
        let provider = cfg.routing.provider_of(&selection.model).to_string();

        if !self.breaker.should_attempt(&selection.model, &provider) {
            self.metrics.record_circuit_rejection();
            self.budget.release(&reservation);
            return Err(RouterError::CircuitOpen {
                retry_after_ms: self.breaker.retry_after_ms(&selection.model, &provider),
                model: selection.model,
                provider,
            });
        }

        let started = Instant::now();
        let dispatched = retry_with_backoff(&cfg.retry, "model_dispatch", || {
            dispatcher.dispatch(&selection.model, &request.prompt)
        })
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let output = match dispatched {
            Ok(output) => {
                self.note_breaker_transition(
                    self.breaker.record_success(&selection.model, &provider),
                );
                output
            }
            Err(e) => {
                self.note_breaker_transition(
                    self.breaker.record_failure(&selection.model, &provider),
                );
                self.metrics.record_dispatch_failure();
                self.budget.release(&reservation);
                return Err(e);
            }
        };

        let outcome = Outcome {
            cost_usd: output.cost_usd.unwrap_or(selection.estimated_cost_usd),
            latency_ms: output.latency_ms.unwrap_or(elapsed_ms),
        };
        self.budget.settle(&reservation, outcome.cost_usd);

        let signals = QualitySignals {
            quality: output.quality,
        };
        let breakdown = self.record_outcome_inner(
            &request.tenant,
            &selection.model,
            outcome,
            signals,
            request.context_features.as_deref(),
            &cfg,
        );

        self.cache
            .insert(&request.tenant, &request.prompt, &selection.model, output.payload.clone());

        Ok(RoutedResponse {
            request_id: selection.request_id,
            model: selection.model,
            payload: output.payload,
            cached: false,
            cache_type: None,
            reward: Some(breakdown),
            latency_ms: outcome.latency_ms,
            cost_usd: outcome.cost_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tenant() -> TenantContext {
        TenantContext::new("acme", "main")
    }

    fn base_config() -> RouterConfig {
        let mut cfg = RouterConfig::default();
        cfg.budgets.pricing.insert("gpt-4".to_string(), 0.05);
        cfg.budgets
            .pricing
            .insert("gpt-3.5-turbo".to_string(), 0.00025);
        cfg.routing.general = vec!["gpt-4".to_string(), "gpt-3.5-turbo".to_string()];
        cfg.retry = RetryConfig::new(0).with_initial_backoff(1).with_jitter(false);
        cfg
    }

    struct OkDispatcher {
        calls: AtomicU32,
    }

    impl OkDispatcher {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelDispatcher for OkDispatcher {
        async fn dispatch(&self, model: &str, _prompt: &str) -> Result<DispatchOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DispatchOutput {
                payload: json!({"text": "response", "model": model}),
                cost_usd: Some(0.001),
                latency_ms: Some(500),
                quality: Some(0.9),
            })
        }
    }

    struct FailingDispatcher;

    #[async_trait]
    impl ModelDispatcher for FailingDispatcher {
        async fn dispatch(&self, _model: &str, _prompt: &str) -> Result<DispatchOutput> {
            Err(RouterError::DispatchFailed("request timed out".to_string()))
        }
    }

    #[tokio::test]
    async fn test_execute_then_cache_hit() {
        let router = ModelRouter::new(base_config()).unwrap();
        let dispatcher = OkDispatcher::new();
        let request = RouteRequest::new(tenant(), "chat", "what is the capital of france");

        let first = router.execute(&request, &dispatcher).await.unwrap();
        assert!(!first.cached);
        assert!(first.reward.is_some());

        let second = router.execute(&request, &dispatcher).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.cache_type.as_deref(), Some("semantic"));
        assert!(second.reward.is_none());
        // Dispatch ran exactly once; the hit bypassed it.
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

        let snapshot = router.metrics().snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_cache_is_tenant_isolated() {
        let router = ModelRouter::new(base_config()).unwrap();
        let dispatcher = OkDispatcher::new();
        let prompt = "what is the capital of france";

        let first = router
            .execute(&RouteRequest::new(tenant(), "chat", prompt), &dispatcher)
            .await
            .unwrap();
        assert!(!first.cached);

        let other = TenantContext::new("globex", "main");
        let cross = router
            .execute(&RouteRequest::new(other, "chat", prompt), &dispatcher)
            .await
            .unwrap();
        assert!(!cross.cached);
    }

    #[tokio::test]
    async fn test_budget_downshift_always_picks_cheap_model() {
        let mut cfg = base_config();
        cfg.budgets.max_per_request_usd = 0.01;
        cfg.cache.enabled = false;
        let router = ModelRouter::new(cfg).unwrap();
        let dispatcher = OkDispatcher::new();

        // 6000-char prompt: gpt-4 projects to 0.075, gpt-3.5 to 0.000375.
        let prompt = "x".repeat(6000);
        for _ in 0..10 {
            let response = router
                .execute(&RouteRequest::new(tenant(), "chat", prompt.clone()), &dispatcher)
                .await
                .unwrap();
            assert_eq!(response.model, "gpt-3.5-turbo");
        }
    }

    #[tokio::test]
    async fn test_no_affordable_candidate() {
        let mut cfg = base_config();
        cfg.budgets.max_per_request_usd = 0.0001;
        cfg.cache.enabled = false;
        let router = ModelRouter::new(cfg).unwrap();

        let prompt = "x".repeat(6000);
        let err = router
            .select(&RouteRequest::new(tenant(), "chat", prompt))
            .unwrap_err();
        assert!(matches!(err, RouterError::NoAffordableCandidate { .. }));
        assert_eq!(router.metrics().snapshot().budget_denials, 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_repeated_failures() {
        let mut cfg = base_config();
        cfg.routing.general = vec!["gpt-4".to_string()];
        cfg.breaker.max_failures = 2;
        cfg.breaker.reset_timeout_ms = 60_000;
        cfg.cache.enabled = false;
        let router = ModelRouter::new(cfg).unwrap();

        let request = RouteRequest::new(tenant(), "chat", "hello there");
        for _ in 0..2 {
            let err = router.execute(&request, &FailingDispatcher).await.unwrap_err();
            assert!(matches!(err, RouterError::RetriesExhausted { .. }));
        }

        let err = router.execute(&request, &FailingDispatcher).await.unwrap_err();
        match err {
            RouterError::CircuitOpen { model, .. } => assert_eq!(model, "gpt-4"),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }

        let snapshot = router.metrics().snapshot();
        assert_eq!(snapshot.circuit_rejections, 1);
        assert!(snapshot.breaker_transitions >= 1);
    }

    #[tokio::test]
    async fn test_failed_dispatch_refunds_budget() {
        let mut cfg = base_config();
        cfg.cache.enabled = false;
        let router = ModelRouter::new(cfg).unwrap();

        let request = RouteRequest::new(tenant(), "chat", "hello there");
        let _ = router.execute(&request, &FailingDispatcher).await;

        // The reservation was released; nothing stayed charged.
        assert_eq!(router.budget.spent_today(&tenant()), 0.0);
    }

    #[tokio::test]
    async fn test_quality_weighted_tenant_gets_quality_as_reward() {
        let router = ModelRouter::new(base_config()).unwrap();
        let overlay = TenantOverlay::from_yaml_str(
            r#"
            rl:
              weights:
                cost: 0.0
                latency: 0.0
                quality: 1.0
        "#,
        )
        .unwrap();
        router.register_tenant_overlay(&tenant(), &overlay).unwrap();

        for quality in [0.9, 0.1] {
            let breakdown = router.record_outcome(
                &tenant(),
                "gpt-4",
                Outcome {
                    cost_usd: 0.02,
                    latency_ms: 500,
                },
                QualitySignals {
                    quality: Some(quality),
                },
            );
            assert!((breakdown.total - quality).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_select_and_record_outcome_settle_budget() {
        let mut cfg = base_config();
        cfg.cache.enabled = false;
        let router = ModelRouter::new(cfg).unwrap();

        let prompt = "x".repeat(6000);
        let selection = router
            .select(&RouteRequest::new(tenant(), "chat", prompt))
            .unwrap();
        assert!(router.budget.spent_today(&tenant()) >= selection.estimated_cost_usd - 1e-12);

        router.record_selection_outcome(
            &tenant(),
            &selection,
            Outcome {
                cost_usd: 0.0001,
                latency_ms: 200,
            },
            QualitySignals::default(),
            None,
        );
        assert!((router.budget.spent_today(&tenant()) - 0.0001).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_selection_entropy_exposed_after_routing() {
        let mut cfg = base_config();
        cfg.cache.enabled = false;
        let router = ModelRouter::new(cfg).unwrap();
        assert!(router.selection_entropy(&tenant()).is_none());

        let dispatcher = OkDispatcher::new();
        for i in 0..6 {
            let request = RouteRequest::new(tenant(), "chat", format!("unique prompt {i}"));
            router.execute(&request, &dispatcher).await.unwrap();
        }
        let entropy = router.selection_entropy(&tenant()).unwrap();
        assert!(entropy >= 0.0);
    }

    #[tokio::test]
    async fn test_explicit_candidates_override_routing_config() {
        let mut cfg = base_config();
        cfg.cache.enabled = false;
        let router = ModelRouter::new(cfg).unwrap();

        let request = RouteRequest::new(tenant(), "chat", "hello")
            .with_candidates(vec!["gpt-3.5-turbo".to_string()]);
        let selection = router.select(&request).unwrap();
        assert_eq!(selection.model, "gpt-3.5-turbo");
    }
}
