//! End-to-end tests for the routing pipeline through the public API.

use async_trait::async_trait;
use serde_json::json;

use router::config::{PolicyChoice, TenantOverlay};
use router::retry::RetryConfig;
use router::route::{DispatchOutput, ModelDispatcher};
use router::{
    ModelRouter, Outcome, QualitySignals, RouteRequest, RouterConfig, TenantContext,
};

fn base_config() -> RouterConfig {
    let mut cfg = RouterConfig::default();
    cfg.budgets
        .pricing
        .insert("fast-model".to_string(), 0.0005);
    cfg.budgets
        .pricing
        .insert("slow-model".to_string(), 0.0005);
    cfg.routing.general = vec!["fast-model".to_string(), "slow-model".to_string()];
    cfg.retry = RetryConfig::new(0).with_initial_backoff(1).with_jitter(false);
    cfg.cache.enabled = false;
    cfg
}

struct ScriptedDispatcher;

#[async_trait]
impl ModelDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, model: &str, _prompt: &str) -> router::Result<DispatchOutput> {
        // The fast model is cheap and quick, the slow one is neither.
        let (cost, latency) = if model == "fast-model" {
            (0.0002, 200)
        } else {
            (0.009, 25_000)
        };
        Ok(DispatchOutput {
            payload: json!({"model": model}),
            cost_usd: Some(cost),
            latency_ms: Some(latency),
            quality: None,
        })
    }
}

#[tokio::test]
async fn test_router_converges_toward_rewarding_model() {
    let router = ModelRouter::new(base_config()).unwrap();
    let tenant = TenantContext::new("acme", "main");
    let dispatcher = ScriptedDispatcher;

    let mut fast_picks = 0;
    for i in 0..80 {
        let request = RouteRequest::new(tenant.clone(), "chat", format!("prompt {i}"));
        let response = router.execute(&request, &dispatcher).await.unwrap();
        if i >= 40 && response.model == "fast-model" {
            fast_picks += 1;
        }
    }

    // After the burn-in, the learner should strongly prefer the model whose
    // outcomes score higher.
    assert!(
        fast_picks > 25,
        "fast-model picked only {fast_picks}/40 times after burn-in"
    );
}

#[tokio::test]
async fn test_converged_tenant_has_lower_selection_entropy_than_fresh() {
    let router = ModelRouter::new(base_config()).unwrap();
    let skewed = TenantContext::new("acme", "main");
    let uniform = TenantContext::new("globex", "main");
    let dispatcher = ScriptedDispatcher;

    for i in 0..60 {
        let request = RouteRequest::new(skewed.clone(), "chat", format!("prompt {i}"));
        router.execute(&request, &dispatcher).await.unwrap();
    }

    // The fresh tenant sees identical mid-range outcomes for every arm, so it
    // keeps exploring.
    for i in 0..60 {
        let selection = router
            .select(&RouteRequest::new(
                uniform.clone(),
                "chat",
                format!("prompt {i}"),
            ))
            .unwrap();
        router.record_selection_outcome(
            &uniform,
            &selection,
            Outcome {
                cost_usd: 0.005,
                latency_ms: 15_000,
            },
            QualitySignals::default(),
            None,
        );
    }

    let skewed_entropy = router.selection_entropy(&skewed).unwrap();
    let uniform_entropy = router.selection_entropy(&uniform).unwrap();
    assert!(
        skewed_entropy < uniform_entropy,
        "expected converged entropy {skewed_entropy} below exploring entropy {uniform_entropy}"
    );
}

#[tokio::test]
async fn test_persistence_resumes_learning_across_router_instances() {
    let dir = tempfile::tempdir().unwrap();
    let tenant = TenantContext::new("acme", "main");

    let mut cfg = base_config();
    cfg.flags.persistence_enabled = true;
    cfg.state_dir = Some(dir.path().to_path_buf());

    let quality_only = TenantOverlay::from_yaml_str(
        r#"
        rl:
          weights:
            cost: 0.0
            latency: 0.0
            quality: 1.0
    "#,
    )
    .unwrap();

    {
        let router = ModelRouter::new(cfg.clone()).unwrap();
        router.register_tenant_overlay(&tenant, &quality_only).unwrap();
        router.record_outcome(
            &tenant,
            "fast-model",
            Outcome {
                cost_usd: 0.0002,
                latency_ms: 100,
            },
            QualitySignals { quality: Some(1.0) },
        );
    }

    let state_file = dir.path().join("acme__main.json");
    let state: bandit::PolicyState =
        serde_json::from_str(&std::fs::read_to_string(&state_file).unwrap()).unwrap();
    match &state {
        bandit::PolicyState::Thompson { arms } => {
            let arm = arms.get("fast-model").unwrap();
            assert!((arm.alpha - 2.0).abs() < 1e-9);
            assert_eq!(arm.pulls, 1);
        }
        other => panic!("expected thompson state, got {other:?}"),
    }

    // A new router instance resumes from the persisted posterior.
    let router = ModelRouter::new(cfg).unwrap();
    router.register_tenant_overlay(&tenant, &quality_only).unwrap();
    router.record_outcome(
        &tenant,
        "fast-model",
        Outcome {
            cost_usd: 0.0002,
            latency_ms: 100,
        },
        QualitySignals { quality: Some(1.0) },
    );

    let state: bandit::PolicyState =
        serde_json::from_str(&std::fs::read_to_string(&state_file).unwrap()).unwrap();
    match &state {
        bandit::PolicyState::Thompson { arms } => {
            let arm = arms.get("fast-model").unwrap();
            assert!((arm.alpha - 3.0).abs() < 1e-9);
            assert_eq!(arm.pulls, 2);
        }
        other => panic!("expected thompson state, got {other:?}"),
    }
}

#[tokio::test]
async fn test_contextual_routing_with_and_without_features() {
    let mut cfg = base_config();
    cfg.rl.policy = PolicyChoice::LinUcb;
    cfg.rl.linucb.dim = 2;
    cfg.rl.linucb.recompute_interval = 1;
    cfg.flags.contextual_enabled = true;
    let router = ModelRouter::new(cfg).unwrap();
    let tenant = TenantContext::new("acme", "main");

    let with_features = RouteRequest::new(tenant.clone(), "chat", "classify this text")
        .with_features(vec![1.0, 0.0]);
    let selection = router.select(&with_features).unwrap();
    assert!(!selection.contextual_fallback);
    router.record_selection_outcome(
        &tenant,
        &selection,
        Outcome {
            cost_usd: 0.0002,
            latency_ms: 150,
        },
        QualitySignals::default(),
        Some(&[1.0, 0.0]),
    );

    // Missing features fall back to the shadow policy, not an error.
    let without_features = RouteRequest::new(tenant.clone(), "chat", "classify this text too");
    let selection = router.select(&without_features).unwrap();
    assert!(selection.contextual_fallback);

    // A malformed feature vector is recovered locally the same way.
    let wrong_dim = RouteRequest::new(tenant, "chat", "and this one")
        .with_features(vec![1.0, 0.0, 3.0]);
    let selection = router.select(&wrong_dim).unwrap();
    assert!(selection.contextual_fallback);
}

#[tokio::test]
async fn test_task_routing_uses_general_fallback_bucket() {
    let mut cfg = base_config();
    cfg.routing
        .task_models
        .insert("summarize".to_string(), vec!["fast-model".to_string()]);
    let router = ModelRouter::new(cfg).unwrap();
    let tenant = TenantContext::new("acme", "main");

    let selection = router
        .select(&RouteRequest::new(tenant.clone(), "summarize", "short text"))
        .unwrap();
    assert_eq!(selection.model, "fast-model");

    // Unknown task types draw from the general bucket.
    let selection = router
        .select(&RouteRequest::new(tenant, "translate", "short text"))
        .unwrap();
    assert!(["fast-model", "slow-model"].contains(&selection.model.as_str()));
}
