//! Per-tenant bandit instance lifecycle.
//!
//! The registry owns the mapping from [`TenantContext`] to a live bandit
//! instance and guarantees one instance per tenant for the process lifetime,
//! so online learning converges across calls. Instance creation sits behind a
//! coarse lock (read-mostly afterward); each instance's policy sits behind
//! its own mutex so concurrent updates never lose increments.
//!
//! The registry is an explicit dependency-injected object; there is no
//! process-wide singleton.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use bandit::{
    shannon_entropy_bits, EpsilonGreedy, EpsilonGreedyConfig, LinUcb, PolicyState,
    ThompsonConfig, ThompsonSampling, Ucb1,
};

use crate::config::{PolicyChoice, RouterConfig};
use crate::persistence::StateStore;
use crate::{Result, TenantContext};

/// The policy variant a tenant runs.
///
/// The contextual variant carries a Thompson shadow that is updated alongside
/// LinUCB on every outcome, so decisions that fall back (missing features,
/// dimension mismatch, norm-gate rejection) draw on learned state instead of
/// a cold prior.
#[derive(Debug)]
pub enum TenantPolicy {
    EpsilonGreedy(EpsilonGreedy),
    Ucb1(Ucb1),
    Thompson(ThompsonSampling),
    LinUcb {
        contextual: LinUcb,
        shadow: ThompsonSampling,
    },
}

impl TenantPolicy {
    fn thompson_config(cfg: &RouterConfig) -> ThompsonConfig {
        ThompsonConfig {
            prior_alpha: cfg.rl.prior_alpha,
            prior_beta: cfg.rl.prior_beta,
            entropy_threshold: cfg.flags.entropy_threshold,
            entropy_window: cfg.flags.entropy_window,
            entropy_decay: cfg.flags.entropy_decay,
            seed: cfg.rl.seed,
        }
    }

    /// Build the policy a tenant's resolved configuration asks for.
    ///
    /// Requesting LinUCB with the contextual flag off degrades to Thompson
    /// sampling.
    pub fn from_config(cfg: &RouterConfig) -> Self {
        match cfg.rl.policy {
            PolicyChoice::EpsilonGreedy => TenantPolicy::EpsilonGreedy(EpsilonGreedy::new(
                EpsilonGreedyConfig {
                    epsilon: cfg.rl.epsilon.max(cfg.flags.epsilon_floor),
                    seed: cfg.rl.seed,
                },
            )),
            PolicyChoice::Ucb1 => TenantPolicy::Ucb1(Ucb1::new()),
            PolicyChoice::Thompson => {
                TenantPolicy::Thompson(ThompsonSampling::new(Self::thompson_config(cfg)))
            }
            PolicyChoice::LinUcb if cfg.flags.contextual_enabled => TenantPolicy::LinUcb {
                contextual: LinUcb::new(cfg.rl.linucb),
                shadow: ThompsonSampling::new(Self::thompson_config(cfg)),
            },
            PolicyChoice::LinUcb => {
                debug!("contextual policy requested but disabled, using thompson");
                TenantPolicy::Thompson(ThompsonSampling::new(Self::thompson_config(cfg)))
            }
        }
    }

    /// Select an arm. The second return value is true when a contextual
    /// request was served by the non-contextual shadow.
    pub fn select(&mut self, arms: &[String], features: Option<&[f64]>) -> (Option<String>, bool) {
        match self {
            TenantPolicy::EpsilonGreedy(p) => (p.select(arms), false),
            TenantPolicy::Ucb1(p) => (p.select(arms), false),
            TenantPolicy::Thompson(p) => (p.select(arms), false),
            TenantPolicy::LinUcb { contextual, shadow } => match features {
                Some(x) => match contextual.select_with_context(arms, x) {
                    Ok(choice) => (choice, false),
                    Err(e) => {
                        debug!(error = %e, "context rejected, falling back to thompson");
                        (shadow.select(arms), true)
                    }
                },
                None => (shadow.select(arms), true),
            },
        }
    }

    /// Attribute a reward to the arm chosen for this request.
    pub fn update(&mut self, arm: &str, reward: f64, features: Option<&[f64]>) {
        match self {
            TenantPolicy::EpsilonGreedy(p) => p.update(arm, reward),
            TenantPolicy::Ucb1(p) => p.update(arm, reward),
            TenantPolicy::Thompson(p) => p.update(arm, reward),
            TenantPolicy::LinUcb { contextual, shadow } => {
                if let Some(x) = features {
                    if let Err(e) = contextual.update_with_context(arm, x, reward) {
                        debug!(error = %e, "context rejected on update, shadow only");
                    }
                }
                shadow.update(arm, reward);
            }
        }
    }

    pub fn snapshot(&self) -> PolicyState {
        match self {
            TenantPolicy::EpsilonGreedy(p) => p.snapshot(),
            TenantPolicy::Ucb1(p) => p.snapshot(),
            TenantPolicy::Thompson(p) => p.snapshot(),
            TenantPolicy::LinUcb { contextual, .. } => contextual.snapshot(),
        }
    }

    /// Apply persisted state to the matching sub-policy.
    pub fn restore(&mut self, state: PolicyState) -> bandit::Result<()> {
        match (self, state) {
            (TenantPolicy::EpsilonGreedy(p), s @ PolicyState::EpsilonGreedy { .. }) => p.restore(s),
            (TenantPolicy::Ucb1(p), s @ PolicyState::Ucb1 { .. }) => p.restore(s),
            (TenantPolicy::Thompson(p), s @ PolicyState::Thompson { .. }) => p.restore(s),
            (TenantPolicy::LinUcb { contextual, .. }, s @ PolicyState::LinUcb { .. }) => {
                contextual.restore(s)
            }
            // A tenant whose configured policy changed since the snapshot:
            // a Thompson snapshot still seeds the contextual shadow.
            (TenantPolicy::LinUcb { shadow, .. }, s @ PolicyState::Thompson { .. }) => {
                shadow.restore(s)
            }
            (_, other) => Err(bandit::BanditError::InvalidState(format!(
                "snapshot does not match configured policy: {other:?}"
            ))),
        }
    }
}

/// One tenant's live bandit: policy plus selection bookkeeping.
#[derive(Debug)]
pub struct TenantBandit {
    tenant: TenantContext,
    policy: Mutex<TenantPolicy>,
    selections: Mutex<HashMap<String, u64>>,
}

impl TenantBandit {
    fn new(tenant: TenantContext, policy: TenantPolicy) -> Self {
        Self {
            tenant,
            policy: Mutex::new(policy),
            selections: Mutex::new(HashMap::new()),
        }
    }

    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    /// Select an arm; see [`TenantPolicy::select`].
    pub fn select(&self, arms: &[String], features: Option<&[f64]>) -> (Option<String>, bool) {
        self.policy.lock().select(arms, features)
    }

    /// Apply a reward to the chosen arm. Safe under concurrent invocation;
    /// updates are serialized by the policy mutex and never lost.
    pub fn update(&self, arm: &str, reward: f64, features: Option<&[f64]>) {
        self.policy.lock().update(arm, reward, features);
    }

    /// Increment the selection count for an arm.
    pub fn record_selection(&self, arm: &str) {
        *self.selections.lock().entry(arm.to_string()).or_insert(0) += 1;
    }

    pub fn selection_counts(&self) -> HashMap<String, u64> {
        self.selections.lock().clone()
    }

    /// Shannon entropy (bits) over the selection-count distribution: a
    /// diversity-of-exploration health signal, independent of reward
    /// magnitude and distinct from the posterior entropy used for resets.
    pub fn selection_entropy(&self) -> f64 {
        let counts: Vec<f64> = self.selections.lock().values().map(|c| *c as f64).collect();
        shannon_entropy_bits(&counts)
    }

    pub fn snapshot(&self) -> PolicyState {
        self.policy.lock().snapshot()
    }

    fn save_to(&self, store: &StateStore) -> Result<()> {
        // Snapshot and write under the policy lock: single writer per tenant.
        let policy = self.policy.lock();
        store.save(&self.tenant, &policy.snapshot())
    }
}

/// Registry of live tenant bandits.
#[derive(Debug)]
pub struct BanditRegistry {
    tenants: RwLock<HashMap<String, Arc<TenantBandit>>>,
    store: Option<StateStore>,
}

impl BanditRegistry {
    pub fn new(store: Option<StateStore>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Fetch the tenant's bandit, creating (and loading persisted state for)
    /// it on first use.
    pub fn get_or_create(&self, tenant: &TenantContext, cfg: &RouterConfig) -> Arc<TenantBandit> {
        let key = tenant.storage_key();
        if let Some(existing) = self.tenants.read().get(&key) {
            return Arc::clone(existing);
        }

        let mut tenants = self.tenants.write();
        // Double-checked: another worker may have created it while we waited.
        if let Some(existing) = tenants.get(&key) {
            return Arc::clone(existing);
        }

        let mut policy = TenantPolicy::from_config(cfg);
        if let Some(store) = &self.store {
            if let Some(state) = store.load_or_default(tenant) {
                if let Err(e) = policy.restore(state) {
                    warn!(tenant = %tenant, error = %e, "persisted state rejected, starting fresh");
                }
            }
        }

        debug!(tenant = %tenant, "bandit instance created");
        let instance = Arc::new(TenantBandit::new(tenant.clone(), policy));
        tenants.insert(key, Arc::clone(&instance));
        instance
    }

    /// Look up an existing tenant bandit without creating one.
    pub fn get(&self, tenant: &TenantContext) -> Option<Arc<TenantBandit>> {
        self.tenants.read().get(&tenant.storage_key()).cloned()
    }

    /// Persist a tenant's current policy state, if a store is configured.
    /// Failures are logged and swallowed; persistence never fails a request.
    pub fn save(&self, tenant: &TenantContext) {
        let (Some(store), Some(instance)) = (&self.store, self.get(tenant)) else {
            return;
        };
        if let Err(e) = instance.save_to(store) {
            warn!(tenant = %tenant, error = %e, "failed to persist bandit state");
        }
    }

    /// Selection entropy for a tenant, if it has a live instance.
    pub fn selection_entropy(&self, tenant: &TenantContext) -> Option<f64> {
        self.get(tenant).map(|b| b.selection_entropy())
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;

    fn tenant() -> TenantContext {
        TenantContext::new("acme", "main")
    }

    fn arms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_one_instance_per_tenant_for_process_lifetime() {
        let registry = BanditRegistry::new(None);
        let cfg = RouterConfig::default();

        let a = registry.get_or_create(&tenant(), &cfg);
        let b = registry.get_or_create(&tenant(), &cfg);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.tenant_count(), 1);

        let other = TenantContext::new("globex", "main");
        let c = registry.get_or_create(&other, &cfg);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.tenant_count(), 2);
    }

    #[test]
    fn test_learning_survives_across_lookups() {
        let registry = BanditRegistry::new(None);
        let cfg = RouterConfig::default();
        let candidates = arms(&["a", "b"]);

        let instance = registry.get_or_create(&tenant(), &cfg);
        for _ in 0..10 {
            instance.update("a", 1.0, None);
        }

        // A later lookup sees the same learned state.
        let again = registry.get_or_create(&tenant(), &cfg);
        let (choice, _) = again.select(&candidates, None);
        assert!(choice.is_some());
        match &again.snapshot() {
            PolicyState::Thompson { arms } => {
                assert!(arms.get("a").unwrap().alpha > 10.0);
            }
            other => panic!("expected thompson state, got {other:?}"),
        }
    }

    #[test]
    fn test_selection_entropy_drops_as_selection_concentrates() {
        let registry = BanditRegistry::new(None);
        let cfg = RouterConfig::default();

        let converged = registry.get_or_create(&tenant(), &cfg);
        let exploring = registry.get_or_create(&TenantContext::new("globex", "main"), &cfg);

        for _ in 0..30 {
            converged.record_selection("a");
        }
        converged.record_selection("b");

        for _ in 0..15 {
            exploring.record_selection("a");
            exploring.record_selection("b");
        }

        assert!(converged.selection_entropy() < exploring.selection_entropy());
        assert!((exploring.selection_entropy() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_contextual_fallback_on_missing_features() {
        let mut cfg = RouterConfig::default();
        cfg.rl.policy = PolicyChoice::LinUcb;
        cfg.flags.contextual_enabled = true;
        cfg.rl.linucb.dim = 2;

        let registry = BanditRegistry::new(None);
        let instance = registry.get_or_create(&tenant(), &cfg);
        let candidates = arms(&["a", "b"]);

        let (choice, fallback) = instance.select(&candidates, None);
        assert!(choice.is_some());
        assert!(fallback);

        let (choice, fallback) = instance.select(&candidates, Some(&[1.0, 0.5]));
        assert!(choice.is_some());
        assert!(!fallback);

        // Wrong dimension: recovered locally, served by the shadow.
        let (choice, fallback) = instance.select(&candidates, Some(&[1.0, 0.5, 0.2]));
        assert!(choice.is_some());
        assert!(fallback);
    }

    #[test]
    fn test_contextual_disabled_degrades_to_thompson() {
        let mut cfg = RouterConfig::default();
        cfg.rl.policy = PolicyChoice::LinUcb;
        cfg.flags.contextual_enabled = false;

        let policy = TenantPolicy::from_config(&cfg);
        assert!(matches!(policy, TenantPolicy::Thompson(_)));
    }

    #[test]
    fn test_persisted_state_loaded_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RouterConfig::default();

        {
            let store = StateStore::new(dir.path()).unwrap();
            let registry = BanditRegistry::new(Some(store));
            let instance = registry.get_or_create(&tenant(), &cfg);
            instance.update("gpt-4", 0.8, None);
            registry.save(&tenant());
        }

        // A new registry (fresh process) resumes from disk.
        let store = StateStore::new(dir.path()).unwrap();
        let registry = BanditRegistry::new(Some(store));
        let instance = registry.get_or_create(&tenant(), &cfg);
        match instance.snapshot() {
            PolicyState::Thompson { arms } => {
                let arm = arms.get("gpt-4").unwrap();
                assert!((arm.alpha - 1.8).abs() < 1e-12);
                assert_eq!(arm.pulls, 1);
            }
            other => panic!("expected thompson state, got {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_increments() {
        use std::thread;

        let registry = Arc::new(BanditRegistry::new(None));
        let cfg = RouterConfig::default();
        let instance = registry.get_or_create(&tenant(), &cfg);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let instance = Arc::clone(&instance);
                thread::spawn(move || {
                    for _ in 0..100 {
                        instance.update("a", 1.0, None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        match instance.snapshot() {
            PolicyState::Thompson { arms } => {
                assert_eq!(arms.get("a").unwrap().pulls, 800);
            }
            other => panic!("expected thompson state, got {other:?}"),
        }
    }
}
