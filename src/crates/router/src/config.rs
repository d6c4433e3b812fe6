//! Router configuration: global defaults plus per-tenant overlays.
//!
//! Configuration is a typed struct validated at load time. Tenant YAML
//! overlay documents are deserialized as partial structures and applied
//! field-by-field on top of the global defaults, so a tenant that only tunes
//! its reward weights inherits every other default unchanged.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bandit::LinUcbConfig;

use crate::cache::CacheConfig;
use crate::circuit::BreakerConfig;
use crate::retry::RetryConfig;
use crate::reward::RewardWeights;
use crate::{Result, RouterError};

/// Which bandit policy a tenant's router runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyChoice {
    EpsilonGreedy,
    Ucb1,
    Thompson,
    LinUcb,
}

/// Budget caps and pricing for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Daily spending cap in USD, reset on the UTC date boundary.
    #[serde(default = "default_daily_cap")]
    pub daily_cap_usd: f64,

    /// Per-request cost cap in USD, unless overridden per task.
    #[serde(default = "default_per_request_cap")]
    pub max_per_request_usd: f64,

    /// Per-request caps by task type, overriding `max_per_request_usd`.
    #[serde(default)]
    pub by_task_caps: HashMap<String, f64>,

    /// Price per 1k tokens by model id.
    #[serde(default)]
    pub pricing: HashMap<String, f64>,

    /// Price per 1k tokens assumed for models missing from `pricing`.
    #[serde(default = "default_price_per_1k")]
    pub default_price_per_1k: f64,

    /// Prompts longer than this many bytes switch the token estimate from
    /// whitespace counting to `len / 4`.
    #[serde(default = "default_long_text_threshold")]
    pub long_text_threshold: usize,
}

fn default_daily_cap() -> f64 {
    10.0
}

fn default_per_request_cap() -> f64 {
    0.5
}

fn default_price_per_1k() -> f64 {
    0.002
}

fn default_long_text_threshold() -> usize {
    400
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_cap_usd: default_daily_cap(),
            max_per_request_usd: default_per_request_cap(),
            by_task_caps: HashMap::new(),
            pricing: HashMap::new(),
            default_price_per_1k: default_price_per_1k(),
            long_text_threshold: default_long_text_threshold(),
        }
    }
}

impl BudgetConfig {
    /// Per-request cap for a task, honoring per-task overrides.
    pub fn per_request_cap(&self, task_type: &str) -> f64 {
        self.by_task_caps
            .get(task_type)
            .copied()
            .unwrap_or(self.max_per_request_usd)
    }

    /// Price per 1k tokens for a model, falling back to the default price.
    pub fn price_per_1k(&self, model: &str) -> f64 {
        self.pricing
            .get(model)
            .copied()
            .unwrap_or(self.default_price_per_1k)
    }
}

/// Task-type to candidate-model routing with an explicit `general` fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Candidate models per task type.
    #[serde(default)]
    pub task_models: HashMap<String, Vec<String>>,

    /// Fallback bucket for task types with no explicit entry.
    #[serde(default)]
    pub general: Vec<String>,

    /// Last-resort model when no bucket matches.
    #[serde(default)]
    pub default_model: Option<String>,

    /// Provider by model id; models not listed belong to `"default"`.
    #[serde(default)]
    pub providers: HashMap<String, String>,
}

impl RoutingConfig {
    /// Resolve the candidate list for a task type.
    pub fn candidates_for(&self, task_type: &str) -> Vec<String> {
        if let Some(models) = self.task_models.get(task_type) {
            if !models.is_empty() {
                return models.clone();
            }
        }
        if !self.general.is_empty() {
            return self.general.clone();
        }
        self.default_model.iter().cloned().collect()
    }

    pub fn provider_of(&self, model: &str) -> &str {
        self.providers
            .get(model)
            .map(String::as_str)
            .unwrap_or("default")
    }
}

/// Learner tuning for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlConfig {
    #[serde(default = "default_policy")]
    pub policy: PolicyChoice,

    /// Exploration probability for epsilon-greedy.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Beta prior parameters for Thompson sampling.
    #[serde(default = "default_prior")]
    pub prior_alpha: f64,
    #[serde(default = "default_prior")]
    pub prior_beta: f64,

    /// Reward component weights.
    #[serde(default)]
    pub weights: RewardWeights,

    /// Cost at which the cost component of the reward reaches zero.
    #[serde(default = "default_reference_cost")]
    pub reference_cost_usd: f64,

    /// Latency at which the latency component of the reward reaches zero.
    #[serde(default = "default_latency_window")]
    pub latency_window_ms: u64,

    /// Contextual policy tuning.
    #[serde(default)]
    pub linucb: LinUcbConfig,

    /// RNG seed for reproducible selection.
    #[serde(default)]
    pub seed: u64,
}

fn default_policy() -> PolicyChoice {
    PolicyChoice::Thompson
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_prior() -> f64 {
    1.0
}

fn default_reference_cost() -> f64 {
    0.01
}

fn default_latency_window() -> u64 {
    30_000
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            epsilon: default_epsilon(),
            prior_alpha: default_prior(),
            prior_beta: default_prior(),
            weights: RewardWeights::default(),
            reference_cost_usd: default_reference_cost(),
            latency_window_ms: default_latency_window(),
            linucb: LinUcbConfig::default(),
            seed: 0,
        }
    }
}

/// Deployment toggles, supplied by the environment as named fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Allow the contextual (LinUCB) policy; off routes contextual requests
    /// through Thompson sampling.
    #[serde(default)]
    pub contextual_enabled: bool,

    /// Persist bandit state to disk after updates.
    #[serde(default)]
    pub persistence_enabled: bool,

    /// Lower bound applied to the epsilon-greedy exploration rate.
    #[serde(default = "default_epsilon_floor")]
    pub epsilon_floor: f64,

    /// Posterior-entropy floor (bits) for the Thompson watchdog; 0 disables.
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,

    /// Consecutive low-entropy updates before a decay fires.
    #[serde(default = "default_entropy_window")]
    pub entropy_window: u32,

    /// Fraction of learned state retained when a decay fires.
    #[serde(default = "default_entropy_decay")]
    pub entropy_decay: f64,
}

fn default_epsilon_floor() -> f64 {
    0.05
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

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            contextual_enabled: false,
            persistence_enabled: false,
            epsilon_floor: default_epsilon_floor(),
            entropy_threshold: default_entropy_threshold(),
            entropy_window: default_entropy_window(),
            entropy_decay: default_entropy_decay(),
        }
    }
}

/// Full router configuration for one tenant (or the global defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub budgets: BudgetConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub rl: RlConfig,
    #[serde(default)]
    pub flags: FeatureFlags,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Directory for persisted bandit state files.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl RouterConfig {
    /// Load a full configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_yaml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| RouterError::Config(format!("invalid router configuration: {e}")))
    }

    /// Validate invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.budgets.daily_cap_usd < 0.0 || self.budgets.max_per_request_usd < 0.0 {
            return Err(RouterError::Config(
                "budget caps must be non-negative".to_string(),
            ));
        }
        if !self.routing.task_models.is_empty()
            && self.routing.general.is_empty()
            && self.routing.default_model.is_none()
        {
            return Err(RouterError::Config(
                "routing.task_models requires a general fallback bucket or default_model"
                    .to_string(),
            ));
        }
        if self.rl.epsilon < 0.0 || self.rl.epsilon > 1.0 {
            return Err(RouterError::Config(format!(
                "rl.epsilon must be in [0, 1], got {}",
                self.rl.epsilon
            )));
        }
        if self.flags.persistence_enabled && self.state_dir.is_none() {
            return Err(RouterError::Config(
                "persistence_enabled requires state_dir".to_string(),
            ));
        }
        Ok(())
    }

    /// Produce the effective configuration for a tenant by applying its
    /// overlay on top of these defaults.
    pub fn for_tenant(&self, overlay: &TenantOverlay) -> RouterConfig {
        let mut resolved = self.clone();
        overlay.apply(&mut resolved);
        resolved
    }
}

/// Partial per-tenant configuration; every field is optional and only present
/// fields override the global defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantOverlay {
    #[serde(default)]
    pub budgets: Option<BudgetOverlay>,
    #[serde(default)]
    pub routing: Option<RoutingOverlay>,
    #[serde(default)]
    pub rl: Option<RlOverlay>,
    #[serde(default)]
    pub flags: Option<FlagsOverlay>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BudgetOverlay {
    pub daily_cap_usd: Option<f64>,
    pub max_per_request_usd: Option<f64>,
    /// Merged into the default per-task caps, key by key.
    pub by_task_caps: Option<HashMap<String, f64>>,
    /// Merged into the default pricing map, key by key.
    pub pricing: Option<HashMap<String, f64>>,
    pub default_price_per_1k: Option<f64>,
    pub long_text_threshold: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingOverlay {
    /// Merged into the default task buckets, key by key.
    pub task_models: Option<HashMap<String, Vec<String>>>,
    pub general: Option<Vec<String>>,
    pub default_model: Option<String>,
    pub providers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RlOverlay {
    pub policy: Option<PolicyChoice>,
    pub epsilon: Option<f64>,
    pub prior_alpha: Option<f64>,
    pub prior_beta: Option<f64>,
    pub weights: Option<WeightsOverlay>,
    pub reference_cost_usd: Option<f64>,
    pub latency_window_ms: Option<u64>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeightsOverlay {
    pub cost: Option<f64>,
    pub latency: Option<f64>,
    pub quality: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagsOverlay {
    pub contextual_enabled: Option<bool>,
    pub persistence_enabled: Option<bool>,
    pub epsilon_floor: Option<f64>,
    pub entropy_threshold: Option<f64>,
    pub entropy_window: Option<u32>,
    pub entropy_decay: Option<f64>,
}

macro_rules! overlay_field {
    ($overlay:expr, $target:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(v) = $overlay.$field.clone() {
                $target.$field = v;
            }
        )+
    };
}

impl TenantOverlay {
    /// Load a tenant overlay from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| RouterError::Config(format!("invalid tenant overlay: {e}")))
    }

    fn apply(&self, target: &mut RouterConfig) {
        if let Some(budgets) = &self.budgets {
            overlay_field!(
                budgets,
                target.budgets,
                daily_cap_usd,
                max_per_request_usd,
                default_price_per_1k,
                long_text_threshold,
            );
            if let Some(caps) = &budgets.by_task_caps {
                target.budgets.by_task_caps.extend(caps.clone());
            }
            if let Some(pricing) = &budgets.pricing {
                target.budgets.pricing.extend(pricing.clone());
            }
        }
        if let Some(routing) = &self.routing {
            if let Some(task_models) = &routing.task_models {
                target.routing.task_models.extend(task_models.clone());
            }
            if let Some(general) = &routing.general {
                target.routing.general = general.clone();
            }
            if let Some(default_model) = &routing.default_model {
                target.routing.default_model = Some(default_model.clone());
            }
            if let Some(providers) = &routing.providers {
                target.routing.providers.extend(providers.clone());
            }
        }
        if let Some(rl) = &self.rl {
            overlay_field!(
                rl,
                target.rl,
                policy,
                epsilon,
                prior_alpha,
                prior_beta,
                reference_cost_usd,
                latency_window_ms,
                seed,
            );
            if let Some(weights) = &rl.weights {
                if let Some(cost) = weights.cost {
                    target.rl.weights.cost = cost;
                }
                if let Some(latency) = weights.latency {
                    target.rl.weights.latency = latency;
                }
                if let Some(quality) = weights.quality {
                    target.rl.weights.quality = quality;
                }
            }
        }
        if let Some(flags) = &self.flags {
            overlay_field!(
                flags,
                target.flags,
                contextual_enabled,
                persistence_enabled,
                epsilon_floor,
                entropy_threshold,
                entropy_window,
                entropy_decay,
            );
        }
    }
}
