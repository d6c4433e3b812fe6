//! Tenant-isolated semantic response cache.
//!
//! Prompts are embedded with a deterministic hashed bag-of-words scheme
//! (FNV-1a token hashing with a SplitMix64 finalizer, signed buckets, L2
//! normalized) so near-duplicate prompts land close in cosine space without
//! any external embedding service. Lookups scan only the requesting tenant's
//! namespace; identical prompt text under another tenant never matches.
//!
//! Eviction is TTL-first (expired entries are purged on access) with LRU
//! once a namespace reaches capacity.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::TenantContext;

/// Semantic cache tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Minimum cosine similarity for a hit.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Entry time-to-live in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// LRU capacity per tenant namespace.
    #[serde(default = "default_max_entries")]
    pub max_entries_per_tenant: usize,

    /// Embedding vector dimension.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_similarity_threshold() -> f64 {
    0.9
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_entries() -> usize {
    512
}

fn default_embedding_dim() -> usize {
    256
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            similarity_threshold: default_similarity_threshold(),
            ttl_secs: default_ttl_secs(),
            max_entries_per_tenant: default_max_entries(),
            embedding_dim: default_embedding_dim(),
        }
    }
}

/// A cache hit returned to the pipeline.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub model: String,
    pub payload: serde_json::Value,
    pub similarity: f64,
}

#[derive(Debug)]
struct Entry {
    embedding: Vec<f64>,
    model: String,
    payload: serde_json::Value,
    inserted_at: Instant,
    last_access: Instant,
}

/// Deterministic non-crypto hash: FNV-1a over bytes plus a SplitMix64
/// finalizer for bit diffusion. Stable across platforms and runs.
fn stable_hash64(s: &str) -> u64 {
    let mut h: u64 = 14695981039346656037;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    splitmix64(h)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    // Embeddings are L2-normalized at construction, so cosine is a dot product.
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Tenant-namespaced semantic cache.
#[derive(Debug)]
pub struct SemanticCache {
    cfg: CacheConfig,
    tenants: Mutex<HashMap<String, Vec<Entry>>>,
}

impl SemanticCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    /// Hashed bag-of-words embedding, L2 normalized.
    pub fn embed(&self, text: &str) -> Vec<f64> {
        let dim = self.cfg.embedding_dim.max(1);
        let mut v = vec![0.0; dim];
        for token in text.to_lowercase().split_whitespace() {
            let h = stable_hash64(token);
            let idx = (h % dim as u64) as usize;
            let sign = if h & (1 << 32) != 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.cfg.ttl_secs)
    }

    /// Look up the best match for `prompt` in the tenant's namespace.
    pub fn get(&self, tenant: &TenantContext, prompt: &str) -> Option<CachedResponse> {
        if !self.cfg.enabled {
            return None;
        }
        let query = self.embed(prompt);
        let ttl = self.ttl();
        let mut tenants = self.tenants.lock();
        let entries = tenants.get_mut(&tenant.storage_key())?;
        entries.retain(|e| e.inserted_at.elapsed() < ttl);

        let mut best: Option<(usize, f64)> = None;
        for (i, entry) in entries.iter().enumerate() {
            let sim = cosine(&query, &entry.embedding);
            if sim >= self.cfg.similarity_threshold
                && best.map(|(_, s)| sim > s).unwrap_or(true)
            {
                best = Some((i, sim));
            }
        }

        best.map(|(i, similarity)| {
            let entry = &mut entries[i];
            entry.last_access = Instant::now();
            debug!(tenant = %tenant, similarity, "semantic cache hit");
            CachedResponse {
                model: entry.model.clone(),
                payload: entry.payload.clone(),
                similarity,
            }
        })
    }

    /// Insert a completed response into the tenant's namespace.
    pub fn insert(
        &self,
        tenant: &TenantContext,
        prompt: &str,
        model: &str,
        payload: serde_json::Value,
    ) {
        if !self.cfg.enabled {
            return;
        }
        let embedding = self.embed(prompt);
        let ttl = self.ttl();
        let now = Instant::now();
        let mut tenants = self.tenants.lock();
        let entries = tenants.entry(tenant.storage_key()).or_default();
        entries.retain(|e| e.inserted_at.elapsed() < ttl);

        if entries.len() >= self.cfg.max_entries_per_tenant.max(1) {
            // Evict the least recently accessed entry.
            if let Some(lru) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(i, _)| i)
            {
                entries.swap_remove(lru);
            }
        }

        entries.push(Entry {
            embedding,
            model: model.to_string(),
            payload,
            inserted_at: now,
            last_access: now,
        });
    }

    /// Number of live entries in a tenant's namespace.
    pub fn len(&self, tenant: &TenantContext) -> usize {
        let tenants = self.tenants.lock();
        tenants
            .get(&tenant.storage_key())
            .map(|e| e.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, tenant: &TenantContext) -> bool {
        self.len(tenant) == 0
    }
}
