//! Durable bandit state, one JSON file per tenant.
//!
//! Files are written atomically (write to a temp file in the same directory,
//! then rename) so a crash mid-write never corrupts existing state. Writes
//! happen under the owning tenant's policy lock, which gives the
//! single-writer-per-tenant discipline without extra file locking; startup
//! loads are plain snapshot reads.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use bandit::PolicyState;

use crate::{Result, RouterError, TenantContext};

/// File-backed store for per-tenant policy snapshots.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of a tenant's state file; the key is sanitized so tenant ids
    /// cannot escape the state directory.
    pub fn path_for(&self, tenant: &TenantContext) -> PathBuf {
        let safe: String = tenant
            .storage_key()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Atomically persist a tenant's policy snapshot.
    pub fn save(&self, tenant: &TenantContext, state: &PolicyState) -> Result<()> {
        let path = self.path_for(tenant);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!(tenant = %tenant, path = %path.display(), "bandit state saved");
        Ok(())
    }

    /// Load a tenant's snapshot if one exists.
    pub fn load(&self, tenant: &TenantContext) -> Result<Option<PolicyState>> {
        let path = self.path_for(tenant);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let state = serde_json::from_str(&content).map_err(|e| {
            RouterError::Persistence(format!(
                "corrupt state file {}: {e}",
                path.display()
            ))
        })?;
        Ok(Some(state))
    }

    /// Load a tenant's snapshot, degrading to `None` (with a warning) on any
    /// failure. Persistence trouble must never fail request processing.
    pub fn load_or_default(&self, tenant: &TenantContext) -> Option<PolicyState> {
        match self.load(tenant) {
            Ok(state) => state,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "failed to load bandit state, starting fresh");
                None
            }
        }
    }
}
