//! Engine configuration.

use crate::sync::conflict::ConflictPolicy;
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Options for the collection engine and the adapters it drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The only `storageVersion` accepted in `meta/global`.
    pub storage_version: i64,
    /// Remote bucket holding every collection.
    pub bucket: String,
    /// Adapters only pull when set.
    pub read_only: bool,
    pub conflict_policy: ConflictPolicy,
    /// Attempts for a local write that hits a stale revision.
    pub max_store_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_version: 5,
            bucket: "syncto".to_string(),
            read_only: true,
            conflict_policy: ConflictPolicy::RemoteWins,
            max_store_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::InvalidConfiguration(format!("Read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SyncError::InvalidConfiguration(format!("Parse config: {}", e)))?;
        if config.max_store_retries == 0 {
            return Err(SyncError::InvalidConfiguration(
                "max_store_retries must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}
