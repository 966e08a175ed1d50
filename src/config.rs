// src/config.rs

use crate::policy::DomainPolicyTable;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Name of the cache folder inside the OS temp directory.
pub const DEFAULT_CACHE_FOLDER: &str = "remote_file_cache";

/// Options for a cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Where cached files live. `None` means `<temp>/remote_file_cache`.
    pub cache_dir: Option<PathBuf>,
    /// A transfer that receives no bytes for this long aborts itself.
    pub inactivity_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub policies: DomainPolicyTable,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            inactivity_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(60),
            user_agent: concat!("remote-file-cache/", env!("CARGO_PKG_VERSION")).to_string(),
            policies: DomainPolicyTable::default(),
        }
    }
}

impl CacheConfig {
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_policies(mut self, policies: DomainPolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// The configured directory, or the default one under the OS temp dir.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_CACHE_FOLDER))
    }
}
