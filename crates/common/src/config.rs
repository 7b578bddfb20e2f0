use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Top-level flowgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Rate limiter behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Master switch. When false every admission call is granted.
    #[serde(default)]
    pub enabled: bool,
    /// Ring length in seconds. Changing this rebuilds every limiter.
    #[serde(default = "default_window_size")]
    pub window_size: u64,
    /// Resource keys that get verbose per-slot logging.
    #[serde(default)]
    pub log_resource_keys: HashSet<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_size: default_window_size(),
            log_resource_keys: HashSet::new(),
        }
    }
}

/// Coordination store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            pool_size: default_pool_size(),
        }
    }
}

/// The runtime-visible slice of [`LimiterConfig`].
///
/// The admission path reads this on every call through an `ArcSwap`, so a
/// config reload publishes a fresh snapshot instead of mutating in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterSettings {
    pub enabled: bool,
    pub window_size: u64,
    pub log_resource_keys: HashSet<String>,
}

impl From<&LimiterConfig> for LimiterSettings {
    fn from(config: &LimiterConfig) -> Self {
        Self {
            enabled: config.enabled,
            window_size: config.window_size,
            log_resource_keys: config.log_resource_keys.clone(),
        }
    }
}

// Default value helpers
fn default_window_size() -> u64 {
    30
}
fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_pool_size() -> usize {
    4
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        // Two slots are reserved for the upload/download offsets, so anything
        // below 3 leaves no live slot in the ring.
        if self.limiter.window_size < 3 {
            anyhow::bail!(
                "limiter.window_size must be >= 3 (got {})",
                self.limiter.window_size
            );
        }

        if self.store.url.is_empty() {
            anyhow::bail!("store.url must not be empty");
        }

        if self.store.pool_size == 0 {
            anyhow::bail!("store.pool_size must be at least 1");
        }

        Ok(())
    }
}
