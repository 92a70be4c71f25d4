use crate::cache::{CacheDataApi, CacheOptions, ShowSpinner};
use crate::storage::cache_dir::{default_cache_dir, CACHE_DIR_ENV};
use crate::storage::{LocalDiskCacheStorageManager, PersistMode};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Runtime configuration (loaded from TOML file)
///
/// ```toml
/// [cache]
/// dir = "/var/cache/memo-replay"
/// persist = "disk"
/// default_ttl = "1h"
/// default_max_entries = 500
/// show_spinner = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub cache: CacheSettings,
}

/// Defaults applied to every cached function
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSettings {
    /// Directory holding persisted entries
    #[serde(default = "default_dir")]
    pub dir: String,

    /// "disk" or "none"
    #[serde(default)]
    pub persist: PersistMode,

    /// TTL such as "30s", "15m", "24h", "7d"
    #[serde(default)]
    pub default_ttl: Option<String>,

    #[serde(default)]
    pub default_max_entries: Option<usize>,

    #[serde(default = "default_true")]
    pub show_spinner: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            persist: PersistMode::None,
            default_ttl: None,
            default_max_entries: None,
            show_spinner: true,
        }
    }
}

fn default_dir() -> String {
    default_cache_dir().to_string_lossy().into_owned()
}

fn default_true() -> bool {
    true
}

impl RuntimeConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(content).context("Invalid TOML")?;
        Ok(config)
    }

    /// Apply `MEMO_REPLAY_CACHE_DIR`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            if !dir.trim().is_empty() {
                debug!(dir = %dir, "cache directory overridden from environment");
                self.cache.dir = dir;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.dir.trim().is_empty() {
            anyhow::bail!("cache.dir must be set");
        }

        if let Some(ttl) = &self.cache.default_ttl {
            parse_ttl(ttl).with_context(|| format!("cache.default_ttl is invalid: {}", ttl))?;
        }

        if self.cache.default_max_entries == Some(0) {
            anyhow::bail!("cache.default_max_entries must be at least 1");
        }

        Ok(())
    }

    pub fn storage_manager(&self) -> LocalDiskCacheStorageManager {
        LocalDiskCacheStorageManager::new(&self.cache.dir)
    }

    /// Validated cache API backed by the configured directory
    pub fn cache_api(&self) -> Result<CacheDataApi> {
        self.validate()?;
        Ok(CacheDataApi::new(Arc::new(self.storage_manager())))
    }

    /// Configuration as TOML, for writing a starter file
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

impl CacheOptions {
    /// Options carrying the configured defaults
    pub fn from_settings(settings: &CacheSettings) -> Result<Self> {
        let ttl = settings
            .default_ttl
            .as_deref()
            .map(parse_ttl)
            .transpose()?;

        Ok(Self {
            ttl,
            max_entries: settings.default_max_entries,
            persist: settings.persist,
            show_spinner: if settings.show_spinner {
                ShowSpinner::Default
            } else {
                ShowSpinner::Hidden
            },
            allow_widgets: false,
        })
    }
}

/// Parse TTL string (e.g., "7d", "24h", "30m", "45s", "500ms") into a duration
pub fn parse_ttl(ttl_str: &str) -> Result<Duration> {
    let ttl_str = ttl_str.trim().to_lowercase();

    if let Some(num) = ttl_str.strip_suffix("ms") {
        let num: u64 = num.trim().parse().context("Invalid TTL number")?;
        return Ok(Duration::from_millis(num));
    }

    let (num, unit_secs) = if let Some(num) = ttl_str.strip_suffix('d') {
        (num, 24 * 60 * 60)
    } else if let Some(num) = ttl_str.strip_suffix('h') {
        (num, 60 * 60)
    } else if let Some(num) = ttl_str.strip_suffix('m') {
        (num, 60)
    } else if let Some(num) = ttl_str.strip_suffix('s') {
        (num, 1)
    } else {
        // Assume seconds
        let num: u64 = ttl_str.parse().context("Invalid TTL format")?;
        return Ok(Duration::from_secs(num));
    };

    let num: u64 = num.trim().parse().context("Invalid TTL number")?;
    let secs = num
        .checked_mul(unit_secs)
        .ok_or_else(|| anyhow!("TTL too large: {}", ttl_str))?;
    Ok(Duration::from_secs(secs))
}
