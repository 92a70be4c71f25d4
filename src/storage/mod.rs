pub mod cache_dir;
pub mod filesystem;
pub mod memory;
pub mod wrapper;

pub use filesystem::{LocalDiskCacheStorage, LocalDiskCacheStorageManager};
pub use memory::{MemoryCacheStorage, MemoryCacheStorageManager};
pub use wrapper::InMemoryCacheStorageWrapper;

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by storage tiers
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found in {tier} storage: {key}")]
    KeyNotFound { tier: &'static str, key: String },

    #[error("unable to read cache file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to write cache file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("storage manager does not support clearing every cache at once")]
    ClearAllUnsupported,

    #[error("invalid storage context: {0}")]
    InvalidContext(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::KeyNotFound { .. })
    }
}

/// Where a function's entries live beyond the process-local memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    #[default]
    None,
    Disk,
}

impl std::str::FromStr for PersistMode {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "disk" => Ok(Self::Disk),
            other => Err(StorageError::InvalidContext(format!(
                "unsupported persist option '{}'. Must be 'disk' or 'none'",
                other
            ))),
        }
    }
}

/// Parameters a storage manager sees when creating a function's storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStorageContext {
    pub function_key: String,
    pub function_display_name: String,
    pub ttl: Option<Duration>,
    pub max_entries: Option<usize>,
    pub persist: PersistMode,
}

impl CacheStorageContext {
    pub fn new(function_key: impl Into<String>, function_display_name: impl Into<String>) -> Self {
        Self {
            function_key: function_key.into(),
            function_display_name: function_display_name.into(),
            ttl: None,
            max_entries: None,
            persist: PersistMode::None,
        }
    }
}

/// Byte storage for the entries of one cached function
///
/// Keys are value keys; values are opaque encoded envelopes.
pub trait CacheStorage: Send + Sync {
    /// Retrieve the bytes for `key`, or [`StorageError::KeyNotFound`]
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every entry of this function
    fn clear(&self) -> Result<(), StorageError>;

    /// Byte size of each stored entry
    fn get_stats(&self) -> Vec<usize>;

    /// Release resources held by the tier
    fn close(&self) {}
}

/// Factory for per-function storage
pub trait CacheStorageManager: Send + Sync {
    fn create(&self, context: &CacheStorageContext) -> Result<Arc<dyn CacheStorage>, StorageError>;

    /// Clear every cache this manager created. Managers without a bulk path return
    /// [`StorageError::ClearAllUnsupported`] and callers clear caches one by one.
    fn clear_all(&self) -> Result<(), StorageError> {
        Err(StorageError::ClearAllUnsupported)
    }

    /// Validate a context before any storage is created for it
    fn check_context(&self, _context: &CacheStorageContext) -> Result<(), StorageError> {
        Ok(())
    }
}
