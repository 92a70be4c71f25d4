//! Process-local storage tier

use super::{CacheStorage, CacheStorageContext, CacheStorageManager, StorageError};
use crate::logging::{operations, services, status};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Entries held in a hash map for the life of the process
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    function_key: String,
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCacheStorage {
    pub fn new(context: &CacheStorageContext) -> Self {
        Self {
            function_key: context.function_key.clone(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match self.entries.read().get(key) {
            Some(value) => {
                debug!(
                    service = services::MEMORY_TIER,
                    operation = operations::GET,
                    status = status::HIT,
                    function_key = %self.function_key,
                    key = %key,
                    size_bytes = value.len(),
                    "memory tier hit"
                );
                Ok(value.clone())
            }
            None => Err(StorageError::KeyNotFound {
                tier: "memory",
                key: key.to_string(),
            }),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.entries.write().clear();
        Ok(())
    }

    fn get_stats(&self) -> Vec<usize> {
        self.entries.read().values().map(Vec::len).collect()
    }
}

/// Creates a fresh [`MemoryCacheStorage`] per function. Has no bulk clear.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryCacheStorageManager;

impl CacheStorageManager for MemoryCacheStorageManager {
    fn create(&self, context: &CacheStorageContext) -> Result<Arc<dyn CacheStorage>, StorageError> {
        Ok(Arc::new(MemoryCacheStorage::new(context)))
    }
}
