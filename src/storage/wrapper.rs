//! Memory tier in front of a slower storage tier

use super::memory::MemoryCacheStorage;
use super::{CacheStorage, CacheStorageContext, PersistMode, StorageError};
use crate::logging::{operations, services, status};
use tracing::debug;

/// Read-through, write-through wrapper
///
/// Reads try memory first and promote persisted hits into memory. Writes land in
/// memory before the persistent tier, so a failed persistent write still leaves
/// the value available to the current process.
pub struct InMemoryCacheStorageWrapper {
    function_key: String,
    persist: PersistMode,
    memory: MemoryCacheStorage,
    persist_storage: Box<dyn CacheStorage>,
}

impl InMemoryCacheStorageWrapper {
    pub fn new(persist_storage: Box<dyn CacheStorage>, context: &CacheStorageContext) -> Self {
        Self {
            function_key: context.function_key.clone(),
            persist: context.persist,
            memory: MemoryCacheStorage::new(context),
            persist_storage,
        }
    }

    fn persists(&self) -> bool {
        self.persist == PersistMode::Disk
    }
}

impl CacheStorage for InMemoryCacheStorageWrapper {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match self.memory.get(key) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if !self.persists() {
            return Err(StorageError::KeyNotFound {
                tier: "memory",
                key: key.to_string(),
            });
        }

        let value = self.persist_storage.get(key)?;
        debug!(
            service = services::MEMORY_TIER,
            operation = operations::GET,
            status = status::PROMOTED,
            function_key = %self.function_key,
            key = %key,
            "promoted persisted entry into memory"
        );
        self.memory.set(key, &value)?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.memory.set(key, value)?;
        if self.persists() {
            self.persist_storage.set(key, value)?;
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.memory.delete(key)?;
        if self.persists() {
            self.persist_storage.delete(key)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.memory.clear()?;
        self.persist_storage.clear()
    }

    fn get_stats(&self) -> Vec<usize> {
        self.memory.get_stats()
    }

    fn close(&self) {
        self.persist_storage.close();
    }
}
