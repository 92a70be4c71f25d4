use super::wrapper::InMemoryCacheStorageWrapper;
use super::{
    CacheStorage, CacheStorageContext, CacheStorageManager, PersistMode, StorageError,
};
use crate::logging::{operations, services, status};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn};

/// Extension of cache entry files
pub const CACHED_FILE_EXTENSION: &str = "memo";

/// Disk tier for a single cached function
///
/// Layout:
/// - `<cache_dir>/<function_key>-<value_key>.memo` - one file per value key
///
/// Writes go to a temp file in the same directory and are renamed into place,
/// so readers never observe a half-written entry. When `persist` is not
/// [`PersistMode::Disk`] every read misses and writes are skipped.
#[derive(Debug, Clone)]
pub struct LocalDiskCacheStorage {
    function_key: String,
    cache_dir: PathBuf,
    persist: PersistMode,
}

impl LocalDiskCacheStorage {
    pub fn new<P: AsRef<Path>>(cache_dir: P, context: &CacheStorageContext) -> Self {
        Self {
            function_key: context.function_key.clone(),
            cache_dir: cache_dir.as_ref().to_path_buf(),
            persist: context.persist,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn cache_file_path(&self, value_key: &str) -> PathBuf {
        self.cache_dir.join(format!(
            "{}-{}.{}",
            self.function_key, value_key, CACHED_FILE_EXTENSION
        ))
    }

    fn is_own_cache_file(&self, file_name: &str) -> bool {
        file_name.starts_with(&format!("{}-", self.function_key))
            && file_name.ends_with(&format!(".{}", CACHED_FILE_EXTENSION))
    }

    fn write_atomically(&self, path: &Path, value: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.cache_dir)?;

        // PID + thread ID keeps concurrent writers of the same key apart
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self.cache_dir.join(format!(
            "{}.tmp.{}.{:?}",
            file_name,
            std::process::id(),
            thread::current().id()
        ));

        let result = (|| {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&temp_path, path)?;

            // A short write would leave an unreadable entry behind
            let written = fs::metadata(path)?.len();
            if written != value.len() as u64 {
                return Err(io::Error::other(format!(
                    "expected {} bytes on disk, found {}",
                    value.len(),
                    written
                )));
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
            let _ = fs::remove_file(path);
        }
        result
    }
}

impl CacheStorage for LocalDiskCacheStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if self.persist != PersistMode::Disk {
            return Err(StorageError::KeyNotFound {
                tier: "disk",
                key: key.to_string(),
            });
        }

        let path = self.cache_file_path(key);
        match fs::read(&path) {
            Ok(value) => {
                debug!(
                    service = services::DISK_TIER,
                    operation = operations::GET,
                    status = status::HIT,
                    key = %key,
                    size_bytes = value.len(),
                    path = %path.display(),
                    "disk tier hit"
                );
                Ok(value)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::KeyNotFound {
                tier: "disk",
                key: key.to_string(),
            }),
            Err(source) => {
                error!(
                    service = services::DISK_TIER,
                    operation = operations::GET,
                    status = status::ERROR,
                    path = %path.display(),
                    error = %source,
                    "failed to read cache file"
                );
                Err(StorageError::Read { path, source })
            }
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.persist != PersistMode::Disk {
            return Ok(());
        }

        let path = self.cache_file_path(key);
        match self.write_atomically(&path, value) {
            Ok(()) => {
                debug!(
                    service = services::DISK_TIER,
                    operation = operations::SET,
                    status = status::SUCCESS,
                    key = %key,
                    size_bytes = value.len(),
                    "wrote cache file"
                );
                Ok(())
            }
            Err(source) => {
                error!(
                    service = services::DISK_TIER,
                    operation = operations::SET,
                    status = status::ERROR,
                    path = %path.display(),
                    error = %source,
                    "failed to write cache file"
                );
                Err(StorageError::Write { path, source })
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.persist != PersistMode::Disk {
            return Ok(());
        }

        let path = self.cache_file_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                // A stale file only costs a recompute later
                warn!(
                    service = services::DISK_TIER,
                    operation = operations::DELETE,
                    status = status::ERROR,
                    path = %path.display(),
                    error = %e,
                    "unable to remove cache file"
                );
                Ok(())
            }
        }
    }

    fn clear(&self) -> Result<(), StorageError> {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0usize;
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            if self.is_own_cache_file(&file_name.to_string_lossy()) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        debug!(
            service = services::DISK_TIER,
            operation = operations::CLEAR,
            function_key = %self.function_key,
            removed,
            "cleared cache files"
        );
        Ok(())
    }

    fn get_stats(&self) -> Vec<usize> {
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| self.is_own_cache_file(&entry.file_name().to_string_lossy()))
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len() as usize)
            .collect()
    }
}

/// Storage manager backed by a directory on local disk
///
/// Every function gets a memory tier in front of its disk tier, see
/// [`InMemoryCacheStorageWrapper`].
#[derive(Debug, Clone)]
pub struct LocalDiskCacheStorageManager {
    cache_dir: PathBuf,
}

impl LocalDiskCacheStorageManager {
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl Default for LocalDiskCacheStorageManager {
    fn default() -> Self {
        Self::new(super::cache_dir::resolve_cache_dir())
    }
}

impl CacheStorageManager for LocalDiskCacheStorageManager {
    fn create(&self, context: &CacheStorageContext) -> Result<Arc<dyn CacheStorage>, StorageError> {
        let disk = LocalDiskCacheStorage::new(&self.cache_dir, context);
        Ok(Arc::new(InMemoryCacheStorageWrapper::new(
            Box::new(disk),
            context,
        )))
    }

    fn clear_all(&self) -> Result<(), StorageError> {
        match fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn check_context(&self, context: &CacheStorageContext) -> Result<(), StorageError> {
        if context.persist == PersistMode::Disk {
            if let Some(ttl) = context.ttl {
                warn!(
                    service = services::DISK_TIER,
                    function = %context.function_display_name,
                    ttl_secs = ttl.as_secs(),
                    "cached function persists to disk and has a TTL; files stay on disk \
                     until the entry is read after expiry or the cache is cleared"
                );
            }
        }
        Ok(())
    }
}
