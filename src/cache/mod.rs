//! Per-function cache entries
//!
//! A [`DataCache`] owns the storage of one cached function. Each value key maps
//! to a [`MultiCacheResults`] envelope: the ids of the widgets the function
//! created, plus one [`CachedResult`] per combination of those widgets' values.
//!
//! ## Entry lifecycle
//!
//! - **write**: the envelope is re-encoded with the new result and its write
//!   time; entries past `max_entries` are evicted oldest write first
//! - **read**: an envelope older than the TTL is deleted and reported as a miss
//! - **corrupt**: undecodable bytes surface as [`CacheError::Corrupt`]; an
//!   envelope from another format version is deleted and reported as a miss

mod api;

pub use api::{CacheDataApi, CacheOptions, CachedFunc, DataCaches, ShowSpinner};

use crate::clock::Clock;
use crate::error::{CacheError, Result};
use crate::eviction::{is_expired, EvictionStats, WriteIndex};
use crate::hashing::hash_values;
use crate::logging::{operations, services, status};
use crate::replay::{CachedResult, MsgData};
use crate::runtime::RunContext;
use crate::stats::CacheStat;
use crate::storage::{CacheStorage, PersistMode};
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Format version of [`MultiCacheResults`]
pub const ENVELOPE_VERSION: u32 = 1;

/// Category reported by [`DataCache::get_stats`]
pub const STATS_CATEGORY: &str = "cache_data";

/// Stored form of one value key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiCacheResults {
    pub version: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub written_at: DateTime<Utc>,
    /// Widgets created by the function across all stored results
    pub widget_ids: BTreeSet<String>,
    /// Results by widget key, values bincode-encoded
    pub results: BTreeMap<String, CachedResult<Vec<u8>>>,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    version: u32,
}

impl MultiCacheResults {
    pub fn new(written_at: DateTime<Utc>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            written_at,
            widget_ids: BTreeSet::new(),
            results: BTreeMap::new(),
        }
    }

    /// Hash of the current values of the recorded widgets
    ///
    /// Widgets missing from the session are left out. Without a run context,
    /// or without recorded widgets, every call maps to the same key.
    pub fn widget_key(&self, ctx: Option<&dyn RunContext>) -> String {
        let values: Vec<(&str, Value)> = match ctx {
            Some(ctx) => self
                .widget_ids
                .iter()
                .filter_map(|id| ctx.widget_value(id).map(|value| (id.as_str(), value)))
                .collect(),
            None => Vec::new(),
        };
        hash_values(values.iter().map(|(id, value)| (*id, value)))
    }

    pub fn encode(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

/// Outcome of decoding stored bytes
enum Decoded {
    Current(MultiCacheResults),
    OtherVersion(u32),
}

fn decode_envelope(bytes: &[u8]) -> std::result::Result<Decoded, bincode::Error> {
    let header: EnvelopeHeader = bincode::deserialize(bytes)?;
    if header.version != ENVELOPE_VERSION {
        return Ok(Decoded::OtherVersion(header.version));
    }
    Ok(Decoded::Current(bincode::deserialize(bytes)?))
}

/// Storage, expiry and eviction for one cached function
pub struct DataCache {
    function_key: String,
    display_name: String,
    ttl: Option<Duration>,
    max_entries: Option<usize>,
    persist: PersistMode,
    allow_widgets: bool,
    storage: Arc<dyn CacheStorage>,
    clock: Arc<dyn Clock>,
    index: Mutex<WriteIndex>,
    value_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    eviction_stats: EvictionStats,
}

impl DataCache {
    pub fn new(
        function_key: impl Into<String>,
        display_name: impl Into<String>,
        options: &CacheOptions,
        storage: Arc<dyn CacheStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            function_key: function_key.into(),
            display_name: display_name.into(),
            ttl: options.ttl,
            max_entries: options.max_entries,
            persist: options.persist,
            allow_widgets: options.allow_widgets,
            storage,
            clock,
            index: Mutex::new(WriteIndex::new(options.max_entries)),
            value_locks: Mutex::new(HashMap::new()),
            eviction_stats: EvictionStats::new(),
        }
    }

    pub fn function_key(&self) -> &str {
        &self.function_key
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    pub fn persist(&self) -> PersistMode {
        self.persist
    }

    pub fn allow_widgets(&self) -> bool {
        self.allow_widgets
    }

    pub fn eviction_stats(&self) -> &EvictionStats {
        &self.eviction_stats
    }

    /// Number of entries tracked by this process
    pub fn entry_count(&self) -> usize {
        self.index.lock().len()
    }

    /// True when this cache was created with the same parameters
    pub fn matches_options(&self, options: &CacheOptions) -> bool {
        self.ttl == options.ttl
            && self.max_entries == options.max_entries
            && self.persist == options.persist
            && self.allow_widgets == options.allow_widgets
    }

    /// Lock serializing computation of one value key
    pub fn compute_value_lock(&self, value_key: &str) -> Arc<Mutex<()>> {
        self.value_locks
            .lock()
            .entry(value_key.to_string())
            .or_default()
            .clone()
    }

    /// Read the result stored for `value_key` under the current widget values
    pub fn read_result<V: DeserializeOwned>(
        &self,
        value_key: &str,
        ctx: Option<&dyn RunContext>,
    ) -> Result<CachedResult<V>> {
        let envelope = self.read_envelope(value_key)?;
        let widget_key = envelope.widget_key(ctx);

        let Some(stored) = envelope.results.get(&widget_key) else {
            debug!(
                service = services::ENTRY_MANAGER,
                operation = operations::READ_RESULT,
                status = status::MISS,
                function = %self.display_name,
                key = %value_key,
                "no result for current widget values"
            );
            return Err(CacheError::KeyNotFound(value_key.to_string()));
        };

        let value = bincode::deserialize(&stored.value)
            .map_err(|e| self.corrupt(value_key, e.to_string()))?;

        debug!(
            service = services::ENTRY_MANAGER,
            operation = operations::READ_RESULT,
            status = status::HIT,
            function = %self.display_name,
            key = %value_key,
            size_bytes = stored.value.len(),
            message_count = stored.messages.len(),
            "cache hit"
        );

        Ok(CachedResult {
            value,
            messages: stored.messages.clone(),
            main_id: stored.main_id.clone(),
            sidebar_id: stored.sidebar_id.clone(),
        })
    }

    /// Store `value` and its messages for `value_key`
    ///
    /// Results for other widget values under the same key are kept.
    pub fn write_result<V: Serialize>(
        &self,
        value_key: &str,
        value: &V,
        messages: Vec<MsgData>,
        ctx: Option<&dyn RunContext>,
    ) -> Result<()> {
        let encoded = bincode::serialize(value).map_err(|e| self.unserializable(e))?;
        let now = self.now();

        let mut envelope = match self.read_envelope(value_key) {
            Ok(existing) => existing,
            Err(CacheError::KeyNotFound(_)) => MultiCacheResults::new(now),
            Err(CacheError::Corrupt { reason, .. }) => {
                warn!(
                    service = services::ENTRY_MANAGER,
                    operation = operations::WRITE_RESULT,
                    status = status::CORRUPT,
                    function = %self.display_name,
                    key = %value_key,
                    reason = %reason,
                    "replacing unreadable cache entry"
                );
                MultiCacheResults::new(now)
            }
            // The write below still fills the memory tier and reports its own error
            Err(CacheError::Storage { source, .. }) => {
                warn!(
                    service = services::ENTRY_MANAGER,
                    operation = operations::WRITE_RESULT,
                    status = status::ERROR,
                    function = %self.display_name,
                    key = %value_key,
                    error = %source,
                    "could not read existing cache entry, starting a new one"
                );
                MultiCacheResults::new(now)
            }
            Err(e) => return Err(e),
        };

        if self.allow_widgets {
            envelope.widget_ids.extend(
                messages
                    .iter()
                    .filter_map(MsgData::widget)
                    .map(|widget| widget.widget_id.clone()),
            );
        }

        let widget_key = envelope.widget_key(ctx);
        let (main_id, sidebar_id) = ctx
            .map(|ctx| (ctx.main().id().to_string(), ctx.sidebar().id().to_string()))
            .unwrap_or_default();
        envelope.results.insert(
            widget_key,
            CachedResult {
                value: encoded,
                messages,
                main_id,
                sidebar_id,
            },
        );
        envelope.written_at = now;

        let bytes = envelope.encode().map_err(|e| self.unserializable(e))?;

        let (evicted, expired) = {
            let mut index = self.index.lock();
            let evicted = index.record_write(value_key, now);
            let expired: Vec<String> = match self.ttl {
                Some(ttl) => index.expired(ttl, now),
                None => Vec::new(),
            };
            for key in &expired {
                index.remove(key);
            }
            (evicted, expired)
        };
        for key in evicted {
            self.eviction_stats.record_eviction();
            self.delete_from_storage(&key, "evicted oldest entry");
        }
        for key in expired {
            self.eviction_stats.record_expiration();
            self.delete_from_storage(&key, "removed expired entry");
        }

        self.storage
            .set(value_key, &bytes)
            .map_err(|e| CacheError::storage(&self.display_name, e))?;

        debug!(
            service = services::ENTRY_MANAGER,
            operation = operations::WRITE_RESULT,
            status = status::SUCCESS,
            function = %self.display_name,
            key = %value_key,
            size_bytes = bytes.len(),
            "stored cache entry"
        );
        Ok(())
    }

    /// Drop the entry for `value_key` from the index and storage
    pub fn remove_entry(&self, value_key: &str) {
        self.index.lock().remove(value_key);
        self.delete_from_storage(value_key, "removed entry");
    }

    /// Remove every entry of this function
    pub fn clear(&self) -> Result<()> {
        self.value_locks.lock().clear();
        self.index.lock().clear();
        self.storage
            .clear()
            .map_err(|e| CacheError::storage(&self.display_name, e))?;

        debug!(
            service = services::ENTRY_MANAGER,
            operation = operations::CLEAR,
            function = %self.display_name,
            "cleared cache"
        );
        Ok(())
    }

    pub fn get_stats(&self) -> Vec<CacheStat> {
        self.storage
            .get_stats()
            .into_iter()
            .map(|byte_length| CacheStat {
                category_name: STATS_CATEGORY.to_string(),
                cache_name: self.display_name.clone(),
                byte_length,
            })
            .collect()
    }

    fn read_envelope(&self, value_key: &str) -> Result<MultiCacheResults> {
        let bytes = self
            .storage
            .get(value_key)
            .map_err(|e| CacheError::storage(&self.display_name, e))?;

        let envelope = match decode_envelope(&bytes) {
            Ok(Decoded::Current(envelope)) => envelope,
            Ok(Decoded::OtherVersion(version)) => {
                warn!(
                    service = services::ENTRY_MANAGER,
                    operation = operations::READ_RESULT,
                    status = status::MISS,
                    function = %self.display_name,
                    key = %value_key,
                    version,
                    "discarding cache entry from another format version"
                );
                self.remove_entry(value_key);
                return Err(CacheError::KeyNotFound(value_key.to_string()));
            }
            Err(e) => return Err(self.corrupt(value_key, e.to_string())),
        };

        if is_expired(envelope.written_at, self.now(), self.ttl) {
            debug!(
                service = services::ENTRY_MANAGER,
                operation = operations::READ_RESULT,
                status = status::EXPIRED,
                function = %self.display_name,
                key = %value_key,
                "cache entry expired"
            );
            self.eviction_stats.record_expiration();
            self.remove_entry(value_key);
            return Err(CacheError::KeyNotFound(value_key.to_string()));
        }

        let evicted = self.index.lock().track(value_key, envelope.written_at);
        for key in evicted {
            self.eviction_stats.record_eviction();
            self.delete_from_storage(&key, "evicted oldest entry");
        }
        Ok(envelope)
    }

    fn delete_from_storage(&self, value_key: &str, reason: &'static str) {
        match self.storage.delete(value_key) {
            Ok(()) => debug!(
                service = services::ENTRY_MANAGER,
                operation = operations::EVICT,
                function = %self.display_name,
                key = %value_key,
                "{}", reason
            ),
            Err(e) => warn!(
                service = services::ENTRY_MANAGER,
                operation = operations::DELETE,
                status = status::ERROR,
                function = %self.display_name,
                key = %value_key,
                error = %e,
                "failed to delete cache entry"
            ),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        // Envelopes store milliseconds
        self.clock.now().trunc_subsecs(3)
    }

    fn corrupt(&self, value_key: &str, reason: String) -> CacheError {
        CacheError::Corrupt {
            func_name: self.display_name.clone(),
            key: value_key.to_string(),
            reason,
        }
    }

    fn unserializable(&self, error: bincode::Error) -> CacheError {
        CacheError::UnserializableReturnValue {
            func_name: self.display_name.clone(),
            reason: error.to_string(),
        }
    }
}
