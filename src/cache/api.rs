use super::DataCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};
use crate::hashing::{make_function_key, make_value_key, CallArgs, FuncIdentity};
use crate::logging::{operations, services, status};
use crate::replay::{replay_cached_messages, CachedResult};
use crate::runtime::{RunContext, SpinnerGuard};
use crate::stats::{CacheStat, CacheStatsProvider};
use crate::storage::{
    CacheStorageContext, CacheStorageManager, MemoryCacheStorageManager, PersistMode,
    StorageError,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Spinner shown while a cached function computes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShowSpinner {
    Hidden,
    /// ``Running `name(...)`.``
    #[default]
    Default,
    Text(String),
}

/// Parameters of a cached function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Entries older than this are treated as absent
    pub ttl: Option<Duration>,
    /// Upper bound on stored value keys, oldest writes evicted first
    pub max_entries: Option<usize>,
    pub persist: PersistMode,
    pub show_spinner: ShowSpinner,
    /// Allow widgets inside the function and key results by their values
    pub allow_widgets: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            max_entries: None,
            persist: PersistMode::None,
            show_spinner: ShowSpinner::Default,
            allow_widgets: false,
        }
    }
}

impl CacheOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn persist(mut self, persist: PersistMode) -> Self {
        self.persist = persist;
        self
    }

    pub fn show_spinner(mut self, show_spinner: ShowSpinner) -> Self {
        self.show_spinner = show_spinner;
        self
    }

    pub fn allow_widgets(mut self, allow_widgets: bool) -> Self {
        self.allow_widgets = allow_widgets;
        self
    }

    pub fn storage_context(&self, function_key: &str, display_name: &str) -> CacheStorageContext {
        CacheStorageContext {
            function_key: function_key.to_string(),
            function_display_name: display_name.to_string(),
            ttl: self.ttl,
            max_entries: self.max_entries,
            persist: self.persist,
        }
    }
}

/// Registry of the [`DataCache`] of every cached function
///
/// Caches are created on first use and replaced when a function is
/// re-declared with different parameters.
pub struct DataCaches {
    storage_manager: Arc<dyn CacheStorageManager>,
    clock: Arc<dyn Clock>,
    caches: Mutex<HashMap<String, Arc<DataCache>>>,
}

impl DataCaches {
    pub fn new(storage_manager: Arc<dyn CacheStorageManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage_manager,
            clock,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Cache for `function_key`, created or replaced if its parameters changed
    pub fn get_cache(
        &self,
        function_key: &str,
        display_name: &str,
        options: &CacheOptions,
    ) -> Result<Arc<DataCache>> {
        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(function_key) {
            if cache.matches_options(options) {
                return Ok(cache.clone());
            }
        }

        info!(
            service = services::REGISTRY,
            function = %display_name,
            function_key = %function_key,
            ttl_secs = options.ttl.map(|ttl| ttl.as_secs()),
            max_entries = options.max_entries,
            persist = ?options.persist,
            "creating function cache"
        );

        let context = options.storage_context(function_key, display_name);
        let storage = self
            .storage_manager
            .create(&context)
            .map_err(|e| CacheError::storage(display_name, e))?;
        let cache = Arc::new(DataCache::new(
            function_key,
            display_name,
            options,
            storage,
            self.clock.clone(),
        ));
        caches.insert(function_key.to_string(), cache.clone());
        Ok(cache)
    }

    /// Reject parameters that can never work, before any storage exists
    pub fn validate_cache_params(&self, display_name: &str, options: &CacheOptions) -> Result<()> {
        if options.max_entries == Some(0) {
            return Err(CacheError::InvalidParams {
                func_name: display_name.to_string(),
                reason: "max_entries must be at least 1".to_string(),
            });
        }

        let context = options.storage_context("", display_name);
        self.storage_manager
            .check_context(&context)
            .map_err(|e| match e {
                StorageError::InvalidContext(reason) => CacheError::InvalidParams {
                    func_name: display_name.to_string(),
                    reason,
                },
                other => CacheError::storage(display_name, other),
            })
    }

    /// Clear every cache, falling back to one-by-one when the storage manager
    /// has no bulk path
    pub fn clear_all(&self) -> Result<()> {
        // Storage I/O runs without the registry lock held
        let snapshot: Vec<(String, Arc<DataCache>)> = self
            .caches
            .lock()
            .iter()
            .map(|(key, cache)| (key.clone(), cache.clone()))
            .collect();

        match self.storage_manager.clear_all() {
            Ok(()) => {}
            Err(StorageError::ClearAllUnsupported) => {
                for (_, cache) in &snapshot {
                    cache.clear()?;
                }
            }
            Err(e) => return Err(CacheError::storage("all cached functions", e)),
        }

        // Caches re-declared meanwhile stay registered
        let mut caches = self.caches.lock();
        for (key, cleared) in &snapshot {
            if caches.get(key).is_some_and(|cache| Arc::ptr_eq(cache, cleared)) {
                caches.remove(key);
            }
        }
        drop(caches);

        info!(
            service = services::REGISTRY,
            operation = operations::CLEAR,
            cache_count = snapshot.len(),
            "cleared all function caches"
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.caches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.lock().is_empty()
    }
}

impl CacheStatsProvider for DataCaches {
    fn get_stats(&self) -> Vec<CacheStat> {
        let caches: Vec<Arc<DataCache>> = self.caches.lock().values().cloned().collect();
        caches.iter().flat_map(|cache| cache.get_stats()).collect()
    }
}

/// Entry point for declaring cached functions
///
/// ```rust
/// use memo_replay::{CacheDataApi, CacheOptions, CallArgs, FuncIdentity};
///
/// let api = CacheDataApi::in_memory();
/// let double = api
///     .cache(FuncIdentity::new("demo", "double"), CacheOptions::default())
///     .unwrap();
///
/// let n = 21;
/// let value: i64 = double.call(None, &CallArgs::new().arg("n", &n), || n * 2).unwrap();
/// assert_eq!(value, 42);
/// ```
#[derive(Clone)]
pub struct CacheDataApi {
    caches: Arc<DataCaches>,
}

impl CacheDataApi {
    pub fn new(storage_manager: Arc<dyn CacheStorageManager>) -> Self {
        Self::with_clock(storage_manager, Arc::new(SystemClock))
    }

    pub fn with_clock(storage_manager: Arc<dyn CacheStorageManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            caches: Arc::new(DataCaches::new(storage_manager, clock)),
        }
    }

    /// Memory-only caching
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStorageManager))
    }

    /// Declare a cached function
    pub fn cache(&self, identity: FuncIdentity, options: CacheOptions) -> Result<CachedFunc> {
        self.caches
            .validate_cache_params(&identity.display_name(), &options)?;

        Ok(CachedFunc {
            identity,
            options,
            caches: self.caches.clone(),
            function_key: OnceLock::new(),
        })
    }

    /// Clear every cached function
    pub fn clear(&self) -> Result<()> {
        self.caches.clear_all()
    }

    pub fn stats(&self) -> Vec<CacheStat> {
        self.caches.get_stats()
    }

    pub fn caches(&self) -> &Arc<DataCaches> {
        &self.caches
    }
}

/// A function whose results are cached and whose UI output is replayed
pub struct CachedFunc {
    identity: FuncIdentity,
    options: CacheOptions,
    caches: Arc<DataCaches>,
    function_key: OnceLock<String>,
}

impl CachedFunc {
    pub fn identity(&self) -> &FuncIdentity {
        &self.identity
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Computed on first use and reused afterwards
    pub fn function_key(&self) -> Result<&str> {
        if let Some(key) = self.function_key.get() {
            return Ok(key);
        }
        let key = make_function_key(&self.identity)?;
        Ok(self.function_key.get_or_init(|| key))
    }

    /// Return the cached value for `args`, or compute it with `func`
    ///
    /// On a hit the messages recorded when the value was computed are replayed
    /// into `ctx`. Without a run context the call is plain memoization.
    pub fn call<V, F>(&self, ctx: Option<&dyn RunContext>, args: &CallArgs, func: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> V,
    {
        self.try_call(ctx, args, || Ok::<V, CacheError>(func()))
    }

    /// Like [`call`](Self::call) for fallible bodies
    ///
    /// An error from `func` is returned unchanged and nothing is cached.
    pub fn try_call<V, E, F>(
        &self,
        ctx: Option<&dyn RunContext>,
        args: &CallArgs,
        func: F,
    ) -> std::result::Result<V, E>
    where
        V: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> std::result::Result<V, E>,
    {
        let cache = self.data_cache()?;
        let value_key =
            make_value_key(self.identity.qualname(), args).map_err(CacheError::from)?;

        if let Some(result) = self.lookup(&cache, &value_key, ctx)? {
            return Ok(self.handle_cache_hit(result, ctx)?);
        }
        self.handle_cache_miss(&cache, &value_key, args, ctx, func)
    }

    /// Clear this function's entries
    pub fn clear(&self) -> Result<()> {
        self.data_cache()?.clear()
    }

    fn data_cache(&self) -> Result<Arc<DataCache>> {
        let function_key = self.function_key()?;
        self.caches
            .get_cache(function_key, &self.identity.display_name(), &self.options)
    }

    fn lookup<V: DeserializeOwned>(
        &self,
        cache: &DataCache,
        value_key: &str,
        ctx: Option<&dyn RunContext>,
    ) -> Result<Option<CachedResult<V>>> {
        match cache.read_result(value_key, ctx) {
            Ok(result) => Ok(Some(result)),
            Err(CacheError::KeyNotFound(_)) => {
                debug!(
                    service = services::DECORATOR,
                    operation = operations::CALL,
                    status = status::MISS,
                    function = %cache.display_name(),
                    key = %value_key,
                    "cache miss"
                );
                Ok(None)
            }
            Err(CacheError::Corrupt { reason, .. }) => {
                warn!(
                    service = services::DECORATOR,
                    operation = operations::CALL,
                    status = status::CORRUPT,
                    function = %cache.display_name(),
                    key = %value_key,
                    reason = %reason,
                    "unreadable cache entry, recomputing"
                );
                cache.remove_entry(value_key);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_cache_hit<V>(&self, result: CachedResult<V>, ctx: Option<&dyn RunContext>) -> Result<V> {
        if let Some(ctx) = ctx {
            replay_cached_messages(&result, ctx, self.identity.qualname())?;
        }
        Ok(result.value)
    }

    fn handle_cache_miss<V, E, F>(
        &self,
        cache: &DataCache,
        value_key: &str,
        args: &CallArgs,
        ctx: Option<&dyn RunContext>,
        func: F,
    ) -> std::result::Result<V, E>
    where
        V: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> std::result::Result<V, E>,
    {
        let lock = cache.compute_value_lock(value_key);
        let _computing = lock.lock();

        // Another caller may have stored the value while we waited
        if let Some(result) = self.lookup(cache, value_key, ctx)? {
            return Ok(self.handle_cache_hit(result, ctx)?);
        }

        let _spinner = ctx
            .zip(self.spinner_message(args))
            .map(|(ctx, message)| SpinnerGuard::start(ctx, &message));

        let (value, messages) = match ctx {
            Some(ctx) => {
                let recording = ctx
                    .replay_context()
                    .calling_cached_function(self.identity.qualname(), self.options.allow_widgets);
                let value = func()?;
                (value, recording.finish())
            }
            None => (func()?, Vec::new()),
        };

        cache.write_result(value_key, &value, messages, ctx)?;
        Ok(value)
    }

    fn spinner_message(&self, args: &CallArgs) -> Option<String> {
        match &self.options.show_spinner {
            ShowSpinner::Hidden => None,
            ShowSpinner::Text(text) => Some(text.clone()),
            ShowSpinner::Default => {
                let params = if args.is_empty() { "" } else { "..." };
                Some(format!("Running `{}({})`.", self.identity.name(), params))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CacheStorage, MemoryCacheStorage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    fn identity(name: &str) -> FuncIdentity {
        FuncIdentity::new("tests", name)
    }

    #[test]
    fn test_call_memoizes() {
        let api = CacheDataApi::in_memory();
        let square = api.cache(identity("square"), CacheOptions::default()).unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: i64 = square
                .call(None, &CallArgs::new().arg("n", &4), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    16
                })
                .unwrap();
            assert_eq!(value, 16);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_call_errors_are_not_cached() {
        #[derive(Debug)]
        enum AppError {
            Flaky,
            Cache(CacheError),
        }
        impl From<CacheError> for AppError {
            fn from(e: CacheError) -> Self {
                AppError::Cache(e)
            }
        }

        let api = CacheDataApi::in_memory();
        let fetch = api.cache(identity("fetch"), CacheOptions::default()).unwrap();
        let args = CallArgs::new().arg("url", "https://example.com");

        let first: std::result::Result<String, AppError> =
            fetch.try_call(None, &args, || Err(AppError::Flaky));
        assert!(matches!(first, Err(AppError::Flaky)));

        let second: std::result::Result<String, AppError> =
            fetch.try_call(None, &args, || Ok("body".to_string()));
        assert_eq!(second.unwrap(), "body");

        let third: std::result::Result<String, AppError> =
            fetch.try_call(None, &args, || Err(AppError::Flaky));
        assert_eq!(third.unwrap(), "body");
    }

    #[test]
    fn test_zero_max_entries_rejected() {
        let api = CacheDataApi::in_memory();
        let err = api
            .cache(identity("bad"), CacheOptions::default().max_entries(0))
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::InvalidParams { .. }));
    }

    #[test]
    fn test_unhashable_argument_propagates() {
        struct Handle;
        impl Serialize for Handle {
            fn serialize<S: serde::Serializer>(&self, _s: S) -> std::result::Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("handle"))
            }
        }

        let api = CacheDataApi::in_memory();
        let load = api.cache(identity("load"), CacheOptions::default()).unwrap();
        let err = load
            .call(None, &CallArgs::new().arg("conn", &Handle), || 1u8)
            .unwrap_err();
        assert!(matches!(err, CacheError::UnhashableParam(ref e) if e.arg_name == "conn"));

        let ok: u8 = load
            .call(None, &CallArgs::new().arg("_conn", &Handle), || 1u8)
            .unwrap();
        assert_eq!(ok, 1);
    }

    #[test]
    fn test_registry_reuses_cache_only_for_same_params() {
        let api = CacheDataApi::in_memory();
        let caches = api.caches();
        let options = CacheOptions::default();

        let first = caches.get_cache("fk", "f", &options).unwrap();
        let again = caches.get_cache("fk", "f", &options).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let changed = caches
            .get_cache("fk", "f", &options.clone().ttl(Duration::from_secs(1)))
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &changed));
        assert_eq!(caches.len(), 1);
    }

    #[test]
    fn test_clear_all_falls_back_to_each_cache() {
        let api = CacheDataApi::in_memory();
        let f = api.cache(identity("f"), CacheOptions::default()).unwrap();
        let calls = AtomicUsize::new(0);
        let run = || {
            f.call(None, &CallArgs::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                "v".to_string()
            })
            .unwrap()
        };

        run();
        api.clear().unwrap();
        assert!(api.caches().is_empty());
        run();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Storage that looks at the registry while it is being cleared
    struct RegistryAwareStorage {
        inner: MemoryCacheStorage,
        registry: Arc<OnceLock<Weak<DataCaches>>>,
        seen_during_clear: Arc<AtomicUsize>,
    }

    impl CacheStorage for RegistryAwareStorage {
        fn get(&self, key: &str) -> std::result::Result<Vec<u8>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> std::result::Result<(), StorageError> {
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> std::result::Result<(), StorageError> {
            self.inner.delete(key)
        }

        fn clear(&self) -> std::result::Result<(), StorageError> {
            if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
                self.seen_during_clear
                    .store(registry.len(), Ordering::SeqCst);
                let _ = registry.get_stats();
            }
            self.inner.clear()
        }

        fn get_stats(&self) -> Vec<usize> {
            self.inner.get_stats()
        }
    }

    struct RegistryAwareManager {
        registry: Arc<OnceLock<Weak<DataCaches>>>,
        seen_during_clear: Arc<AtomicUsize>,
    }

    impl CacheStorageManager for RegistryAwareManager {
        fn create(
            &self,
            context: &CacheStorageContext,
        ) -> std::result::Result<Arc<dyn CacheStorage>, StorageError> {
            Ok(Arc::new(RegistryAwareStorage {
                inner: MemoryCacheStorage::new(context),
                registry: self.registry.clone(),
                seen_during_clear: self.seen_during_clear.clone(),
            }))
        }
    }

    #[test]
    fn test_clear_all_releases_registry_during_storage_io() {
        let registry = Arc::new(OnceLock::new());
        let seen_during_clear = Arc::new(AtomicUsize::new(0));
        let api = CacheDataApi::new(Arc::new(RegistryAwareManager {
            registry: registry.clone(),
            seen_during_clear: seen_during_clear.clone(),
        }));
        registry.set(Arc::downgrade(api.caches())).unwrap();

        let f = api.cache(identity("f"), CacheOptions::default()).unwrap();
        let g = api.cache(identity("g"), CacheOptions::default()).unwrap();
        let _: u8 = f.call(None, &CallArgs::new(), || 1).unwrap();
        let _: u8 = g.call(None, &CallArgs::new(), || 2).unwrap();

        api.clear().unwrap();
        assert_eq!(seen_during_clear.load(Ordering::SeqCst), 2);
        assert!(api.caches().is_empty());
    }

    #[test]
    fn test_spinner_messages() {
        let api = CacheDataApi::in_memory();
        let default = api.cache(identity("load_rows"), CacheOptions::default()).unwrap();
        assert_eq!(
            default.spinner_message(&CallArgs::new()).as_deref(),
            Some("Running `load_rows()`.")
        );
        assert_eq!(
            default.spinner_message(&CallArgs::new().arg("n", &1)).as_deref(),
            Some("Running `load_rows(...)`.")
        );

        let hidden = api
            .cache(
                identity("quiet"),
                CacheOptions::default().show_spinner(ShowSpinner::Hidden),
            )
            .unwrap();
        assert!(hidden.spinner_message(&CallArgs::new()).is_none());

        let custom = api
            .cache(
                identity("custom"),
                CacheOptions::default().show_spinner(ShowSpinner::Text("Loading...".into())),
            )
            .unwrap();
        assert_eq!(
            custom.spinner_message(&CallArgs::new()).as_deref(),
            Some("Loading...")
        );
    }

    #[test]
    fn test_function_key_is_memoized() {
        let api = CacheDataApi::in_memory();
        let f = api.cache(identity("f"), CacheOptions::default()).unwrap();
        let first = f.function_key().unwrap().to_string();
        assert_eq!(f.function_key().unwrap(), first);
        assert_eq!(first.len(), 32);
    }
}
