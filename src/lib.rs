// Function-level result caching for reactive script runtimes
// Cached functions skip recomputation and replay the UI messages they emitted

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod eviction;
pub mod hashing;
pub mod logging;
pub mod replay;
pub mod runtime;
pub mod stats;
pub mod storage;

// Re-export commonly used types
pub use cache::{CacheDataApi, CacheOptions, CachedFunc, DataCache, DataCaches, ShowSpinner};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{parse_ttl, RuntimeConfig};
pub use error::{CacheError, HashingError};
pub use hashing::{make_function_key, make_value_key, CallArgs, FuncIdentity};
pub use replay::{replay_cached_messages, CachedResult, MessageReplayContext, MsgData};
pub use runtime::{Destination, DestinationRef, MediaStore, Payload, RunContext};
pub use stats::{CacheStat, CacheStatsProvider};
pub use storage::{
    CacheStorage, CacheStorageContext, CacheStorageManager, LocalDiskCacheStorageManager,
    MemoryCacheStorageManager, PersistMode, StorageError,
};
