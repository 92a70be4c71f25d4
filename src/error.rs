//! Errors surfaced by cached functions
//!
//! Storage tiers report [`StorageError`](crate::storage::StorageError); everything the
//! cache layer hands back to a caller is a [`CacheError`].

use crate::storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry for the key, or the entry expired. Callers treat this as a miss.
    #[error("cache key not found: {0}")]
    KeyNotFound(String),

    #[error("failed to read cached value {key} for `{func_name}`: {reason}")]
    Corrupt {
        func_name: String,
        key: String,
        reason: String,
    },

    #[error(
        "cannot serialize the return value of `{func_name}`: {reason}\n\n\
         Values returned from a cached function are stored in serialized form, \
         so the return type must implement `Serialize` and `Deserialize` without failing."
    )]
    UnserializableReturnValue { func_name: String, reason: String },

    #[error(transparent)]
    UnhashableParam(#[from] HashingError),

    #[error(
        "while replaying output of cached function `{func_name}`, the element or block \
         `{destination_id}` it wrote into no longer exists.\n\n\
         This happens when a cached function writes into a container that was created \
         outside of it. Create the container inside the cached function, or move the \
         output out of it."
    )]
    ReplayClosure {
        func_name: String,
        destination_id: String,
    },

    #[error("cache storage failed for `{func_name}`")]
    Storage {
        func_name: String,
        #[source]
        source: StorageError,
    },

    #[error(
        "widget `{widget}` was created inside cached function `{func_name}`, which does \
         not allow widgets. Enable `allow_widgets` on the cache options, or move the \
         widget outside the cached function."
    )]
    WidgetInCachedFunction { func_name: String, widget: String },

    #[error("invalid cache parameters for `{func_name}`: {reason}")]
    InvalidParams { func_name: String, reason: String },
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::KeyNotFound(_))
    }

    pub(crate) fn storage(func_name: &str, source: StorageError) -> Self {
        match source {
            StorageError::KeyNotFound { key, .. } => CacheError::KeyNotFound(key),
            source => CacheError::Storage {
                func_name: func_name.to_string(),
                source,
            },
        }
    }
}

/// An argument (or captured value) that could not be turned into hash input
#[derive(Debug, Clone, Error)]
#[error(
    "Cannot hash argument '{arg_name}' (of type `{type_name}`) in '{func_name}': {reason}\n\n\
     To stop the cache from hashing this argument, prefix its name with an underscore, \
     for example `_{arg_name}`."
)]
pub struct HashingError {
    pub func_name: String,
    pub arg_name: String,
    pub type_name: String,
    pub reason: String,
}
