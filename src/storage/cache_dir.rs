use std::path::PathBuf;

/// Environment variable overriding the cache directory
pub const CACHE_DIR_ENV: &str = "MEMO_REPLAY_CACHE_DIR";

/// Get default cache directory following platform conventions
///
/// - Linux/Unix: $XDG_CACHE_HOME/memo-replay or ~/.cache/memo-replay
/// - macOS: ~/Library/Caches/memo-replay
/// - Windows: %LOCALAPPDATA%/memo-replay
pub fn default_cache_dir() -> PathBuf {
    if let Some(cache_dir) = dirs::cache_dir() {
        cache_dir.join("memo-replay")
    } else {
        PathBuf::from(".memo-replay/cache")
    }
}

/// Resolve the cache directory, honouring [`CACHE_DIR_ENV`]
pub fn resolve_cache_dir() -> PathBuf {
    match std::env::var(CACHE_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default_cache_dir(),
    }
}
