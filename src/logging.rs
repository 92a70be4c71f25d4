//! Structured logging for the function cache
//!
//! All cache events use structured fields so hits, misses and evictions can be
//! filtered and aggregated.
//!
//! # Log Format Conventions
//!
//! - `service`: The component emitting the event ("cache.memory", "cache.disk", ...)
//! - `operation`: The operation being performed ("get", "read_result", "replay", ...)
//! - `status`: The outcome ("hit", "miss", "expired", "error", ...)
//! - `function`: Display name of the cached function
//! - `key`: Value key of the entry
//! - `size_bytes`: Size of the stored bytes
//!
//! # Examples
//!
//! ```rust
//! use memo_replay::logging::{operations, services, status};
//! use tracing::debug;
//!
//! let key = "9f2c";
//! debug!(
//!     service = services::ENTRY_MANAGER,
//!     operation = operations::READ_RESULT,
//!     status = status::MISS,
//!     key = %key,
//!     "cache miss"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Environment variable selecting the log format
pub const LOG_FORMAT_ENV: &str = "MEMO_REPLAY_LOG_FORMAT";

/// Formatter that tags every line with "memo" instead of the module path
struct MemoFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for MemoFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(memo)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(memo): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default for development)
    Pretty,
    /// Compact format (for CI)
    Compact,
    /// JSON format (for log aggregation systems)
    Json,
}

impl LogFormat {
    /// Parse a format name, case-insensitively
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }

    /// Format from `MEMO_REPLAY_LOG_FORMAT`, compact under CI, pretty otherwise
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|name| Self::parse(&name))
            .unwrap_or_else(|| {
                if std::env::var("CI").is_ok() {
                    Self::Compact
                } else {
                    Self::Pretty
                }
            })
    }
}

/// Install the global tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "debug", "memo_replay=trace")
/// - `MEMO_REPLAY_LOG_FORMAT`: Set format ("pretty", "compact", "json")
/// - `CI`: If set, defaults to compact format
///
/// Fails if a global subscriber is already installed.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match LogFormat::from_env() {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(io::stderr),
            )
            .try_init(),
        format => registry
            .with(
                fmt::layer()
                    .event_format(MemoFormatter {
                        with_ansi: format == LogFormat::Pretty,
                    })
                    .with_writer(io::stderr),
            )
            .try_init(),
    }
}

/// Like [`try_init`], leaving an already installed subscriber in place
pub fn init() {
    let _ = try_init();
}

/// Service names for consistent logging
pub mod services {
    pub const MEMORY_TIER: &str = "cache.memory";
    pub const DISK_TIER: &str = "cache.disk";
    pub const ENTRY_MANAGER: &str = "cache.entry";
    pub const REGISTRY: &str = "cache.registry";
    pub const DECORATOR: &str = "cache.func";
    pub const REPLAY: &str = "cache.replay";
}

/// Operation names for consistent logging
pub mod operations {
    pub const GET: &str = "get";
    pub const SET: &str = "set";
    pub const DELETE: &str = "delete";
    pub const CLEAR: &str = "clear";
    pub const READ_RESULT: &str = "read_result";
    pub const WRITE_RESULT: &str = "write_result";
    pub const EVICT: &str = "evict";
    pub const HASH: &str = "hash";
    pub const CALL: &str = "call";
    pub const REPLAY: &str = "replay";
}

/// Status values for consistent logging
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const PROMOTED: &str = "promoted";
    pub const EXPIRED: &str = "expired";
    pub const CORRUPT: &str = "corrupt";
    pub const ERROR: &str = "error";
}
