//! Eviction policy implementations
//!
//! Each policy defines how entries of one cached function are ordered for removal:
//! - **FIFO**: Sort by `written_at` (oldest write first)
//! - **TTL**: Sort by `written_at`, only select expired entries

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Entry considered for eviction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Value key of the entry
    pub key: String,
    /// When the entry was last written
    pub written_at: DateTime<Utc>,
    /// Monotonic write counter, breaks ties between equal timestamps
    pub sequence: u64,
}

pub trait EvictionPolicy: Send + Sync {
    /// Sort candidates by eviction priority (first = most likely to evict)
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]);

    /// Filter candidates that should be considered for eviction
    /// Default: consider all candidates
    fn filter_candidates(&self, candidates: &[EvictionCandidate]) -> Vec<EvictionCandidate> {
        candidates.to_vec()
    }
}

/// First in, first out by write time
///
/// Reads do not refresh an entry; rewriting a key makes it the newest.
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoPolicy;

impl EvictionPolicy for FifoPolicy {
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]) {
        candidates.sort_by(|a, b| {
            a.written_at
                .cmp(&b.written_at)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
    }
}

/// Selects entries older than the TTL as of a fixed instant
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    ttl: Duration,
    now: DateTime<Utc>,
}

impl TtlPolicy {
    pub fn new(ttl: Duration, now: DateTime<Utc>) -> Self {
        Self { ttl, now }
    }

    pub fn is_expired(&self, written_at: DateTime<Utc>) -> bool {
        is_expired(written_at, self.now, Some(self.ttl))
    }
}

impl EvictionPolicy for TtlPolicy {
    fn sort_candidates(&self, candidates: &mut [EvictionCandidate]) {
        FifoPolicy.sort_candidates(candidates);
    }

    fn filter_candidates(&self, candidates: &[EvictionCandidate]) -> Vec<EvictionCandidate> {
        candidates
            .iter()
            .filter(|c| self.is_expired(c.written_at))
            .cloned()
            .collect()
    }
}

/// An entry expires once its age is strictly greater than the TTL
pub fn is_expired(written_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Option<Duration>) -> bool {
    let Some(ttl) = ttl else {
        return false;
    };
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    now.signed_duration_since(written_at) > ttl
}
