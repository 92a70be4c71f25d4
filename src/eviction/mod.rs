//! Entry expiry and eviction for per-function caches
//!
//! Every cached function keeps a [`WriteIndex`] next to its storage:
//! - **TTL**: an entry older than the function's TTL is treated as absent on read
//!   and removed from storage
//! - **max_entries**: once a write pushes the entry count past the limit, the
//!   oldest writes are evicted first ([`FifoPolicy`])
//!
//! Entries loaded from a persistent tier are tracked with the write time stored
//! alongside them, so they age the same way as entries written in this process.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

mod policy;

pub use policy::{is_expired, EvictionCandidate, EvictionPolicy, FifoPolicy, TtlPolicy};

/// Eviction statistics
#[derive(Debug, Default)]
pub struct EvictionStats {
    /// Entries removed to respect `max_entries`
    pub evictions_total: AtomicU64,
    /// Entries removed because their TTL elapsed
    pub expirations_total: AtomicU64,
}

impl EvictionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_eviction(&self) {
        self.evictions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_evictions_total(&self) -> u64 {
        self.evictions_total.load(Ordering::Relaxed)
    }

    pub fn get_expirations_total(&self) -> u64 {
        self.expirations_total.load(Ordering::Relaxed)
    }
}

/// Write times of the live entries of one cached function
#[derive(Debug)]
pub struct WriteIndex {
    max_entries: Option<usize>,
    entries: HashMap<String, EvictionCandidate>,
    next_sequence: u64,
}

impl WriteIndex {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            max_entries,
            entries: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Record a write of `key` and return the keys that must be evicted to stay
    /// within `max_entries`. The written key itself is never returned.
    pub fn record_write(&mut self, key: &str, written_at: DateTime<Utc>) -> Vec<String> {
        self.insert(key, written_at);
        self.select_evictions(key)
    }

    /// Start tracking an entry found in storage but not written by this index
    ///
    /// Known keys keep their existing write time.
    pub fn track(&mut self, key: &str, written_at: DateTime<Utc>) -> Vec<String> {
        if self.entries.contains_key(key) {
            return Vec::new();
        }
        self.insert(key, written_at);
        self.select_evictions(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys whose TTL has elapsed as of `now`, oldest first
    pub fn expired(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<String> {
        let policy = TtlPolicy::new(ttl, now);
        let candidates: Vec<EvictionCandidate> = self.entries.values().cloned().collect();
        let mut expired = policy.filter_candidates(&candidates);
        policy.sort_candidates(&mut expired);
        expired.into_iter().map(|c| c.key).collect()
    }

    fn insert(&mut self, key: &str, written_at: DateTime<Utc>) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            key.to_string(),
            EvictionCandidate {
                key: key.to_string(),
                written_at,
                sequence,
            },
        );
    }

    fn select_evictions(&mut self, keep: &str) -> Vec<String> {
        let Some(max_entries) = self.max_entries else {
            return Vec::new();
        };
        if self.entries.len() <= max_entries {
            return Vec::new();
        }

        let mut candidates: Vec<EvictionCandidate> = self
            .entries
            .values()
            .filter(|c| c.key != keep)
            .cloned()
            .collect();
        FifoPolicy.sort_candidates(&mut candidates);

        let overflow = self.entries.len() - max_entries;
        let evicted: Vec<String> = candidates
            .into_iter()
            .take(overflow)
            .map(|c| c.key)
            .collect();

        for key in &evicted {
            self.entries.remove(key);
        }
        evicted
    }
}
