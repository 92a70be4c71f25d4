//! Memory usage reporting for cached functions

use serde::Serialize;
use std::collections::BTreeMap;

/// Size of one stored entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStat {
    pub category_name: String,
    pub cache_name: String,
    pub byte_length: usize,
}

pub trait CacheStatsProvider: Send + Sync {
    fn get_stats(&self) -> Vec<CacheStat>;
}

/// Totals for one cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub category_name: String,
    pub cache_name: String,
    pub total_entries: u64,
    pub total_bytes: u64,
}

/// Group per-entry stats by category and cache name
pub fn summarize(stats: &[CacheStat]) -> Vec<StatsSummary> {
    let mut grouped: BTreeMap<(&str, &str), StatsSummary> = BTreeMap::new();
    for stat in stats {
        let summary = grouped
            .entry((stat.category_name.as_str(), stat.cache_name.as_str()))
            .or_insert_with(|| StatsSummary {
                category_name: stat.category_name.clone(),
                cache_name: stat.cache_name.clone(),
                ..Default::default()
            });
        summary.total_entries += 1;
        summary.total_bytes += stat.byte_length as u64;
    }
    grouped.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(cache_name: &str, byte_length: usize) -> CacheStat {
        CacheStat {
            category_name: "cache_data".to_string(),
            cache_name: cache_name.to_string(),
            byte_length,
        }
    }

    #[test]
    fn test_summarize_groups_by_cache() {
        let stats = vec![stat("app::b", 10), stat("app::a", 5), stat("app::b", 7)];

        let summary = summarize(&stats);

        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].cache_name, "app::a");
        assert_eq!(summary[0].total_entries, 1);
        assert_eq!(summary[1].cache_name, "app::b");
        assert_eq!(summary[1].total_entries, 2);
        assert_eq!(summary[1].total_bytes, 17);
    }

    #[test]
    fn test_summarize_empty() {
        assert!(summarize(&[]).is_empty());
    }
}
