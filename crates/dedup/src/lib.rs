//! Deduplication Cache (C11, `spec.md` §4.11).
//!
//! Bounded-size LRU with per-entry TTL, keyed by a stable fingerprint of
//! `(source_id, normalized message, minute bucket)`. Purely advisory: a
//! cache miss never blocks the pipeline, a cache hit drops the record and
//! bumps `deduplicated_total`/`dedup_hits_total`.

use std::hash::{
    Hash,
    Hasher,
};

use moka::sync::Cache;
use streamship_common::{
    events::{
        emit,
        LifecycleEvent,
    },
    metrics::metrics,
    record::Record,
};
use streamship_config::DedupConfig;

/// Groups timestamps into one-minute buckets so that two identical lines a
/// few seconds apart collapse to the same fingerprint, while lines an hour
/// apart do not.
fn minute_bucket(timestamp: std::time::Duration) -> u64 {
    timestamp.as_secs() / 60
}

fn fingerprint(source_id: &str, message: &str, bucket: u64) -> u64 {
    let mut hasher = ahash::AHasher::default();
    source_id.hash(&mut hasher);
    message.trim().hash(&mut hasher);
    bucket.hash(&mut hasher);
    hasher.finish()
}

pub struct DedupCache {
    enabled: bool,
    cache: Cache<u64, ()>,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.capacity)
            .time_to_live(config.ttl)
            .eviction_listener(|_key, _value, cause| {
                if cause == moka::notification::RemovalCause::Size {
                    metrics().dedup_evictions_total.inc();
                }
            })
            .build();
        Self {
            enabled: config.enabled,
            cache,
        }
    }

    /// Returns `true` if `record` is a duplicate seen within the TTL window
    /// and should be dropped; otherwise remembers it and returns `false`.
    pub fn check_and_insert(&self, record: &Record) -> bool {
        if !self.enabled {
            return false;
        }
        let key = fingerprint(&record.source_id, &record.message_str(), minute_bucket(record.timestamp));
        if self.cache.get(&key).is_some() {
            metrics().dedup_hits_total.inc();
            emit(LifecycleEvent::DeduplicatedRecord {
                source_key: record.source_id.to_string(),
            });
            return true;
        }
        self.cache.insert(key, ());
        false
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use streamship_common::record::{
        Labels,
        SourceType,
    };

    use super::*;

    fn record(source_id: &str, message: &str, secs: u64) -> Record {
        Record::new(
            Duration::from_secs(secs),
            message.as_bytes().to_vec(),
            SourceType::File,
            Arc::<str>::from(source_id),
            Labels::new(),
        )
    }

    #[test]
    fn first_sighting_is_not_a_duplicate() {
        let cache = DedupCache::new(&DedupConfig {
            enabled: true,
            capacity: 100,
            ttl: Duration::from_secs(60),
        });
        assert!(!cache.check_and_insert(&record("file:a", "hello", 0)));
    }

    #[test]
    fn repeated_line_within_same_minute_is_deduplicated() {
        let cache = DedupCache::new(&DedupConfig {
            enabled: true,
            capacity: 100,
            ttl: Duration::from_secs(60),
        });
        assert!(!cache.check_and_insert(&record("file:a", "hello", 0)));
        assert!(cache.check_and_insert(&record("file:a", "hello", 5)));
    }

    #[test]
    fn different_minute_bucket_is_not_a_duplicate() {
        let cache = DedupCache::new(&DedupConfig {
            enabled: true,
            capacity: 100,
            ttl: Duration::from_secs(60),
        });
        assert!(!cache.check_and_insert(&record("file:a", "hello", 0)));
        assert!(!cache.check_and_insert(&record("file:a", "hello", 90)));
    }

    #[test]
    fn disabled_cache_never_reports_duplicates() {
        let cache = DedupCache::new(&DedupConfig {
            enabled: false,
            capacity: 100,
            ttl: Duration::from_secs(60),
        });
        assert!(!cache.check_and_insert(&record("file:a", "hello", 0)));
        assert!(!cache.check_and_insert(&record("file:a", "hello", 0)));
    }
}
