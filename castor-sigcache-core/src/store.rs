use crate::{LastThinking, MIN_SIGNATURE_LEN, SignatureCacheEntry};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Two-tier signature store.
///
/// The memory tier holds fresh entries (`memory_ttl`); the disk tier mirrors
/// what the snapshot file holds (`disk_ttl`) so a lookup that outlived the
/// memory tier can still be answered between flushes. Both tiers are moka
/// caches and therefore lock-free for callers; the broker crate owns the file
/// itself.
pub struct SignatureStore {
    memory: Cache<String, SignatureCacheEntry>,
    disk: Cache<String, SignatureCacheEntry>,
    last_thinking: Cache<String, LastThinking>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl SignatureStore {
    pub fn new(memory_ttl_seconds: u64, disk_ttl_seconds: u64, max_capacity: u64) -> Self {
        fn tier<V>(ttl_seconds: u64, max_capacity: u64) -> Cache<String, V>
        where
            V: Clone + Send + Sync + 'static,
        {
            Cache::builder()
                .time_to_live(Duration::from_secs(ttl_seconds.max(1)))
                .max_capacity(max_capacity.max(1))
                .build()
        }

        SignatureStore {
            memory: tier(memory_ttl_seconds, max_capacity),
            disk: tier(disk_ttl_seconds, max_capacity),
            last_thinking: tier(memory_ttl_seconds, max_capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Store a signature. Placeholder-length signatures are rejected.
    pub fn put(&self, key: String, entry: SignatureCacheEntry) -> bool {
        if entry.signature.len() < MIN_SIGNATURE_LEN {
            return false;
        }
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.memory.insert(key, entry);
        true
    }

    pub fn get(&self, key: &str) -> Option<SignatureCacheEntry> {
        let found = self
            .memory
            .get(key)
            .or_else(|| self.disk.get(key));
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn set_last_thinking(&self, session_key: String, last: LastThinking) {
        if last.signature.len() < MIN_SIGNATURE_LEN {
            return;
        }
        self.last_thinking.insert(session_key, last);
    }

    pub fn last_thinking(&self, session_key: &str) -> Option<LastThinking> {
        self.last_thinking.get(session_key)
    }

    pub fn clear_last_thinking(&self, session_key: &str) {
        self.last_thinking.invalidate(session_key);
    }

    /// Seed the disk tier from a loaded snapshot, dropping entries already
    /// past the disk TTL.
    pub fn load_snapshot(&self, snapshot: &DiskSnapshot, now_ms: i64, disk_ttl_seconds: u64) {
        let ttl_ms = disk_ttl_ms(disk_ttl_seconds);
        for (key, entry) in &snapshot.entries {
            if entry.age_ms(now_ms) < ttl_ms {
                self.disk.insert(key.clone(), entry.clone());
            }
        }
    }

    /// Merge both tiers into the next snapshot: disk entries younger than the
    /// disk TTL first, memory entries overriding on key collision. The disk
    /// tier is refreshed to match what will be written.
    pub fn merge_for_flush(
        &self,
        memory_ttl_seconds: u64,
        disk_ttl_seconds: u64,
        now_ms: i64,
    ) -> DiskSnapshot {
        let ttl_ms = disk_ttl_ms(disk_ttl_seconds);
        let mut entries = BTreeMap::new();

        for (key, entry) in self.disk.iter() {
            if entry.age_ms(now_ms) < ttl_ms {
                entries.insert(key.as_ref().clone(), entry);
            }
        }
        for (key, entry) in self.memory.iter() {
            entries.insert(key.as_ref().clone(), entry);
        }

        for (key, entry) in &entries {
            self.disk.insert(key.clone(), entry.clone());
        }

        DiskSnapshot {
            version: DiskSnapshot::VERSION.to_string(),
            memory_ttl_seconds,
            disk_ttl_seconds,
            entries,
            statistics: self.statistics(),
        }
    }

    /// Run moka's deferred eviction work; called by the periodic janitor.
    pub fn run_pending_tasks(&self) {
        self.memory.run_pending_tasks();
        self.disk.run_pending_tasks();
        self.last_thinking.run_pending_tasks();
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }

    pub fn memory_len(&self) -> u64 {
        self.memory.entry_count()
    }
}

fn disk_ttl_ms(disk_ttl_seconds: u64) -> i64 {
    i64::try_from(disk_ttl_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Serialized form of the signature-cache file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub version: String,
    pub memory_ttl_seconds: u64,
    pub disk_ttl_seconds: u64,
    #[serde(default)]
    pub entries: BTreeMap<String, SignatureCacheEntry>,
    #[serde(default)]
    pub statistics: CacheStatistics,
}

impl DiskSnapshot {
    pub const VERSION: &str = "1.0";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_sig(tag: &str) -> String {
        format!("{tag}{}", "x".repeat(MIN_SIGNATURE_LEN))
    }

    #[test]
    fn put_get_roundtrip_within_memory_ttl() {
        let store = SignatureStore::new(3600, 172_800, 1024);
        let entry = SignatureCacheEntry::new(long_sig("a"), 1000);

        assert!(store.put("k1".to_string(), entry.clone()));
        assert_eq!(store.get("k1"), Some(entry));
    }

    #[test]
    fn short_signature_is_never_cached() {
        let store = SignatureStore::new(3600, 172_800, 1024);
        let entry = SignatureCacheEntry::new("too-short", 1000);

        assert!(!store.put("k1".to_string(), entry));
        assert_eq!(store.get("k1"), None);
        assert_eq!(store.statistics().stores, 0);
    }

    #[test]
    fn merge_prefers_memory_on_collision_and_drops_stale_disk() {
        let store = SignatureStore::new(3600, 172_800, 1024);
        let now = 200_000_000_000;

        let mut snapshot_entries = BTreeMap::new();
        snapshot_entries.insert(
            "shared".to_string(),
            SignatureCacheEntry::new(long_sig("disk"), now - 1000),
        );
        snapshot_entries.insert(
            "stale".to_string(),
            SignatureCacheEntry::new(long_sig("old"), now - 172_800_001),
        );
        let snapshot = DiskSnapshot {
            version: DiskSnapshot::VERSION.to_string(),
            memory_ttl_seconds: 3600,
            disk_ttl_seconds: 172_800,
            entries: snapshot_entries,
            statistics: CacheStatistics::default(),
        };
        store.load_snapshot(&snapshot, now, 172_800);

        let fresh = SignatureCacheEntry::new(long_sig("mem"), now);
        store.put("shared".to_string(), fresh.clone());

        let merged = store.merge_for_flush(3600, 172_800, now);
        assert_eq!(merged.entries.get("shared"), Some(&fresh));
        assert!(!merged.entries.contains_key("stale"));
    }

    #[test]
    fn disk_tier_answers_after_snapshot_load() {
        let store = SignatureStore::new(3600, 172_800, 1024);
        let now = 200_000_000_000;

        let mut entries = BTreeMap::new();
        entries.insert(
            "old-key".to_string(),
            SignatureCacheEntry::new(long_sig("d"), now - 7_200_000),
        );
        let snapshot = DiskSnapshot {
            version: DiskSnapshot::VERSION.to_string(),
            memory_ttl_seconds: 3600,
            disk_ttl_seconds: 172_800,
            entries,
            statistics: CacheStatistics::default(),
        };
        store.load_snapshot(&snapshot, now, 172_800);

        assert!(store.get("old-key").is_some());
        assert_eq!(store.statistics().hits, 1);
    }

    #[test]
    fn last_thinking_is_per_session() {
        let store = SignatureStore::new(3600, 172_800, 1024);
        store.set_last_thinking(
            "s1".to_string(),
            LastThinking {
                text: "thought".to_string(),
                signature: long_sig("t"),
                tool_ids: None,
            },
        );

        assert!(store.last_thinking("s1").is_some());
        assert!(store.last_thinking("s2").is_none());

        store.clear_last_thinking("s1");
        assert!(store.last_thinking("s1").is_none());
    }
}
