use crate::model::{CacheStats, ContextPayload, ContextScope};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

struct CacheEntry {
    payload: String,
    size: usize,
    inserted: Instant,
    last_used: Instant,
}

/// Byte-size- and TTL-bounded map from a request fingerprint to a serialized
/// [`ContextPayload`]. Expired entries are purged opportunistically on every
/// access; capacity pressure evicts the least-recently-used survivors.
pub struct ResultCache {
    capacity_bytes: usize,
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
    size_bytes: usize,
    hits: u64,
    misses: u64,
}

/// Deterministic cache key over the query's semantic inputs.
pub fn fingerprint(query: &str, scope: ContextScope, max_tokens: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(query.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(scope.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(max_tokens.to_le_bytes().as_slice());
    hasher.finalize().to_hex().to_string()
}

impl ResultCache {
    pub fn new(capacity_bytes: usize, ttl: Duration) -> Self {
        Self {
            capacity_bytes,
            ttl,
            entries: HashMap::new(),
            size_bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<ContextPayload> {
        self.purge_expired();
        let Some(entry) = self.entries.get_mut(key) else {
            self.misses += 1;
            return None;
        };
        entry.last_used = Instant::now();
        match serde_json::from_str(&entry.payload) {
            Ok(payload) => {
                self.hits += 1;
                Some(payload)
            }
            Err(err) => {
                // A stored value that fails to deserialize is a miss, never
                // an error to the caller.
                warn!("cache entry {key} failed to deserialize: {err}");
                self.remove(key);
                self.misses += 1;
                None
            }
        }
    }

    pub fn set(&mut self, key: &str, payload: &ContextPayload) {
        let serialized = match serde_json::to_string(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!("cache entry {key} failed to serialize: {err}");
                return;
            }
        };
        self.purge_expired();
        self.insert_raw(key, serialized);
        self.evict_over_capacity(key);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            size_bytes: self.size_bytes,
            capacity_bytes: self.capacity_bytes,
            ttl_secs: self.ttl.as_secs(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size_bytes = 0;
    }

    fn insert_raw(&mut self, key: &str, serialized: String) {
        let now = Instant::now();
        let size = serialized.len();
        if let Some(old) = self.entries.insert(
            key.to_string(),
            CacheEntry {
                payload: serialized,
                size,
                inserted: now,
                last_used: now,
            },
        ) {
            self.size_bytes -= old.size;
        }
        self.size_bytes += size;
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.size_bytes -= entry.size;
        }
    }

    fn purge_expired(&mut self) {
        let ttl = self.ttl;
        let mut freed = 0usize;
        self.entries.retain(|_, entry| {
            if entry.inserted.elapsed() > ttl {
                freed += entry.size;
                false
            } else {
                true
            }
        });
        self.size_bytes -= freed;
    }

    /// Evict least-recently-used entries until the aggregate fits. The entry
    /// just inserted is exempt so a single oversized payload is permitted.
    fn evict_over_capacity(&mut self, keep: &str) {
        while self.size_bytes > self.capacity_bytes {
            let victim = self
                .entries
                .iter()
                .filter(|(key, _)| key.as_str() != keep)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => self.remove(&key),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DependencyRecord, SymbolKind, SymbolRecord};

    fn payload(tag: &str, pad: usize) -> ContextPayload {
        ContextPayload {
            symbols: vec![SymbolRecord {
                name: tag.to_string(),
                kind: SymbolKind::Function,
                file_path: format!("src/{tag}.py"),
                line: 1,
                documentation: "x".repeat(pad),
            }],
            dependencies: vec![DependencyRecord {
                module: "os".into(),
                summary: "import os".into(),
            }],
            references: vec![],
            tokens_saved: 10,
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut cache = ResultCache::new(1_000_000, Duration::from_secs(60));
        let key = fingerprint("auth.py:UserService", ContextScope::Class, 2000);
        let value = payload("svc", 0);
        cache.set(&key, &value);
        assert_eq!(cache.get(&key), Some(value));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn fingerprint_is_deterministic_and_input_sensitive() {
        let a = fingerprint("q", ContextScope::Function, 100);
        assert_eq!(a, fingerprint("q", ContextScope::Function, 100));
        assert_ne!(a, fingerprint("q", ContextScope::Class, 100));
        assert_ne!(a, fingerprint("q", ContextScope::Function, 101));
        assert_ne!(a, fingerprint("q2", ContextScope::Function, 100));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = ResultCache::new(1_000_000, Duration::from_millis(20));
        let value = payload("ttl", 0);
        cache.set("k", &value);
        assert!(cache.get("k").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn lru_entry_is_evicted_under_capacity_pressure() {
        let value = payload("e", 64);
        let one = serde_json::to_string(&value).unwrap().len();
        let mut cache = ResultCache::new(one * 2, Duration::from_secs(60));

        cache.set("a", &value);
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b", &value);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("a").is_some()); // refresh a, b is now LRU
        std::thread::sleep(Duration::from_millis(2));
        cache.set("c", &value);

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn single_oversized_entry_is_permitted() {
        let mut cache = ResultCache::new(16, Duration::from_secs(60));
        let value = payload("big", 512);
        cache.set("big", &value);
        assert_eq!(cache.get("big"), Some(value));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn undeserializable_entry_is_a_logged_miss() {
        let mut cache = ResultCache::new(1_000_000, Duration::from_secs(60));
        cache.insert_raw("bad", "not json at all".to_string());
        assert!(cache.get("bad").is_none());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn clear_removes_everything() {
        let mut cache = ResultCache::new(1_000_000, Duration::from_secs(60));
        cache.set("a", &payload("a", 0));
        cache.set("b", &payload("b", 0));
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().size_bytes, 0);
        assert!(cache.get("a").is_none());
    }
}
