use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Bounded in-process TTL map used when the remote cache is unreachable.
///
/// Expiry is checked lazily on access. Reads never move the expiry.
pub struct LocalTtlStore {
    map: DashMap<String, Entry>,
    max_entries: usize,
}

impl LocalTtlStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            map: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let now = Instant::now();
        if !self.map.contains_key(key) && self.map.len() >= self.max_entries {
            self.evict(now);
        }
        self.map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        {
            let entry = self.map.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.map.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    pub fn remove(&self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        {
            let entry = self.map.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.remaining(now));
            }
        }
        self.map.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    /// Restart the expiry clock for an existing key
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.map.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    /// List live keys matching the given prefix (empty = all keys)
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.map
            .iter()
            .filter(|r| r.key().starts_with(prefix) && !r.is_expired(now))
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict(&self, now: Instant) {
        let expired_before = self.map.len();
        self.map.retain(|_, e| !e.is_expired(now));
        if self.map.len() < self.max_entries {
            debug!(
                "Local cache dropped {} expired entries",
                expired_before - self.map.len()
            );
            return;
        }

        // Still full: drop whatever would have expired first.
        let victim = self
            .map
            .iter()
            .min_by_key(|r| r.expires_at)
            .map(|r| r.key().clone());
        if let Some(key) = victim {
            debug!("Local cache full, evicting {}", key);
            self.map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_get_and_expiry() {
        let store = LocalTtlStore::new(16);
        store.set("chat:a", b"one".to_vec(), Duration::from_secs(10));
        assert_eq!(store.get("chat:a"), Some(b"one".to_vec()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("chat:a"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_read_spares_a_fresh_write() {
        let store = LocalTtlStore::new(16);
        store.set("k", b"old".to_vec(), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(11)).await;

        // Expired entry replaced before the lazy cleanup runs
        store.set("k", b"new".to_vec(), Duration::from_secs(10));
        store.map.remove_if("k", |_, e| e.is_expired(Instant::now()));
        assert_eq!(store.get("k"), Some(b"new".to_vec()));
        assert_eq!(store.remaining_ttl("k"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.remaining_ttl("k"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_do_not_extend_ttl() {
        let store = LocalTtlStore::new(16);
        store.set("k", b"v".to_vec(), Duration::from_secs(10));

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(store.get("k").is_some());
        }
        assert_eq!(store.remaining_ttl("k"), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_restarts_clock() {
        let store = LocalTtlStore::new(16);
        store.set("k", b"v".to_vec(), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(store.expire("k", Duration::from_secs(10)));
        assert_eq!(store.remaining_ttl("k"), Some(Duration::from_secs(10)));
        assert!(!store.expire("missing", Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_evicts_soonest_expiry() {
        let store = LocalTtlStore::new(2);
        store.set("short", b"1".to_vec(), Duration::from_secs(5));
        store.set("long", b"2".to_vec(), Duration::from_secs(50));
        store.set("new", b"3".to_vec(), Duration::from_secs(20));

        assert_eq!(store.len(), 2);
        assert!(store.get("short").is_none());
        assert!(store.get("long").is_some());
        assert!(store.get("new").is_some());
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = LocalTtlStore::new(16);
        store.set("chat:a", vec![], Duration::from_secs(60));
        store.set("chat:b", vec![], Duration::from_secs(60));
        store.set("other:c", vec![], Duration::from_secs(60));

        let mut keys = store.keys("chat:");
        keys.sort();
        assert_eq!(keys, vec!["chat:a".to_string(), "chat:b".to_string()]);
        assert_eq!(store.keys("").len(), 3);
    }
}
