pub mod credentials;
pub mod local;
pub mod redis_backend;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::models::{ComponentCheck, ConversationId, HealthStatus};
use crate::utils::{SessionError, SessionResult, Tier};

pub use redis_backend::RedisBackend;
pub use credentials::{CacheCredential, CredentialProvider};
pub use local::LocalTtlStore;

const COMPONENT: &str = "cache";

/// Remote key/value store with per-key expiry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> SessionResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> SessionResult<()>;
    async fn delete(&self, key: &str) -> SessionResult<bool>;
    /// Full keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> SessionResult<Vec<String>>;
    /// None when the key is missing or has no expiry
    async fn ttl(&self, key: &str) -> SessionResult<Option<Duration>>;
    async fn expire(&self, key: &str, ttl: Duration) -> SessionResult<bool>;
    async fn ping(&self) -> SessionResult<()>;
}

/// TTL-bounded session cache.
///
/// Every remote call is bounded by `op_timeout`. When the remote fails or
/// times out the same operation is served by the in-process [`LocalTtlStore`]
/// and the tier reports itself degraded until a remote call succeeds again.
/// Callers never observe a cache error.
pub struct CacheTier {
    remote: Option<Arc<dyn CacheBackend>>,
    local: LocalTtlStore,
    ttl: Duration,
    prefix: String,
    op_timeout: Duration,
    degraded: AtomicBool,
}

impl CacheTier {
    pub fn new(remote: Option<Arc<dyn CacheBackend>>, config: &CacheConfig) -> Self {
        let degraded = remote.is_none();
        Self {
            remote,
            local: LocalTtlStore::new(config.fallback_max_entries),
            ttl: config.ttl(),
            prefix: config.key_prefix.clone(),
            op_timeout: config.op_timeout(),
            degraded: AtomicBool::new(degraded),
        }
    }

    /// Build the tier against the configured Redis server.
    ///
    /// The connection itself is established lazily. A URL that cannot be
    /// parsed leaves the tier running on the local store only.
    pub fn connect(config: &CacheConfig) -> Self {
        match RedisBackend::new(config) {
            Ok(backend) => {
                info!("✅ Cache tier configured ({})", backend.endpoint());
                Self::new(Some(Arc::new(backend)), config)
            }
            Err(e) => {
                warn!("Cache backend unavailable, using local fallback only: {}", e);
                Self::new(None, config)
            }
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Run one remote operation under the timeout. `None` means the caller
    /// must serve the request locally.
    async fn guarded<T, F>(&self, op: &str, fut: F) -> Option<T>
    where
        F: Future<Output = SessionResult<T>>,
    {
        let outcome = match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout {
                tier: Tier::Cache,
                after: self.op_timeout,
            }),
        };

        match outcome {
            Ok(value) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Cache tier recovered");
                }
                Some(value)
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!("Cache {} failed, falling back to local store: {}", op, e);
                } else {
                    debug!("Cache {} failed while degraded: {}", op, e);
                }
                None
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Vec<u8>> {
        let key = self.key(id);
        if let Some(remote) = &self.remote {
            if let Some(Some(bytes)) = self.guarded("get", remote.get(&key)).await {
                return Some(bytes);
            }
        }
        // Remote miss still consults the local store: writes made during an
        // outage must stay readable.
        self.local.get(&key)
    }

    pub async fn set(&self, id: &str, value: &[u8], ttl: Duration) {
        let key = self.key(id);
        if let Some(remote) = &self.remote {
            if self.guarded("set", remote.set(&key, value, ttl)).await.is_some() {
                self.local.remove(&key);
                return;
            }
        }
        self.local.set(&key, value.to_vec(), ttl);
    }

    pub async fn delete(&self, id: &str) -> bool {
        let key = self.key(id);
        let mut removed = false;
        if let Some(remote) = &self.remote {
            removed = self
                .guarded("delete", remote.delete(&key))
                .await
                .unwrap_or(false);
        }
        self.local.remove(&key) || removed
    }

    /// Conversation ids currently cached whose id starts with `id_prefix`
    pub async fn list(&self, id_prefix: &str) -> Vec<ConversationId> {
        let key_prefix = self.key(id_prefix);
        let mut keys: BTreeSet<String> = self.local.keys(&key_prefix).into_iter().collect();
        if let Some(remote) = &self.remote {
            if let Some(remote_keys) = self.guarded("list", remote.keys(&key_prefix)).await {
                keys.extend(remote_keys);
            }
        }
        keys.into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect()
    }

    pub async fn remaining_ttl(&self, id: &str) -> Option<Duration> {
        let key = self.key(id);
        if let Some(remote) = &self.remote {
            if let Some(Some(ttl)) = self.guarded("ttl", remote.ttl(&key)).await {
                return Some(ttl);
            }
        }
        self.local.remaining_ttl(&key)
    }

    /// Restart the expiry clock. Only explicit calls move the TTL; reads never do.
    pub async fn refresh_ttl(&self, id: &str) -> bool {
        let key = self.key(id);
        let mut refreshed = false;
        if let Some(remote) = &self.remote {
            refreshed = self
                .guarded("expire", remote.expire(&key, self.ttl))
                .await
                .unwrap_or(false);
        }
        self.local.expire(&key, self.ttl) || refreshed
    }

    pub async fn health(&self) -> ComponentCheck {
        let started = Instant::now();
        let Some(remote) = &self.remote else {
            return ComponentCheck::with_status(
                COMPONENT,
                HealthStatus::Degraded,
                started.elapsed(),
                "no remote cache configured; using local fallback",
            );
        };

        match tokio::time::timeout(self.op_timeout, remote.ping()).await {
            Ok(Ok(())) => {
                self.degraded.store(false, Ordering::Relaxed);
                ComponentCheck::healthy(COMPONENT, started.elapsed())
            }
            Ok(Err(e)) => {
                self.degraded.store(true, Ordering::Relaxed);
                ComponentCheck::with_status(
                    COMPONENT,
                    HealthStatus::Degraded,
                    started.elapsed(),
                    format!("{}; using local fallback", e),
                )
            }
            Err(_) => {
                self.degraded.store(true, Ordering::Relaxed);
                ComponentCheck::with_status(
                    COMPONENT,
                    HealthStatus::Degraded,
                    started.elapsed(),
                    format!("ping timed out after {:?}; using local fallback", self.op_timeout),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn config() -> CacheConfig {
        CacheConfig {
            ttl_seconds: 60,
            op_timeout_ms: 100,
            ..CacheConfig::default()
        }
    }

    fn failing_backend() -> MockCacheBackend {
        let mut mock = MockCacheBackend::new();
        mock.expect_get()
            .returning(|_| Err(SessionError::connectivity(Tier::Cache, "refused")));
        mock.expect_set()
            .returning(|_, _, _| Err(SessionError::connectivity(Tier::Cache, "refused")));
        mock.expect_delete()
            .returning(|_| Err(SessionError::connectivity(Tier::Cache, "refused")));
        mock.expect_keys()
            .returning(|_| Err(SessionError::connectivity(Tier::Cache, "refused")));
        mock.expect_ttl()
            .returning(|_| Err(SessionError::connectivity(Tier::Cache, "refused")));
        mock.expect_ping()
            .returning(|| Err(SessionError::connectivity(Tier::Cache, "refused")));
        mock
    }

    #[tokio::test]
    async fn test_remote_hit_uses_prefixed_key() {
        let mut mock = MockCacheBackend::new();
        mock.expect_get()
            .with(eq("chat:s1"))
            .times(1)
            .returning(|_| Ok(Some(b"payload".to_vec())));

        let tier = CacheTier::new(Some(Arc::new(mock)), &config());
        assert_eq!(tier.get("s1").await, Some(b"payload".to_vec()));
        assert!(!tier.is_degraded());
    }

    #[tokio::test]
    async fn test_failing_remote_falls_back_transparently() {
        let tier = CacheTier::new(Some(Arc::new(failing_backend())), &config());

        tier.set("s1", b"v1", Duration::from_secs(60)).await;
        assert!(tier.is_degraded());
        assert_eq!(tier.get("s1").await, Some(b"v1".to_vec()));
        assert_eq!(tier.list("").await, vec!["s1".to_string()]);
        assert!(tier.remaining_ttl("s1").await.is_some());
        assert!(tier.delete("s1").await);
        assert_eq!(tier.get("s1").await, None);
    }

    #[tokio::test]
    async fn test_successful_call_clears_degraded_flag() {
        let mut mock = MockCacheBackend::new();
        let mut calls = 0;
        mock.expect_get().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(SessionError::connectivity(Tier::Cache, "blip"))
            } else {
                Ok(None)
            }
        });

        let tier = CacheTier::new(Some(Arc::new(mock)), &config());
        assert_eq!(tier.get("a").await, None);
        assert!(tier.is_degraded());
        assert_eq!(tier.get("a").await, None);
        assert!(!tier.is_degraded());
    }

    struct StalledBackend;

    #[async_trait]
    impl CacheBackend for StalledBackend {
        async fn get(&self, _key: &str) -> SessionResult<Option<Vec<u8>>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> SessionResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
        async fn delete(&self, _key: &str) -> SessionResult<bool> {
            Ok(false)
        }
        async fn keys(&self, _prefix: &str) -> SessionResult<Vec<String>> {
            Ok(vec![])
        }
        async fn ttl(&self, _key: &str) -> SessionResult<Option<Duration>> {
            Ok(None)
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> SessionResult<bool> {
            Ok(false)
        }
        async fn ping(&self) -> SessionResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let tier = CacheTier::new(Some(Arc::new(StalledBackend)), &config());

        tier.set("slow", b"x", Duration::from_secs(60)).await;
        assert!(tier.is_degraded());
        assert_eq!(tier.get("slow").await, Some(b"x".to_vec()));

        let check = tier.health().await;
        assert_eq!(check.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_never_refresh_ttl() {
        let tier = CacheTier::new(None, &config());
        tier.set("s1", b"v", tier.ttl()).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(tier.get("s1").await.is_some());
        assert_eq!(tier.remaining_ttl("s1").await, Some(Duration::from_secs(30)));

        assert!(tier.refresh_ttl("s1").await);
        assert_eq!(tier.remaining_ttl("s1").await, Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(tier.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_health_reports_degraded_with_reason() {
        let tier = CacheTier::new(Some(Arc::new(failing_backend())), &config());
        let check = tier.health().await;
        assert_eq!(check.name, "cache");
        assert_eq!(check.status, HealthStatus::Degraded);
        assert!(check.message.unwrap().contains("local fallback"));
    }

    #[tokio::test]
    async fn test_list_unions_remote_and_local() {
        let mut mock = MockCacheBackend::new();
        mock.expect_keys()
            .with(eq("chat:"))
            .returning(|_| Ok(vec!["chat:remote".to_string()]));
        mock.expect_set()
            .returning(|_, _, _| Err(SessionError::connectivity(Tier::Cache, "refused")));

        let tier = CacheTier::new(Some(Arc::new(mock)), &config());
        tier.set("local", b"v", Duration::from_secs(60)).await;

        assert_eq!(
            tier.list("").await,
            vec!["local".to_string(), "remote".to_string()]
        );
    }
}
