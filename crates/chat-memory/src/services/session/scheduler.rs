use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::locks::SessionLocks;
use crate::archive::ArchivalTier;
use crate::cache::CacheTier;
use crate::models::{ConversationId, SessionRecord};
use crate::utils::{SessionError, SessionResult};

/// Concurrent archive writes per cycle
const PERSIST_CONCURRENCY: usize = 8;

const MIN_POLL: Duration = Duration::from_secs(1);
const MAX_POLL: Duration = Duration::from_secs(60);

/// When a cached session becomes due for archival
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPolicy {
    /// Persist once the remaining TTL drops to this offset
    BeforeExpiry(Duration),
    /// Persist once this long has passed since the last write
    Interval(Duration),
}

fn parse_duration(raw: &str) -> SessionResult<Duration> {
    let raw = raw.trim();
    let (digits, scale) = match raw.char_indices().last() {
        Some((idx, 's')) => (&raw[..idx], 1),
        Some((idx, 'm')) => (&raw[..idx], 60),
        Some((idx, 'h')) => (&raw[..idx], 3600),
        _ => (raw, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| SessionError::Config(format!("invalid duration '{}'", raw)))?;
    Ok(Duration::from_secs(value.saturating_mul(scale)))
}

impl PersistPolicy {
    /// Accepts `ttl-<d>`, `before-expiry:<d>`, `every:<d>`, `interval:<d>`
    /// or a bare `<d>`, where `<d>` is seconds with an optional s/m/h suffix.
    pub fn parse(raw: &str) -> SessionResult<Self> {
        let raw = raw.trim();
        if let Some(offset) = raw
            .strip_prefix("ttl-")
            .or_else(|| raw.strip_prefix("before-expiry:"))
        {
            return Ok(PersistPolicy::BeforeExpiry(parse_duration(offset)?));
        }
        let every = raw
            .strip_prefix("every:")
            .or_else(|| raw.strip_prefix("interval:"))
            .unwrap_or(raw);
        let interval = parse_duration(every)
            .map_err(|_| SessionError::Config(format!("invalid persist policy '{}'", raw)))?;
        if interval.is_zero() {
            return Err(SessionError::Config("persist interval must be positive".into()));
        }
        Ok(PersistPolicy::Interval(interval))
    }

    /// Remaining-TTL level at or below which a session is due
    pub fn threshold(&self, ttl: Duration) -> Duration {
        match self {
            PersistPolicy::BeforeExpiry(offset) => (*offset).min(ttl),
            PersistPolicy::Interval(every) => ttl.saturating_sub(*every),
        }
    }

    /// Reject policies under which no cached session could ever become due
    pub fn check_against(&self, ttl: Duration) -> SessionResult<()> {
        if self.threshold(ttl).is_zero() {
            return Err(SessionError::Config(format!(
                "persist policy {:?} never fires with a {}s cache ttl",
                self,
                ttl.as_secs()
            )));
        }
        Ok(())
    }

    pub fn is_due(&self, remaining: Duration, ttl: Duration) -> bool {
        remaining <= self.threshold(ttl)
    }

    /// Explicit override, else a quarter of the threshold within [1s, 60s]
    pub fn poll_interval(&self, ttl: Duration, configured: Option<Duration>) -> Duration {
        match configured {
            Some(d) if !d.is_zero() => d,
            _ => (self.threshold(ttl) / 4).clamp(MIN_POLL, MAX_POLL),
        }
    }
}

/// Counts from one persistence cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub persisted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PersistReport {
    pub fn total(&self) -> usize {
        self.persisted + self.skipped + self.failed
    }

    pub fn absorb(&mut self, other: PersistReport) {
        self.persisted += other.persisted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Persisted => self.persisted += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

impl fmt::Display for PersistReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "persisted={} skipped={} failed={}",
            self.persisted, self.skipped, self.failed
        )
    }
}

/// `updated_at` of the last archived version of each session.
/// Shared with the session manager so stats and flushes see scheduled writes.
#[derive(Default)]
pub struct PersistLedger {
    entries: DashMap<ConversationId, DateTime<Utc>>,
}

impl PersistLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str, updated_at: DateTime<Utc>) {
        self.entries.insert(id.to_string(), updated_at);
    }

    pub fn is_current(&self, id: &str, updated_at: DateTime<Utc>) -> bool {
        self.entries
            .get(id)
            .map(|at| *at >= updated_at)
            .unwrap_or(false)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn forget(&self, id: &str) {
        self.entries.remove(id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Persisted,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Regular cycle: due sessions only, never wait on a busy session
    Due,
    /// Shutdown: everything not yet archived, waiting for in-flight turns
    Drain,
}

/// Archives cached sessions before their cache entry expires
pub struct PersistScheduler {
    cache: Arc<CacheTier>,
    archive: Arc<ArchivalTier>,
    locks: Arc<SessionLocks>,
    ledger: Arc<PersistLedger>,
    policy: PersistPolicy,
    poll_interval: Duration,
}

impl PersistScheduler {
    pub fn new(
        cache: Arc<CacheTier>,
        archive: Arc<ArchivalTier>,
        locks: Arc<SessionLocks>,
        ledger: Arc<PersistLedger>,
        policy: PersistPolicy,
        poll_override: Option<Duration>,
    ) -> Self {
        let poll_interval = policy.poll_interval(cache.ttl(), poll_override);
        Self {
            cache,
            archive,
            locks,
            ledger,
            policy,
            poll_interval,
        }
    }

    pub fn policy(&self) -> PersistPolicy {
        self.policy
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Persist every cached session that is due under the policy
    pub async fn run_cycle(&self) -> PersistReport {
        self.persist_cached(Mode::Due).await
    }

    /// Persist every cached session not archived yet, regardless of TTL
    pub async fn drain(&self) -> PersistReport {
        self.persist_cached(Mode::Drain).await
    }

    async fn persist_cached(&self, mode: Mode) -> PersistReport {
        let ids = self.cache.list("").await;
        let outcomes: Vec<Outcome> = stream::iter(ids)
            .map(|id| async move { self.persist_one(&id, mode).await })
            .buffer_unordered(PERSIST_CONCURRENCY)
            .collect()
            .await;

        let mut report = PersistReport::default();
        for outcome in outcomes {
            report.record(outcome);
        }
        self.locks.prune();
        report
    }

    async fn persist_one(&self, id: &str, mode: Mode) -> Outcome {
        let _guard = match mode {
            Mode::Due => match self.locks.try_acquire(id) {
                Some(guard) => guard,
                None => {
                    debug!("Session {} busy, deferring persist", id);
                    return Outcome::Skipped;
                }
            },
            Mode::Drain => self.locks.acquire(id).await,
        };

        if mode == Mode::Due {
            let ttl = self.cache.ttl();
            match self.cache.remaining_ttl(id).await {
                Some(remaining) if self.policy.is_due(remaining, ttl) => {}
                _ => return Outcome::Skipped,
            }
        }

        let Some(bytes) = self.cache.get(id).await else {
            return Outcome::Skipped;
        };
        let record = match SessionRecord::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!("Cached session {} is unreadable, not persisting: {}", id, e);
                return Outcome::Failed;
            }
        };

        if self.ledger.is_current(id, record.updated_at) {
            return Outcome::Skipped;
        }

        match self.archive.save(id, &record).await {
            Ok(committed) => {
                self.ledger.record(id, record.updated_at);
                info!(
                    "Auto-persisted {} before cache expiry ({} messages, merge_count={})",
                    id, committed.message_count, committed.merge_count
                );
                Outcome::Persisted
            }
            Err(e) => {
                warn!("Background persist failed for {}: {}", id, e);
                Outcome::Failed
            }
        }
    }

    /// Run cycles every `poll_interval` until `shutdown` flips to true,
    /// then drain.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<PersistReport> {
        tokio::spawn(async move {
            info!(
                "Started background persist task (policy={:?}, poll={:?})",
                self.policy, self.poll_interval
            );
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_cycle().await;
                        if report.persisted > 0 || report.failed > 0 {
                            info!("Persist cycle: {}", report);
                        } else {
                            debug!("Persist cycle: {}", report);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            let report = self.drain().await;
            info!("Background persist task stopped, drained: {}", report);
            report
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchiveStore;
    use crate::config::{ArchiveConfig, CacheConfig};
    use crate::models::{ChatMessage, Thread};

    #[test]
    fn test_parse_policies() {
        assert_eq!(
            PersistPolicy::parse("ttl-300").unwrap(),
            PersistPolicy::BeforeExpiry(Duration::from_secs(300))
        );
        assert_eq!(
            PersistPolicy::parse("before-expiry:5m").unwrap(),
            PersistPolicy::BeforeExpiry(Duration::from_secs(300))
        );
        assert_eq!(
            PersistPolicy::parse("every:1h").unwrap(),
            PersistPolicy::Interval(Duration::from_secs(3600))
        );
        assert_eq!(
            PersistPolicy::parse("interval:90").unwrap(),
            PersistPolicy::Interval(Duration::from_secs(90))
        );
        assert_eq!(
            PersistPolicy::parse("120s").unwrap(),
            PersistPolicy::Interval(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_invalid_policies() {
        for bad in ["", "soon", "ttl-abc", "every:0", "every:"] {
            assert!(
                matches!(PersistPolicy::parse(bad), Err(SessionError::Config(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_threshold_and_poll_interval() {
        let ttl = Duration::from_secs(3600);
        let before = PersistPolicy::BeforeExpiry(Duration::from_secs(300));
        assert!(before.is_due(Duration::from_secs(300), ttl));
        assert!(!before.is_due(Duration::from_secs(301), ttl));
        assert_eq!(before.poll_interval(ttl, None), Duration::from_secs(60));

        let every = PersistPolicy::Interval(Duration::from_secs(600));
        assert_eq!(every.threshold(ttl), Duration::from_secs(3000));
        assert!(every.is_due(Duration::from_secs(2999), ttl));

        let tight = PersistPolicy::BeforeExpiry(Duration::from_secs(2));
        assert_eq!(tight.poll_interval(ttl, None), Duration::from_secs(1));
        assert_eq!(
            tight.poll_interval(ttl, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_policy_that_never_fires_is_rejected() {
        let ttl = Duration::from_secs(60);
        assert!(PersistPolicy::Interval(Duration::from_secs(30))
            .check_against(ttl)
            .is_ok());
        assert!(PersistPolicy::Interval(Duration::from_secs(60))
            .check_against(ttl)
            .is_err());
        assert!(PersistPolicy::Interval(Duration::from_secs(600))
            .check_against(ttl)
            .is_err());
        assert!(PersistPolicy::BeforeExpiry(Duration::ZERO)
            .check_against(ttl)
            .is_err());
        assert!(PersistPolicy::BeforeExpiry(Duration::from_secs(600))
            .check_against(ttl)
            .is_ok());
    }

    #[test]
    fn test_report_display() {
        let mut report = PersistReport::default();
        report.absorb(PersistReport {
            persisted: 2,
            skipped: 1,
            failed: 0,
        });
        assert_eq!(report.total(), 3);
        assert_eq!(report.to_string(), "persisted=2 skipped=1 failed=0");
    }

    struct Fixture {
        cache: Arc<CacheTier>,
        store: Arc<MemoryArchiveStore>,
        locks: Arc<SessionLocks>,
        scheduler: Arc<PersistScheduler>,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(CacheTier::new(
            None,
            &CacheConfig {
                ttl_seconds: 60,
                ..CacheConfig::default()
            },
        ));
        let store = Arc::new(MemoryArchiveStore::new());
        let archive = Arc::new(ArchivalTier::new(store.clone(), &ArchiveConfig::default()));
        let locks = Arc::new(SessionLocks::new());
        let scheduler = Arc::new(PersistScheduler::new(
            cache.clone(),
            archive,
            locks.clone(),
            Arc::new(PersistLedger::new()),
            PersistPolicy::BeforeExpiry(Duration::from_secs(30)),
            None,
        ));
        Fixture {
            cache,
            store,
            locks,
            scheduler,
        }
    }

    async fn cache_session(cache: &CacheTier, id: &str, text: &str) {
        let record = SessionRecord::new(
            Utc::now(),
            &Thread::from_messages(vec![ChatMessage::user(text)]),
        );
        cache
            .set(id, &record.to_vec().unwrap(), cache.ttl())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_due_sessions_are_persisted_once() {
        let fx = fixture();
        cache_session(&fx.cache, "s1", "hello").await;

        let report = fx.scheduler.run_cycle().await;
        assert_eq!(report.persisted, 0);
        assert!(fx.store.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = fx.scheduler.run_cycle().await;
        assert_eq!(report.persisted, 1);
        assert_eq!(fx.store.len(), 1);

        // unchanged session is not merged again
        let report = fx.scheduler.run_cycle().await;
        assert_eq!(report.persisted, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_releases_idle_lock_entries() {
        let fx = fixture();
        for id in ["a", "b", "c"] {
            cache_session(&fx.cache, id, "hello").await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let held = fx.locks.acquire("held").await;
        let report = fx.scheduler.run_cycle().await;
        assert_eq!(report.persisted, 3);
        assert_eq!(fx.locks.len(), 1);

        drop(held);
        fx.scheduler.run_cycle().await;
        assert!(fx.locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_sessions_are_deferred() {
        let fx = fixture();
        cache_session(&fx.cache, "busy", "hello").await;
        tokio::time::advance(Duration::from_secs(45)).await;

        let guard = fx.locks.acquire("busy").await;
        let report = fx.scheduler.run_cycle().await;
        assert_eq!(report.skipped, 1);
        assert!(fx.store.is_empty());

        drop(guard);
        assert_eq!(fx.scheduler.run_cycle().await.persisted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_entry_is_isolated() {
        let fx = fixture();
        fx.cache.set("bad", b"{not json", fx.cache.ttl()).await;
        cache_session(&fx.cache, "good", "hello").await;
        tokio::time::advance(Duration::from_secs(40)).await;

        let report = fx.scheduler.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.persisted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_pending_sessions() {
        let fx = fixture();
        cache_session(&fx.cache, "fresh", "not due yet").await;

        let (tx, rx) = watch::channel(false);
        let handle = fx.scheduler.clone().spawn(rx);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(fx.store.is_empty());

        tx.send(true).unwrap();
        let drained = handle.await.unwrap();
        assert_eq!(drained.persisted, 1);
        assert_eq!(fx.store.len(), 1);
    }
}
