pub mod fs;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ArchiveConfig;
use crate::models::{ArchivedSummary, ComponentCheck, HealthStatus, SessionRecord, RECORD_SCHEMA_VERSION};
use crate::utils::{SessionError, SessionResult, Tier};

pub use fs::FsArchiveStore;
pub use memory::MemoryArchiveStore;
pub use postgres::PgArchiveStore;

const COMPONENT: &str = "archive";

/// Read-merge-write rounds before a save gives up with `MergeConflict`
pub const MAX_MERGE_ATTEMPTS: u32 = 3;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Guard attached to a store write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Only create; fail if a record already exists
    IfAbsent,
    /// Only replace the record carrying this etag
    IfMatch(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: SessionRecord,
    /// Opaque version token for conditional writes
    pub etag: String,
}

/// Durable storage backend for session records.
///
/// `store` must fail with `SessionError::PreconditionFailed` when the
/// condition does not hold, leaving the stored record untouched.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn load(&self, id: &str) -> SessionResult<Option<StoredRecord>>;
    /// Returns the new etag
    async fn store(
        &self,
        id: &str,
        record: &SessionRecord,
        condition: WriteCondition,
    ) -> SessionResult<String>;
    async fn remove(&self, id: &str) -> SessionResult<bool>;
    /// Most recently updated first
    async fn list(&self, limit: usize) -> SessionResult<Vec<ArchivedSummary>>;
    async fn ping(&self) -> SessionResult<()>;
}

/// Reconcile an incoming record with what is already archived.
///
/// Messages are unioned by index with the incoming side winning. When the
/// incoming record has been summarized more often than the stored one its
/// message list replaces the stored list outright, so a compacted tail is
/// never re-appended.
pub fn merge_records(
    existing: Option<&SessionRecord>,
    incoming: &SessionRecord,
    now: DateTime<Utc>,
) -> SessionRecord {
    let mut merged = incoming.clone();
    merged.schema_version = RECORD_SCHEMA_VERSION;

    if let Some(stored) = existing {
        merged.created_at = stored.created_at;
        merged.merge_count = stored.merge_count + 1;

        if incoming.summary_count >= stored.summary_count {
            merged.summary_count = incoming.summary_count;
            merged.summary = incoming.summary.clone().or_else(|| stored.summary.clone());
        } else {
            merged.summary_count = stored.summary_count;
            merged.summary = stored.summary.clone();
        }

        if incoming.summary_count <= stored.summary_count
            && stored.messages.len() > incoming.messages.len()
        {
            merged
                .messages
                .extend_from_slice(&stored.messages[incoming.messages.len()..]);
        }
    }

    merged.message_count = merged.messages.len();
    merged.updated_at = now.max(merged.created_at);
    merged.persisted = true;
    merged.persisted_at = Some(now);
    merged
}

/// Durable tier with merge-on-write, optimistic concurrency and bounded retries
pub struct ArchivalTier {
    store: Arc<dyn ArchiveStore>,
    op_timeout: Duration,
    max_retries: u32,
}

impl ArchivalTier {
    pub fn new(store: Arc<dyn ArchiveStore>, config: &ArchiveConfig) -> Self {
        Self {
            store,
            op_timeout: config.op_timeout(),
            max_retries: config.max_retries,
        }
    }

    /// Open the store selected by `archive.location`
    pub async fn connect(config: &ArchiveConfig) -> SessionResult<Self> {
        let store = open_store(config).await?;
        Ok(Self::new(store, config))
    }

    async fn call<T, F, Fut>(&self, op: &str, mut f: F) -> SessionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SessionResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.op_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::Timeout {
                    tier: Tier::Archive,
                    after: self.op_timeout,
                }),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Archive {} failed (attempt {}/{}): {}",
                        op,
                        attempt,
                        self.max_retries + 1,
                        e
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!("Archive {} failed after {} attempts: {}", op, attempt + 1, e);
                    }
                    return Err(e);
                }
                ok => return ok,
            }
        }
    }

    /// Merge `record` into whatever is archived under `id` and commit it.
    /// Returns the committed record.
    pub async fn save(&self, id: &str, record: &SessionRecord) -> SessionResult<SessionRecord> {
        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            let existing = self.call("load", || self.store.load(id)).await?;
            let now = Utc::now();

            let (merged, condition) = match &existing {
                Some(stored) => (
                    merge_records(Some(&stored.record), record, now),
                    WriteCondition::IfMatch(stored.etag.clone()),
                ),
                None => (merge_records(None, record, now), WriteCondition::IfAbsent),
            };

            match self
                .call("store", || self.store.store(id, &merged, condition.clone()))
                .await
            {
                Ok(_) => {
                    debug!(
                        "Archived {} ({} messages, merge_count={})",
                        id, merged.message_count, merged.merge_count
                    );
                    return Ok(merged);
                }
                Err(SessionError::PreconditionFailed(_)) => {
                    debug!("Concurrent archive write for {} (attempt {})", id, attempt);
                }
                Err(e) => return Err(e),
            }
        }

        warn!("Giving up on archive merge for {}", id);
        Err(SessionError::MergeConflict {
            id: id.to_string(),
            attempts: MAX_MERGE_ATTEMPTS,
        })
    }

    pub async fn get(&self, id: &str) -> SessionResult<Option<SessionRecord>> {
        let stored = self.call("load", || self.store.load(id)).await?;
        Ok(stored.map(|s| s.record))
    }

    pub async fn exists(&self, id: &str) -> SessionResult<bool> {
        Ok(self.get(id).await?.is_some())
    }

    pub async fn delete(&self, id: &str) -> SessionResult<bool> {
        let removed = self.call("remove", || self.store.remove(id)).await?;
        if removed {
            info!("Removed archived session {}", id);
        }
        Ok(removed)
    }

    pub async fn list(&self, limit: usize) -> SessionResult<Vec<ArchivedSummary>> {
        self.call("list", || self.store.list(limit)).await
    }

    pub async fn health(&self) -> ComponentCheck {
        let started = Instant::now();
        match tokio::time::timeout(self.op_timeout, self.store.ping()).await {
            Ok(Ok(())) => ComponentCheck::healthy(COMPONENT, started.elapsed()),
            Ok(Err(e)) => ComponentCheck::with_status(
                COMPONENT,
                HealthStatus::Unhealthy,
                started.elapsed(),
                e.to_string(),
            ),
            Err(_) => ComponentCheck::with_status(
                COMPONENT,
                HealthStatus::Unhealthy,
                started.elapsed(),
                format!("ping timed out after {:?}", self.op_timeout),
            ),
        }
    }
}

/// Pick the store from `archive.location`:
/// `postgres://` or `postgresql://` for Postgres, `memory://` for the
/// in-process store, `file://<dir>` or a bare directory for JSON files.
pub async fn open_store(config: &ArchiveConfig) -> SessionResult<Arc<dyn ArchiveStore>> {
    let location = config.location.trim();
    if location.is_empty() {
        return Err(SessionError::Config("archive.location is empty".into()));
    }

    if location.starts_with("postgres://") || location.starts_with("postgresql://") {
        let store = PgArchiveStore::connect(location, config.pool_max_size).await?;
        info!("✅ Archive store: postgres");
        return Ok(Arc::new(store));
    }

    if location == "memory://" || location.starts_with("memory://") {
        info!("✅ Archive store: in-memory");
        return Ok(Arc::new(MemoryArchiveStore::new()));
    }

    let dir = location.strip_prefix("file://").unwrap_or(location);
    if dir.contains("://") {
        return Err(SessionError::Config(format!(
            "unsupported archive.location scheme: {}",
            location
        )));
    }
    let store = FsArchiveStore::open(dir).await?;
    info!("✅ Archive store: filesystem ({})", dir);
    Ok(Arc::new(store))
}
