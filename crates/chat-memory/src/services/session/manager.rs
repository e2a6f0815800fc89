use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::locks::{SessionGuard, SessionLocks};
use super::scheduler::{PersistLedger, PersistPolicy, PersistReport, PersistScheduler};
use super::summarizer::{CompletionProvider, Summarizer};
use super::token_counter::TokenCounter;
use crate::archive::ArchivalTier;
use crate::cache::CacheTier;
use crate::config::{Settings, SummarizationConfig};
use crate::models::{
    ChatListItem, ChatMessage, ComponentCheck, ConversationId, HealthReport, HealthStatus,
    ListSource, SessionRecord, SessionStats, Thread, RECORD_SCHEMA_VERSION,
};
use crate::services::llm_service::LlmCompletionService;
use crate::utils::{SessionError, SessionResult};

/// In-process state of one live conversation
#[derive(Debug, Clone)]
struct Session {
    thread: Thread,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    merge_count: u64,
    persisted_at: Option<DateTime<Utc>>,
    summary: Option<String>,
    summary_count: u32,
}

impl Session {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            thread: Thread::new(),
            created_at: now,
            updated_at: now,
            last_accessed: now,
            merge_count: 0,
            persisted_at: None,
            summary: None,
            summary_count: 0,
        }
    }

    fn from_record(record: SessionRecord) -> Self {
        Self {
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_accessed: Utc::now(),
            merge_count: record.merge_count,
            persisted_at: record.persisted_at,
            summary: record.summary.clone(),
            summary_count: record.summary_count,
            thread: record.into_thread(),
        }
    }

    fn to_record(&self, persisted: bool) -> SessionRecord {
        SessionRecord {
            schema_version: RECORD_SCHEMA_VERSION,
            created_at: self.created_at,
            updated_at: self.updated_at,
            persisted,
            persisted_at: self.persisted_at,
            merge_count: self.merge_count,
            message_count: self.thread.len(),
            messages: self.thread.messages.clone(),
            summary: self.summary.clone(),
            summary_count: self.summary_count,
        }
    }

    /// Record a mutation; `updated_at` strictly increases so every change
    /// is distinguishable from the last archived version.
    fn touch(&mut self) {
        let now = Utc::now();
        let floor = self.updated_at + ChronoDuration::microseconds(1);
        self.updated_at = now.max(floor);
        self.last_accessed = now;
    }
}

/// Result of a delete in one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TierOutcome {
    Deleted,
    NotFound,
    Disabled,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub conversation_id: ConversationId,
    pub memory: TierOutcome,
    pub cache: TierOutcome,
    pub archive: TierOutcome,
}

impl DeleteReport {
    /// True when at least one tier held the conversation
    pub fn deleted(&self) -> bool {
        [&self.memory, &self.cache, &self.archive]
            .iter()
            .any(|o| **o == TierOutcome::Deleted)
    }

    pub fn has_failures(&self) -> bool {
        [&self.memory, &self.cache, &self.archive]
            .iter()
            .any(|o| matches!(o, TierOutcome::Failed(_)))
    }
}

struct BackgroundTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<PersistReport>,
}

/// Facade over the in-process table, cache tier, archival tier,
/// summarizer and background persister.
pub struct SessionManager {
    sessions: DashMap<ConversationId, Session>,
    cache: Option<Arc<CacheTier>>,
    archive: Option<Arc<ArchivalTier>>,
    summarizer: Option<Summarizer>,
    summarization: SummarizationConfig,
    locks: Arc<SessionLocks>,
    ledger: Arc<PersistLedger>,
    scheduler: Option<Arc<PersistScheduler>>,
    background: parking_lot::Mutex<Option<BackgroundTask>>,
    shutdown_timeout: Duration,
    closed: AtomicBool,
}

impl SessionManager {
    /// Assemble a manager from already-built tiers.
    ///
    /// Pass `None` for a tier to disable it. The persist policy is parsed
    /// here so a bad value fails at startup.
    pub fn new(
        cache: Option<Arc<CacheTier>>,
        archive: Option<Arc<ArchivalTier>>,
        completion: Option<Arc<dyn CompletionProvider>>,
        settings: &Settings,
    ) -> SessionResult<Self> {
        let locks = Arc::new(SessionLocks::new());
        let ledger = Arc::new(PersistLedger::new());

        let scheduler = match (&cache, &archive) {
            (Some(cache), Some(archive)) => {
                let policy = PersistPolicy::parse(&settings.archive.persist_policy)?;
                policy.check_against(cache.ttl())?;
                Some(Arc::new(PersistScheduler::new(
                    cache.clone(),
                    archive.clone(),
                    locks.clone(),
                    ledger.clone(),
                    policy,
                    settings.archive.poll_interval_seconds.map(Duration::from_secs),
                )))
            }
            _ => None,
        };

        let summarizer = match completion {
            Some(provider) if settings.summarization.enabled => Some(Summarizer::new(
                provider,
                Duration::from_secs(settings.summarization.timeout_seconds),
            )),
            _ => None,
        };

        Ok(Self {
            sessions: DashMap::new(),
            cache,
            archive,
            summarizer,
            summarization: settings.summarization.clone(),
            locks,
            ledger,
            scheduler,
            background: parking_lot::Mutex::new(None),
            shutdown_timeout: settings.archive.shutdown_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    /// Wire the default Redis cache, configured archive store and HTTP
    /// completion service from settings.
    pub async fn from_settings(settings: &Settings) -> SessionResult<Self> {
        let cache = settings
            .cache
            .enabled
            .then(|| Arc::new(CacheTier::connect(&settings.cache)));

        let archive = if settings.archive.enabled {
            Some(Arc::new(ArchivalTier::connect(&settings.archive).await?))
        } else {
            None
        };

        let completion: Option<Arc<dyn CompletionProvider>> = if settings.summarization.enabled {
            let service = LlmCompletionService::new(settings.llm.clone())
                .map_err(|e| SessionError::Config(e.to_string()))?;
            Some(Arc::new(service))
        } else {
            None
        };

        info!(
            "Session manager ready (cache={}, archive={}, summarization={})",
            cache.is_some(),
            archive.is_some(),
            completion.is_some()
        );
        Self::new(cache, archive, completion, settings)
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    /// Ids are opaque and used exactly as given; only a missing or empty id
    /// starts a new conversation.
    fn resolve_id(id: Option<&str>) -> (ConversationId, bool) {
        match id {
            Some(id) if !id.is_empty() => (id.to_string(), false),
            _ => (Uuid::new_v4().to_string(), true),
        }
    }

    /// Look a conversation up tier by tier, creating it under `id` when it
    /// exists nowhere. Caller holds the id's lock.
    async fn load_or_create(&self, id: &str) -> SessionResult<Thread> {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.last_accessed = Utc::now();
            return Ok(session.thread.clone());
        }

        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(id).await {
                match SessionRecord::from_slice(&bytes) {
                    Ok(record) => {
                        debug!("Session {} restored from cache", id);
                        let session = Session::from_record(record);
                        let thread = session.thread.clone();
                        self.sessions.insert(id.to_string(), session);
                        return Ok(thread);
                    }
                    Err(e) => warn!("Ignoring unreadable cached session {}: {}", id, e),
                }
            }
        }

        if let Some(archive) = &self.archive {
            if let Some(record) = archive.get(id).await? {
                debug!("Session {} restored from archive", id);
                self.ledger.record(id, record.updated_at);
                let session = Session::from_record(record);
                if let Some(cache) = &self.cache {
                    let payload = session.to_record(true).to_vec()?;
                    cache.set(id, &payload, cache.ttl()).await;
                }
                let thread = session.thread.clone();
                self.sessions.insert(id.to_string(), session);
                return Ok(thread);
            }
        }

        info!("Created new session {}", id);
        self.sessions.insert(id.to_string(), Session::fresh());
        Ok(Thread::new())
    }

    /// Return the thread for `id`, creating the conversation if needed.
    /// Without an id a fresh conversation with a generated id is started.
    pub async fn get_or_create_thread(
        &self,
        id: Option<&str>,
    ) -> SessionResult<(ConversationId, Thread)> {
        self.ensure_open()?;
        let (id, generated) = Self::resolve_id(id);
        if generated {
            info!("Created new session {}", id);
            self.sessions.insert(id.clone(), Session::fresh());
            return Ok((id, Thread::new()));
        }

        let _guard = self.locks.acquire(&id).await;
        let thread = self.load_or_create(&id).await?;
        Ok((id, thread))
    }

    /// Replace the in-process thread and write it through. Caller holds the lock.
    async fn store_locked(&self, id: &str, thread: Thread) -> SessionResult<()> {
        let record = {
            let mut session = self
                .sessions
                .entry(id.to_string())
                .or_insert_with(Session::fresh);
            session.thread = thread;
            session.touch();
            session.to_record(self.ledger.contains(id))
        };
        self.write_through(id, record).await
    }

    async fn write_through(&self, id: &str, record: SessionRecord) -> SessionResult<()> {
        if let Some(cache) = &self.cache {
            cache.set(id, &record.to_vec()?, cache.ttl()).await;
            debug!("Session {} cached ({} messages)", id, record.message_count);
            return Ok(());
        }

        if let Some(archive) = &self.archive {
            let committed = archive.save(id, &record).await?;
            self.mark_persisted(id, &record, &committed);
            return Ok(());
        }

        Ok(())
    }

    fn mark_persisted(&self, id: &str, sent: &SessionRecord, committed: &SessionRecord) {
        self.ledger.record(id, sent.updated_at);
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.merge_count = committed.merge_count;
            session.persisted_at = committed.persisted_at;
        }
    }

    /// Save the caller's thread for `id`: cache when enabled, otherwise the
    /// archive, otherwise in-process only.
    pub async fn save_thread(&self, id: &str, thread: &Thread) -> SessionResult<()> {
        self.ensure_open()?;
        let _guard = self.locks.acquire(id).await;
        self.store_locked(id, thread.clone()).await
    }

    /// Archive the current state of `id` immediately
    pub async fn persist_thread(&self, id: &str) -> SessionResult<SessionRecord> {
        self.ensure_open()?;
        let archive = self
            .archive
            .as_ref()
            .ok_or_else(|| SessionError::Config("archival tier is disabled".into()))?;

        let _guard = self.locks.acquire(id).await;
        let live = self
            .sessions
            .get(id)
            .map(|session| session.to_record(self.ledger.contains(id)));
        let record = match live {
            Some(record) => record,
            None => {
                let cached = match &self.cache {
                    Some(cache) => cache.get(id).await,
                    None => None,
                };
                match cached {
                    Some(bytes) => SessionRecord::from_slice(&bytes)?,
                    None => return Err(SessionError::NotFound(id.to_string())),
                }
            }
        };

        let committed = archive.save(id, &record).await?;
        self.mark_persisted(id, &record, &committed);
        info!(
            "Persisted {} on request ({} messages, merge_count={})",
            id, committed.message_count, committed.merge_count
        );
        Ok(committed)
    }

    /// Hold `id` for one request: load, mutate, commit
    pub async fn begin_turn(&self, id: Option<&str>) -> SessionResult<SessionTurn<'_>> {
        self.ensure_open()?;
        let (id, _) = Self::resolve_id(id);
        let guard = self.locks.acquire(&id).await;
        let thread = self.load_or_create(&id).await?;
        Ok(SessionTurn {
            manager: self,
            id,
            thread,
            _guard: guard,
        })
    }

    /// Append one message to `id` and save it. Returns the updated thread.
    pub async fn append_message(&self, id: &str, message: ChatMessage) -> SessionResult<Thread> {
        let mut turn = self.begin_turn(Some(id)).await?;
        turn.push(message);
        let thread = turn.thread().clone();
        turn.commit().await?;
        Ok(thread)
    }

    pub fn needs_summarization(&self, id: &str) -> bool {
        if self.summarizer.is_none() {
            return false;
        }
        self.sessions
            .get(id)
            .map(|s| Summarizer::needs_summarization(&s.thread, self.summarization.max_tokens))
            .unwrap_or(false)
    }

    /// Compact `id` when it is over budget. Returns whether the thread was
    /// replaced; on error the thread is left exactly as it was.
    pub async fn summarize_if_needed(&self, id: &str) -> SessionResult<bool> {
        self.ensure_open()?;
        let Some(summarizer) = &self.summarizer else {
            return Ok(false);
        };

        let _guard = self.locks.acquire(id).await;
        let Some(thread) = self.sessions.get(id).map(|s| s.thread.clone()) else {
            return Ok(false);
        };
        if !Summarizer::needs_summarization(&thread, self.summarization.max_tokens) {
            return Ok(false);
        }

        info!("Starting summarization for {}", id);
        let Some(outcome) = summarizer
            .summarize(
                &thread,
                self.summarization.target_tokens,
                self.summarization.recent_keep_count,
            )
            .await?
        else {
            return Ok(false);
        };

        let record = {
            let mut session = self
                .sessions
                .entry(id.to_string())
                .or_insert_with(Session::fresh);
            session.thread = outcome.thread;
            session.summary = Some(outcome.summary);
            session.summary_count += 1;
            session.touch();
            session.to_record(self.ledger.contains(id))
        };
        self.write_through(id, record).await?;

        info!(
            "Session {} summarized ({} -> {} tokens)",
            id, outcome.tokens_before, outcome.tokens_after
        );
        Ok(true)
    }

    pub fn get_session_stats(&self, id: &str) -> Option<SessionStats> {
        let session = self.sessions.get(id)?;
        let estimated = TokenCounter::count_thread(&session.thread);
        Some(SessionStats {
            conversation_id: id.to_string(),
            created_at: session.created_at,
            last_accessed: session.last_accessed,
            message_count: session.thread.len(),
            estimated_token_count: estimated,
            max_tokens: self.summarization.max_tokens,
            needs_summarization: self.summarizer.is_some()
                && estimated > self.summarization.max_tokens,
            summary_count: session.summary_count,
            persisted: self.ledger.is_current(id, session.updated_at),
        })
    }

    /// Live and archived conversations, newest first
    pub async fn list_chats(
        &self,
        source: ListSource,
        limit: usize,
    ) -> SessionResult<Vec<ChatListItem>> {
        self.ensure_open()?;
        let mut items: HashMap<ConversationId, ChatListItem> = HashMap::new();

        if matches!(source, ListSource::Cache | ListSource::All) {
            for entry in self.sessions.iter() {
                let session = entry.value();
                items.insert(
                    entry.key().clone(),
                    ChatListItem {
                        conversation_id: entry.key().clone(),
                        active: true,
                        persisted: self.ledger.contains(entry.key()),
                        created_at: Some(session.created_at),
                        updated_at: Some(session.updated_at),
                        message_count: Some(session.thread.len()),
                    },
                );
            }

            if let Some(cache) = &self.cache {
                for id in cache.list("").await {
                    if items.contains_key(&id) {
                        continue;
                    }
                    let record = cache
                        .get(&id)
                        .await
                        .and_then(|bytes| SessionRecord::from_slice(&bytes).ok());
                    items.insert(
                        id.clone(),
                        ChatListItem {
                            persisted: self.ledger.contains(&id)
                                || record.as_ref().is_some_and(|r| r.persisted),
                            active: true,
                            created_at: record.as_ref().map(|r| r.created_at),
                            updated_at: record.as_ref().map(|r| r.updated_at),
                            message_count: record.as_ref().map(|r| r.messages.len()),
                            conversation_id: id,
                        },
                    );
                }
            }
        }

        if matches!(source, ListSource::Archival | ListSource::All) {
            if let Some(archive) = &self.archive {
                match archive.list(limit).await {
                    Ok(rows) => {
                        for row in rows {
                            let item = items.entry(row.conversation_id.clone()).or_insert_with(|| {
                                ChatListItem {
                                    conversation_id: row.conversation_id.clone(),
                                    active: self.sessions.contains_key(&row.conversation_id),
                                    persisted: true,
                                    created_at: None,
                                    updated_at: None,
                                    message_count: None,
                                }
                            });
                            item.persisted = true;
                            item.created_at.get_or_insert(row.created_at);
                            item.updated_at.get_or_insert(row.updated_at);
                            item.message_count.get_or_insert(row.message_count);
                        }
                    }
                    Err(e) if source == ListSource::All => {
                        warn!("Archive listing unavailable, returning live sessions only: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mut items: Vec<ChatListItem> = items.into_values().collect();
        items.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        items.truncate(limit);
        Ok(items)
    }

    /// Remove `id` from every tier, reporting each one
    pub async fn delete_chat_detailed(&self, id: &str) -> SessionResult<DeleteReport> {
        self.ensure_open()?;
        let guard = self.locks.acquire(id).await;

        let memory = if self.sessions.remove(id).is_some() {
            TierOutcome::Deleted
        } else {
            TierOutcome::NotFound
        };

        let cache = match &self.cache {
            None => TierOutcome::Disabled,
            Some(cache) => {
                if cache.delete(id).await {
                    TierOutcome::Deleted
                } else {
                    TierOutcome::NotFound
                }
            }
        };

        let archive = match &self.archive {
            None => TierOutcome::Disabled,
            Some(archive) => match archive.delete(id).await {
                Ok(true) => TierOutcome::Deleted,
                Ok(false) => TierOutcome::NotFound,
                Err(e) => {
                    warn!("Failed to delete archived session {}: {}", id, e);
                    TierOutcome::Failed(e.to_string())
                }
            },
        };

        self.ledger.forget(id);
        drop(guard);
        self.locks.prune();

        let report = DeleteReport {
            conversation_id: id.to_string(),
            memory,
            cache,
            archive,
        };
        info!(
            "Deleted session {} (memory={:?}, cache={:?}, archive={:?})",
            id, report.memory, report.cache, report.archive
        );
        Ok(report)
    }

    pub async fn delete_chat(&self, id: &str) -> SessionResult<bool> {
        Ok(self.delete_chat_detailed(id).await?.deleted())
    }

    /// Spawn the background persister. Returns false when it is already
    /// running or when cache and archive are not both enabled.
    pub fn start_background_persist(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let Some(scheduler) = &self.scheduler else {
            debug!("Background persist not started: needs both cache and archive");
            return false;
        };

        let mut background = self.background.lock();
        if background.is_some() {
            return false;
        }
        let (shutdown, rx) = watch::channel(false);
        let handle = scheduler.clone().spawn(rx);
        *background = Some(BackgroundTask { shutdown, handle });
        true
    }

    /// Run one persist cycle inline
    pub async fn persist_due_sessions(&self) -> PersistReport {
        match &self.scheduler {
            Some(scheduler) => scheduler.run_cycle().await,
            None => PersistReport::default(),
        }
    }

    /// Archive live sessions whose latest change is not archived yet
    async fn flush_sessions(&self) -> PersistReport {
        let mut report = PersistReport::default();
        let Some(archive) = &self.archive else {
            return report;
        };

        let ids: Vec<ConversationId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _guard = self.locks.acquire(&id).await;
            let Some(record) = self.sessions.get(&id).map(|s| s.to_record(true)) else {
                continue;
            };
            if record.messages.is_empty() || self.ledger.is_current(&id, record.updated_at) {
                report.skipped += 1;
                continue;
            }
            match archive.save(&id, &record).await {
                Ok(committed) => {
                    self.mark_persisted(&id, &record, &committed);
                    report.persisted += 1;
                }
                Err(e) => {
                    warn!("Failed to persist {} on close: {}", id, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Stop the background persister and archive everything outstanding,
    /// bounded by the shutdown timeout. Later calls are no-ops.
    pub async fn close(&self) -> PersistReport {
        if self.closed.swap(true, Ordering::AcqRel) {
            return PersistReport::default();
        }
        info!("Closing session manager");

        let task = self.background.lock().take();
        let abort = task.as_ref().map(|t| t.handle.abort_handle());

        let work = async move {
            let mut report = PersistReport::default();
            match task {
                Some(task) => {
                    let _ = task.shutdown.send(true);
                    match task.handle.await {
                        Ok(drained) => report.absorb(drained),
                        Err(e) => warn!("Background persist task ended abnormally: {}", e),
                    }
                }
                None => {
                    if let Some(scheduler) = &self.scheduler {
                        report.absorb(scheduler.drain().await);
                    }
                }
            }
            report.absorb(self.flush_sessions().await);
            report
        };

        let report = match tokio::time::timeout(self.shutdown_timeout, work).await {
            Ok(report) => report,
            Err(_) => {
                warn!(
                    "Shutdown flush exceeded {:?}, abandoning remaining work",
                    self.shutdown_timeout
                );
                if let Some(abort) = abort {
                    abort.abort();
                }
                PersistReport::default()
            }
        };

        self.sessions.clear();
        self.locks.prune();
        info!("Session manager closed ({})", report);
        report
    }

    pub async fn health(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(2);
        match &self.cache {
            Some(cache) => checks.push(cache.health().await),
            None => checks.push(ComponentCheck::with_status(
                "cache",
                HealthStatus::Healthy,
                Duration::ZERO,
                "disabled",
            )),
        }
        match &self.archive {
            Some(archive) => checks.push(archive.health().await),
            None => checks.push(ComponentCheck::with_status(
                "archive",
                HealthStatus::Healthy,
                Duration::ZERO,
                "disabled",
            )),
        }
        HealthReport::from_checks(checks)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// One request's exclusive hold on a conversation.
///
/// Mutations stay local until [`SessionTurn::commit`]; dropping the turn
/// without committing discards them and releases the lock.
pub struct SessionTurn<'a> {
    manager: &'a SessionManager,
    id: ConversationId,
    thread: Thread,
    _guard: SessionGuard,
}

impl<'a> SessionTurn<'a> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn thread_mut(&mut self) -> &mut Thread {
        &mut self.thread
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.thread.push(message);
    }

    pub async fn commit(self) -> SessionResult<()> {
        self.manager.ensure_open()?;
        self.manager.store_locked(&self.id, self.thread).await
    }
}
