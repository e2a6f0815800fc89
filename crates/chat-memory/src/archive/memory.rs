use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ArchiveStore, StoredRecord, WriteCondition};
use crate::models::{ArchivedSummary, SessionRecord};
use crate::utils::{SessionError, SessionResult};

/// In-process archive, used for `memory://` and in tests.
/// Etags come from a store-wide version counter.
#[derive(Default)]
pub struct MemoryArchiveStore {
    records: DashMap<String, StoredRecord>,
    version: AtomicU64,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn next_etag(&self) -> String {
        (self.version.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn load(&self, id: &str) -> SessionResult<Option<StoredRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn store(
        &self,
        id: &str,
        record: &SessionRecord,
        condition: WriteCondition,
    ) -> SessionResult<String> {
        let etag = self.next_etag();
        let stored = StoredRecord {
            record: record.clone(),
            etag: etag.clone(),
        };

        match (self.records.entry(id.to_string()), condition) {
            (Entry::Vacant(slot), WriteCondition::IfAbsent) => {
                slot.insert(stored);
            }
            (Entry::Occupied(mut slot), WriteCondition::IfMatch(expected))
                if slot.get().etag == expected =>
            {
                slot.insert(stored);
            }
            _ => return Err(SessionError::PreconditionFailed(id.to_string())),
        }
        Ok(etag)
    }

    async fn remove(&self, id: &str) -> SessionResult<bool> {
        Ok(self.records.remove(id).is_some())
    }

    async fn list(&self, limit: usize) -> SessionResult<Vec<ArchivedSummary>> {
        let mut rows: Vec<ArchivedSummary> = self
            .records
            .iter()
            .map(|r| ArchivedSummary::from_record(r.key().clone(), &r.value().record))
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn ping(&self) -> SessionResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Thread;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_conditional_writes() {
        let store = MemoryArchiveStore::new();
        let record = SessionRecord::new(Utc::now(), &Thread::new());

        let etag = store
            .store("a", &record, WriteCondition::IfAbsent)
            .await
            .unwrap();
        assert!(matches!(
            store.store("a", &record, WriteCondition::IfAbsent).await,
            Err(SessionError::PreconditionFailed(_))
        ));
        assert!(matches!(
            store
                .store("a", &record, WriteCondition::IfMatch("stale".into()))
                .await,
            Err(SessionError::PreconditionFailed(_))
        ));

        let next = store
            .store("a", &record, WriteCondition::IfMatch(etag.clone()))
            .await
            .unwrap();
        assert_ne!(next, etag);
        assert_eq!(store.load("a").await.unwrap().unwrap().etag, next);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let store = MemoryArchiveStore::new();
        let now = Utc::now();
        for (id, age) in [("old", 60), ("new", 0), ("mid", 30)] {
            let mut record = SessionRecord::new(now - Duration::minutes(120), &Thread::new());
            record.updated_at = now - Duration::minutes(age);
            store
                .store(id, &record, WriteCondition::IfAbsent)
                .await
                .unwrap();
        }

        let ids: Vec<_> = store
            .list(2)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.conversation_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "mid".to_string()]);
        assert!(store.remove("old").await.unwrap());
        assert!(!store.remove("old").await.unwrap());
    }
}
