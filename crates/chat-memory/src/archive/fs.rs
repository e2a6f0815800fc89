use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{ArchiveStore, StoredRecord, WriteCondition};
use crate::models::{ArchivedSummary, SessionRecord};
use crate::utils::{SessionError, SessionResult, Tier};

const EXTENSION: &str = "json";
/// Marks a file name carrying a hex-encoded id
const ENCODED_MARKER: char = '~';

fn io_error(context: &str, err: std::io::Error) -> SessionError {
    SessionError::connectivity(Tier::Archive, format!("{}: {}", context, err))
}

fn etag_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn is_plain_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn file_stem_for(id: &str) -> String {
    if is_plain_id(id) {
        id.to_string()
    } else {
        format!("{}{}", ENCODED_MARKER, hex::encode(id.as_bytes()))
    }
}

fn id_from_stem(stem: &str) -> Option<String> {
    match stem.strip_prefix(ENCODED_MARKER) {
        Some(encoded) => hex::decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok()),
        None => Some(stem.to_string()),
    }
}

/// One JSON document per conversation under a directory.
///
/// Etag is the SHA-256 of the stored bytes. Writes go to a temp file and are
/// renamed into place, serialised per id within this process.
pub struct FsArchiveStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FsArchiveStore {
    pub async fn open(root: impl AsRef<Path>) -> SessionResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error("create archive directory", e))?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", file_stem_for(id), EXTENSION))
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_bytes(path: &Path) -> SessionResult<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read archive document", e)),
        }
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    async fn load(&self, id: &str) -> SessionResult<Option<StoredRecord>> {
        let Some(bytes) = Self::read_bytes(&self.path_for(id)).await? else {
            return Ok(None);
        };
        let record = SessionRecord::from_slice(&bytes)?;
        Ok(Some(StoredRecord {
            record,
            etag: etag_of(&bytes),
        }))
    }

    async fn store(
        &self,
        id: &str,
        record: &SessionRecord,
        condition: WriteCondition,
    ) -> SessionResult<String> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let path = self.path_for(id);
        let current = Self::read_bytes(&path).await?.map(|b| etag_of(&b));
        let allowed = match (&condition, &current) {
            (WriteCondition::IfAbsent, None) => true,
            (WriteCondition::IfMatch(expected), Some(actual)) => expected == actual,
            _ => false,
        };
        if !allowed {
            return Err(SessionError::PreconditionFailed(id.to_string()));
        }

        let bytes = serde_json::to_vec_pretty(record)?;
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", file_stem_for(id), Uuid::new_v4().simple()));
        replace_atomically(&tmp, &path, &bytes).await?;
        Ok(etag_of(&bytes))
    }

    async fn remove(&self, id: &str) -> SessionResult<bool> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("remove archive document", e)),
        }
    }

    async fn list(&self, limit: usize) -> SessionResult<Vec<ArchivedSummary>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error("list archive directory", e))?;

        let mut rows = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_error("list archive directory", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(id_from_stem)
            else {
                continue;
            };
            let Some(bytes) = Self::read_bytes(&path).await? else {
                continue;
            };
            match SessionRecord::from_slice(&bytes) {
                Ok(record) => rows.push(ArchivedSummary::from_record(id, &record)),
                Err(e) => warn!("Skipping unreadable archive document {}: {}", path.display(), e),
            }
        }

        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn ping(&self) -> SessionResult<()> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| io_error("stat archive directory", e))?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(SessionError::connectivity(
                Tier::Archive,
                format!("{} is not a directory", self.root.display()),
            ))
        }
    }
}

/// Write `bytes` to `tmp` and rename it over `path`. A failed write or
/// rename never leaves the temp file behind.
async fn replace_atomically(tmp: &Path, path: &Path, bytes: &[u8]) -> SessionResult<()> {
    let result = match tokio::fs::write(tmp, bytes).await {
        Ok(()) => tokio::fs::rename(tmp, path)
            .await
            .map_err(|e| io_error("replace archive document", e)),
        Err(e) => Err(io_error("write temp document", e)),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(tmp).await;
    }
    result
}
