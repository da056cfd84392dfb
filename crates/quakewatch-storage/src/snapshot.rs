use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sha256_hex;

/// Last successfully fetched copy of the source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub body: Vec<u8>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SourceSnapshot {
    pub fn new(body: Vec<u8>, fetched_at: DateTime<Utc>, ttl: Duration) -> Self {
        let content_hash = sha256_hex(&body);
        Self {
            body,
            content_hash,
            fetched_at,
            expires_at: fetched_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Byte-for-byte comparison against the cached body.
    pub fn matches(&self, body: &[u8]) -> bool {
        self.body == body
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SourceSnapshot>, SnapshotError>;
    async fn put(&self, key: &str, snapshot: SourceSnapshot) -> Result<(), SnapshotError>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, SourceSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<SourceSnapshot>, SnapshotError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, snapshot: SourceSnapshot) -> Result<(), SnapshotError> {
        self.entries.lock().await.insert(key.to_string(), snapshot);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta {
    content_hash: String,
    fetched_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Snapshot store shared across processes through the filesystem.
///
/// Each key maps to `<key>.body` and `<key>.meta.json`. Both are written to a
/// temp file first and renamed into place. A body that does not match the
/// digest recorded in the metadata reads as a miss.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.body", sanitize_key(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.meta.json", sanitize_key(key)))
    }

    async fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(target)(err));
        }
        Ok(())
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, SnapshotError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path)(err)),
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<SourceSnapshot>, SnapshotError> {
        let meta_path = self.meta_path(key);
        let Some(meta_bytes) = read_optional(&meta_path).await? else {
            return Ok(None);
        };
        let Some(body) = read_optional(&self.body_path(key)).await? else {
            return Ok(None);
        };

        let meta: SnapshotMeta = match serde_json::from_slice(&meta_bytes) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %meta_path.display(), error = %err, "ignoring unreadable snapshot metadata");
                return Ok(None);
            }
        };

        let content_hash = sha256_hex(&body);
        if content_hash != meta.content_hash {
            debug!(key, "snapshot body does not match recorded digest, treating as miss");
            return Ok(None);
        }

        Ok(Some(SourceSnapshot {
            body,
            content_hash,
            fetched_at: meta.fetched_at,
            expires_at: meta.expires_at,
        }))
    }

    async fn put(&self, key: &str, snapshot: SourceSnapshot) -> Result<(), SnapshotError> {
        let meta = SnapshotMeta {
            content_hash: snapshot.content_hash.clone(),
            fetched_at: snapshot.fetched_at,
            expires_at: snapshot.expires_at,
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;

        self.write_atomic(&self.body_path(key), &snapshot.body)
            .await?;
        self.write_atomic(&self.meta_path(key), &meta_bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts)
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn snapshot_expiry_is_inclusive_of_the_deadline() {
        let snap = SourceSnapshot::new(b"<html/>".to_vec(), at("2025-03-28T06:00:00Z"), Duration::hours(24));
        assert!(!snap.is_expired(at("2025-03-29T05:59:59Z")));
        assert!(snap.is_expired(at("2025-03-29T06:00:00Z")));
    }

    #[test]
    fn huge_ttl_saturates_instead_of_overflowing() {
        let snap = SourceSnapshot::new(b"x".to_vec(), at("2025-03-28T06:00:00Z"), Duration::MAX);
        assert_eq!(snap.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!snap.is_expired(Utc::now()));
    }

    #[test]
    fn one_byte_difference_is_a_change() {
        let snap = SourceSnapshot::new(b"<td>4.5</td>".to_vec(), Utc::now(), Duration::hours(1));
        assert!(snap.matches(b"<td>4.5</td>"));
        assert!(!snap.matches(b"<td>4.6</td>"));
    }

    #[tokio::test]
    async fn memory_store_round_trips_by_key() {
        let store = MemorySnapshotStore::new();
        assert!(store.get("tmd").await.expect("get").is_none());

        let snap = SourceSnapshot::new(b"body".to_vec(), Utc::now(), Duration::hours(1));
        store.put("tmd", snap.clone()).await.expect("put");
        assert_eq!(store.get("tmd").await.expect("get"), Some(snap));
        assert!(store.get("other").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn file_store_is_shared_between_instances() {
        let dir = tempdir().expect("tempdir");
        let fetched_at = at("2026-02-24T12:00:00Z");
        let snap = SourceSnapshot::new(b"<html>same</html>".to_vec(), fetched_at, Duration::hours(24));

        FileSnapshotStore::new(dir.path())
            .put("tmd-home", snap.clone())
            .await
            .expect("put");

        let reopened = FileSnapshotStore::new(dir.path());
        let loaded = reopened.get("tmd-home").await.expect("get").expect("present");
        assert_eq!(loaded, snap);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn file_store_treats_tampered_body_as_miss() {
        let dir = tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(dir.path());
        let snap = SourceSnapshot::new(b"original".to_vec(), Utc::now(), Duration::hours(1));
        store.put("tmd", snap).await.expect("put");

        std::fs::write(dir.path().join("tmd.body"), b"changed").expect("overwrite");
        assert!(store.get("tmd").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn file_store_miss_on_empty_directory() {
        let dir = tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(dir.path().join("not-created-yet"));
        assert!(store.get("tmd").await.expect("get").is_none());
    }
}
