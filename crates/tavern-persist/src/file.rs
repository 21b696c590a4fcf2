//! A [`DocumentStore`] backed by JSON files on local disk.
//!
//! Layout, one directory per room:
//!
//! ```text
//! <root>/<room-id>/snapshot.json   latest snapshot, replaced atomically
//! <root>/<room-id>/deltas.jsonl    one delta per line, appended
//! ```
//!
//! Room ids are restricted to `[A-Za-z0-9_-]`, so they are safe as
//! directory names.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tavern_protocol::{Delta, RoomId, Snapshot};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{DocumentStore, StorageError};

const SNAPSHOT_FILE: &str = "snapshot.json";
const DELTAS_FILE: &str = "deltas.jsonl";

fn io_error(e: std::io::Error) -> StorageError {
    StorageError::Transient(e.to_string())
}

/// Stores rooms as JSON documents under a root directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Uses `root` as the data directory, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(io_error)?;
        tracing::info!(root = %root.display(), "file store opened");
        Ok(Self { root })
    }

    fn room_dir(&self, room_id: &RoomId) -> PathBuf {
        self.root.join(room_id.as_str())
    }

    async fn read_snapshot(&self, room_id: &RoomId) -> Result<Option<Snapshot>, StorageError> {
        let path = self.room_dir(room_id).join(SNAPSHOT_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Fatal(format!("{}: {e}", path.display())))
    }

    async fn read_deltas(&self, room_id: &RoomId) -> Result<Vec<Delta>, StorageError> {
        let path = self.room_dir(room_id).join(DELTAS_FILE);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };
        let mut deltas = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Delta>(line) {
                Ok(delta) => deltas.push(delta),
                // A torn final line from an interrupted append.
                Err(e) => tracing::warn!(
                    %room_id,
                    line = n + 1,
                    error = %e,
                    "skipping unreadable delta record"
                ),
            }
        }
        deltas.sort_by_key(|d| d.to_version);
        deltas.dedup_by_key(|d| d.to_version);
        Ok(deltas)
    }

    /// Writes `contents` to `path` through a temporary file and a rename.
    async fn replace(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents).await.map_err(io_error)?;
        fs::rename(&tmp, path).await.map_err(io_error)
    }
}

impl DocumentStore for JsonFileStore {
    async fn find_snapshot(&self, room_id: &RoomId) -> Result<Option<Snapshot>, StorageError> {
        self.read_snapshot(room_id).await
    }

    async fn find_deltas_after(
        &self,
        room_id: &RoomId,
        version: u64,
    ) -> Result<Vec<Delta>, StorageError> {
        let mut deltas = self.read_deltas(room_id).await?;
        deltas.retain(|d| d.to_version > version);
        Ok(deltas)
    }

    async fn append_delta(&self, delta: &Delta) -> Result<(), StorageError> {
        let dir = self.room_dir(&delta.room_id);
        fs::create_dir_all(&dir).await.map_err(io_error)?;

        let mut line = serde_json::to_vec(delta).map_err(|e| StorageError::Fatal(e.to_string()))?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(DELTAS_FILE))
            .await
            .map_err(io_error)?;
        file.write_all(&line).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let stored = self.read_snapshot(&snapshot.room_id).await?;
        if stored.is_some_and(|existing| existing.version > snapshot.version) {
            return Ok(());
        }

        let dir = self.room_dir(&snapshot.room_id);
        fs::create_dir_all(&dir).await.map_err(io_error)?;
        let body = serde_json::to_vec_pretty(snapshot).map_err(|e| StorageError::Fatal(e.to_string()))?;
        Self::replace(&dir.join(SNAPSHOT_FILE), &body).await?;

        // Drop deltas the snapshot now covers.
        let remaining: Vec<Delta> = self
            .read_deltas(&snapshot.room_id)
            .await?
            .into_iter()
            .filter(|d| d.to_version > snapshot.version)
            .collect();
        let mut log = Vec::new();
        for delta in &remaining {
            serde_json::to_writer(&mut log, delta).map_err(|e| StorageError::Fatal(e.to_string()))?;
            log.push(b'\n');
        }
        Self::replace(&dir.join(DELTAS_FILE), &log).await
    }
}
