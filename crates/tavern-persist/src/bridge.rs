//! The persistence bridge between live rooms and a [`DocumentStore`].
//!
//! Three operations:
//!
//! - [`load`](PersistenceBridge::load): rebuild a room from its snapshot
//!   plus the deltas logged after it.
//! - [`DeltaWriter::persist`]: fire-and-forget mirroring of each accepted
//!   delta through a per-room writer task.
//! - [`flush`](PersistenceBridge::flush): an awaited full-snapshot write,
//!   used when a room is evicted or the server drains.
//!
//! # Degraded mode
//!
//! When a write exhausts its retry budget, the writer raises an alert and
//! marks itself degraded. While degraded it drops plain deltas (appending
//! them would leave a hole in the log) and waits for a job that carries a
//! snapshot. The room checks [`DeltaWriter::needs_snapshot`] and attaches
//! one to its next delta, so the first successful write after an outage
//! closes the gap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tavern_protocol::{Delta, RoomId, Snapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Alert, AlertSink, DocumentStore, PersistConfig, PersistError, RetryPolicy};

/// A room rebuilt from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Rehydrated {
    /// State at the newest version that could be reconstructed.
    pub snapshot: Snapshot,
    /// The deltas applied on top of the stored snapshot, in order.
    pub replayed: Vec<Delta>,
}

/// Connects rooms to durable storage.
pub struct PersistenceBridge<S> {
    store: Arc<S>,
    alerts: Arc<dyn AlertSink>,
    config: PersistConfig,
}

impl<S> Clone for PersistenceBridge<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            alerts: Arc::clone(&self.alerts),
            config: self.config.clone(),
        }
    }
}

impl<S: DocumentStore> PersistenceBridge<S> {
    pub fn new(store: Arc<S>, alerts: Arc<dyn AlertSink>, config: PersistConfig) -> Self {
        Self {
            store,
            alerts,
            config: config.validated(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Rebuilds a room from storage.
    ///
    /// Returns `Ok(None)` if the room has never been stored. Deltas are
    /// replayed in version order on top of the snapshot (or an empty room if
    /// only deltas exist); replay stops at the first version gap.
    ///
    /// # Errors
    /// [`PersistError`] if the store stays unavailable. An alert is raised
    /// before returning.
    pub async fn load(&self, room_id: &RoomId) -> Result<Option<Rehydrated>, PersistError> {
        let result = self.read(room_id).await;
        if let Err(error) = &result {
            self.alerts.alert(Alert {
                room_id: room_id.clone(),
                error: error.clone(),
            });
        }
        result
    }

    async fn read(&self, room_id: &RoomId) -> Result<Option<Rehydrated>, PersistError> {
        let policy = &self.config.retry;
        let store = &*self.store;

        let stored = policy
            .run("load snapshot", room_id, move || store.find_snapshot(room_id))
            .await?;
        let base = stored.as_ref().map_or(0, |s| s.version);
        let deltas = policy
            .run("load deltas", room_id, move || store.find_deltas_after(room_id, base))
            .await?;

        if stored.is_none() && deltas.is_empty() {
            return Ok(None);
        }

        let mut snapshot = stored.unwrap_or_else(|| Snapshot::empty(room_id.clone()));
        let mut replayed = Vec::new();
        for delta in deltas {
            if delta.to_version <= snapshot.version {
                continue;
            }
            if delta.from_version != snapshot.version {
                tracing::warn!(
                    %room_id,
                    at = snapshot.version,
                    next = delta.from_version,
                    "gap in stored deltas, stopping replay"
                );
                break;
            }
            snapshot.apply(&delta);
            replayed.push(delta);
        }

        tracing::info!(
            %room_id,
            version = snapshot.version,
            replayed = replayed.len(),
            "room rehydrated"
        );
        Ok(Some(Rehydrated { snapshot, replayed }))
    }

    /// Starts the background writer for one room.
    pub fn spawn_writer(&self, room_id: RoomId) -> DeltaWriter {
        let (jobs, rx) = mpsc::unbounded_channel();
        let degraded = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_writer(
            Arc::clone(&self.store),
            Arc::clone(&self.alerts),
            self.config.retry.clone(),
            room_id.clone(),
            rx,
            Arc::clone(&degraded),
        ));
        DeltaWriter {
            room_id,
            jobs,
            degraded,
            task,
        }
    }

    /// Writes a full snapshot and waits for the result.
    ///
    /// # Errors
    /// [`PersistError`] once retries are exhausted. An alert is raised
    /// before returning.
    pub async fn flush(&self, snapshot: &Snapshot) -> Result<(), PersistError> {
        let store = &*self.store;
        let result = self
            .config
            .retry
            .run("flush snapshot", &snapshot.room_id, move || {
                store.write_snapshot(snapshot)
            })
            .await;
        match &result {
            Ok(()) => tracing::debug!(
                room_id = %snapshot.room_id,
                version = snapshot.version,
                "snapshot flushed"
            ),
            Err(error) => self.alerts.alert(Alert {
                room_id: snapshot.room_id.clone(),
                error: error.clone(),
            }),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// DeltaWriter
// ---------------------------------------------------------------------------

struct WriteJob {
    delta: Delta,
    snapshot: Option<Snapshot>,
}

/// Handle to a room's background writer.
///
/// Jobs are written strictly in submission order.
pub struct DeltaWriter {
    room_id: RoomId,
    jobs: mpsc::UnboundedSender<WriteJob>,
    degraded: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl DeltaWriter {
    /// Queues a delta for durable storage without waiting.
    ///
    /// With a `snapshot` (taken at `delta.to_version`), the snapshot is
    /// written instead of the delta.
    pub fn persist(&self, delta: Delta, snapshot: Option<Snapshot>) {
        if self.jobs.send(WriteJob { delta, snapshot }).is_err() {
            tracing::warn!(room_id = %self.room_id, "writer stopped, delta not queued");
        }
    }

    /// Returns `true` while the writer is waiting for a snapshot to recover
    /// from a failed write.
    pub fn needs_snapshot(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Cancels pending writes and waits for the task to stop.
    pub async fn abandon(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run_writer<S: DocumentStore>(
    store: Arc<S>,
    alerts: Arc<dyn AlertSink>,
    policy: RetryPolicy,
    room_id: RoomId,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    degraded: Arc<AtomicBool>,
) {
    let store = &*store;
    while let Some(WriteJob { delta, snapshot }) = jobs.recv().await {
        let result = match &snapshot {
            Some(snap) => {
                policy
                    .run("write snapshot", &room_id, move || store.write_snapshot(snap))
                    .await
            }
            None if degraded.load(Ordering::Acquire) => {
                tracing::debug!(%room_id, version = delta.to_version, "delta held back until snapshot");
                continue;
            }
            None => {
                let delta = &delta;
                policy
                    .run("append delta", &room_id, move || store.append_delta(delta))
                    .await
            }
        };

        match result {
            Ok(()) => {
                if snapshot.is_some() && degraded.swap(false, Ordering::AcqRel) {
                    tracing::info!(%room_id, version = delta.to_version, "persistence recovered");
                }
            }
            Err(error) => {
                degraded.store(true, Ordering::Release);
                alerts.alert(Alert {
                    room_id: room_id.clone(),
                    error,
                });
            }
        }
    }
}
