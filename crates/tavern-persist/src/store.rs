//! The document store seam and an in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tavern_protocol::{Delta, RoomId, Snapshot};

use crate::StorageError;

/// Durable storage for room snapshots and deltas.
///
/// Each room has at most one snapshot (the latest) and a log of deltas
/// keyed by `to_version`. Implementations must make both writes
/// idempotent: appending the same delta twice or writing an older
/// snapshot must not corrupt what is stored.
pub trait DocumentStore: Send + Sync + 'static {
    /// The room's latest snapshot, or `None` if none was ever written.
    fn find_snapshot(
        &self,
        room_id: &RoomId,
    ) -> impl Future<Output = Result<Option<Snapshot>, StorageError>> + Send;

    /// Deltas with `to_version > version`, ordered by version.
    fn find_deltas_after(
        &self,
        room_id: &RoomId,
        version: u64,
    ) -> impl Future<Output = Result<Vec<Delta>, StorageError>> + Send;

    /// Appends one delta to the room's log.
    fn append_delta(&self, delta: &Delta) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Replaces the room's snapshot and drops deltas it covers.
    ///
    /// A snapshot older than the stored one is ignored.
    fn write_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Documents {
    snapshots: HashMap<RoomId, Snapshot>,
    deltas: HashMap<RoomId, BTreeMap<u64, Delta>>,
    fail_loads: u32,
    fail_appends: u32,
    fail_snapshots: u32,
    load_delay: Duration,
    appends: u64,
    snapshot_writes: u64,
}

fn take_failure(counter: &mut u32) -> Result<(), StorageError> {
    if *counter > 0 {
        *counter -= 1;
        Err(StorageError::Transient("injected failure".into()))
    } else {
        Ok(())
    }
}

/// A [`DocumentStore`] kept in process memory.
///
/// For tests and single-process demos. Failures can be injected with the
/// `fail_next_*` methods; each call makes that many upcoming operations
/// return [`StorageError::Transient`]. [`delay_loads`](Self::delay_loads)
/// stands in for a slow backend.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<Documents>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn docs(&self) -> std::sync::MutexGuard<'_, Documents> {
        // A panic while holding the lock leaves plain maps behind; keep going.
        self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `n` snapshot/delta reads fail.
    pub fn fail_next_loads(&self, n: u32) {
        self.docs().fail_loads = n;
    }

    /// Makes every snapshot read wait `delay` first.
    pub fn delay_loads(&self, delay: Duration) {
        self.docs().load_delay = delay;
    }

    /// Makes the next `n` delta appends fail.
    pub fn fail_next_appends(&self, n: u32) {
        self.docs().fail_appends = n;
    }

    /// Makes the next `n` snapshot writes fail.
    pub fn fail_next_snapshots(&self, n: u32) {
        self.docs().fail_snapshots = n;
    }

    /// The stored snapshot for a room.
    pub fn snapshot(&self, room_id: &RoomId) -> Option<Snapshot> {
        self.docs().snapshots.get(room_id).cloned()
    }

    /// The stored deltas for a room, in version order.
    pub fn deltas(&self, room_id: &RoomId) -> Vec<Delta> {
        self.docs()
            .deltas
            .get(room_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Successful delta appends so far.
    pub fn append_count(&self) -> u64 {
        self.docs().appends
    }

    /// Successful snapshot writes so far.
    pub fn snapshot_count(&self) -> u64 {
        self.docs().snapshot_writes
    }
}

impl DocumentStore for MemoryStore {
    async fn find_snapshot(&self, room_id: &RoomId) -> Result<Option<Snapshot>, StorageError> {
        let delay = self.docs().load_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut docs = self.docs();
        take_failure(&mut docs.fail_loads)?;
        Ok(docs.snapshots.get(room_id).cloned())
    }

    async fn find_deltas_after(
        &self,
        room_id: &RoomId,
        version: u64,
    ) -> Result<Vec<Delta>, StorageError> {
        let mut docs = self.docs();
        take_failure(&mut docs.fail_loads)?;
        Ok(docs
            .deltas
            .get(room_id)
            .map(|log| log.range(version + 1..).map(|(_, d)| d.clone()).collect())
            .unwrap_or_default())
    }

    async fn append_delta(&self, delta: &Delta) -> Result<(), StorageError> {
        let mut docs = self.docs();
        take_failure(&mut docs.fail_appends)?;
        docs.deltas
            .entry(delta.room_id.clone())
            .or_default()
            .insert(delta.to_version, delta.clone());
        docs.appends += 1;
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut docs = self.docs();
        take_failure(&mut docs.fail_snapshots)?;
        let newer = docs
            .snapshots
            .get(&snapshot.room_id)
            .is_none_or(|existing| existing.version <= snapshot.version);
        if newer {
            docs.snapshots
                .insert(snapshot.room_id.clone(), snapshot.clone());
            if let Some(log) = docs.deltas.get_mut(&snapshot.room_id) {
                log.retain(|version, _| *version > snapshot.version);
            }
        }
        docs.snapshot_writes += 1;
        Ok(())
    }
}
