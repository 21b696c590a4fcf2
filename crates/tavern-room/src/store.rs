//! The room store: finds, creates, and routes to room actors.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tavern_persist::{DocumentStore, PersistenceBridge};
use tavern_protocol::{Action, ChatEntry, Delta, RoomId, Snapshot, UserId};
use tavern_session::ConnectionRegistry;
use tavern_transport::ConnectionId;
use tokio::sync::Mutex;

use crate::room::{RoomTable, spawn_room};
use crate::{JoinOutcome, RoomConfig, RoomError, RoomHandle, RoomInfo};

/// How many times a join retries when it races an eviction.
const JOIN_ATTEMPTS: usize = 3;

/// All resident rooms, keyed by room id.
///
/// The table lock guards only the map; it is never held while a room does
/// work or while storage is read. Each room runs as its own actor, so
/// rooms never wait on each other.
pub struct RoomStore<S> {
    rooms: RoomTable,
    registry: ConnectionRegistry,
    bridge: PersistenceBridge<S>,
    config: RoomConfig,
    generations: Arc<AtomicU64>,
}

impl<S> Clone for RoomStore<S> {
    fn clone(&self) -> Self {
        Self {
            rooms: Arc::clone(&self.rooms),
            registry: self.registry.clone(),
            bridge: self.bridge.clone(),
            config: self.config.clone(),
            generations: Arc::clone(&self.generations),
        }
    }
}

impl<S: DocumentStore> RoomStore<S> {
    pub fn new(
        registry: ConnectionRegistry,
        bridge: PersistenceBridge<S>,
        config: RoomConfig,
    ) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            registry,
            bridge,
            config: config.validated(),
            generations: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Returns the room's handle, starting its actor if it isn't resident.
    ///
    /// A new actor rehydrates from storage before it serves commands, so
    /// this returns immediately.
    pub async fn get_or_create(&self, room_id: &RoomId) -> RoomHandle {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(room_id) {
            return handle.clone();
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let handle = spawn_room(
            room_id.clone(),
            generation,
            self.config.clone(),
            self.registry.clone(),
            self.bridge.clone(),
            Arc::clone(&self.rooms),
        );
        rooms.insert(room_id.clone(), handle.clone());
        tracing::debug!(%room_id, generation, "room started");
        handle
    }

    async fn resident(&self, room_id: &RoomId) -> Result<RoomHandle, RoomError> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))
    }

    /// Joins `user_id` to the room (creating or rehydrating it) and sends
    /// `connection_id` the current snapshot.
    ///
    /// Joining a room the user is already in is a no-op apart from the
    /// snapshot being sent again.
    pub async fn join(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        connection_id: ConnectionId,
    ) -> Result<JoinOutcome, RoomError> {
        let mut attempt = 1;
        loop {
            let handle = self.get_or_create(room_id).await;
            match handle.join(user_id.clone(), connection_id).await {
                // The actor was evicted between lookup and send.
                Err(RoomError::Unavailable(_)) if attempt < JOIN_ATTEMPTS => attempt += 1,
                result => return result,
            }
        }
    }

    /// Removes `user_id` from the room on behalf of `connection_id`.
    ///
    /// Returns `false` if they weren't a member, the room isn't resident,
    /// or the membership now belongs to a newer connection of the same
    /// user. A leave that arrives late from a replaced connection is
    /// therefore harmless.
    pub async fn leave(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, RoomError> {
        match self.resident(room_id).await {
            Ok(handle) => match handle.leave(user_id.clone(), connection_id).await {
                Err(RoomError::Unavailable(_)) => Ok(false),
                other => other,
            },
            Err(RoomError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Validates and applies an action to its room, broadcasting the delta
    /// to every member and queueing it for storage.
    ///
    /// # Errors
    /// [`RoomError::NotFound`] if the room isn't resident,
    /// [`RoomError::InvalidAction`] if validation fails.
    pub async fn apply_action(&self, action: Action) -> Result<Delta, RoomError> {
        self.resident(&action.room_id).await?.apply(action).await
    }

    /// Members of the room. Only a member may ask.
    pub async fn members(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Vec<UserId>, RoomError> {
        self.resident(room_id).await?.members(user_id.clone()).await
    }

    /// Posts a chat line to the room and broadcasts it to every member,
    /// the author included.
    ///
    /// # Errors
    /// [`RoomError::NotMember`] unless the author is a member,
    /// [`RoomError::InvalidAction`] for an empty or overlong line.
    pub async fn chat(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        text: String,
    ) -> Result<ChatEntry, RoomError> {
        self.resident(room_id).await?.chat(user_id.clone(), text).await
    }

    /// The room's recent chat, oldest first. Only a member may ask.
    pub async fn chat_history(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        limit: Option<usize>,
    ) -> Result<Vec<ChatEntry>, RoomError> {
        self.resident(room_id)
            .await?
            .chat_history(user_id.clone(), limit)
            .await
    }

    /// The room's current snapshot.
    pub async fn snapshot(&self, room_id: &RoomId) -> Result<Snapshot, RoomError> {
        self.resident(room_id).await?.snapshot().await
    }

    pub async fn info(&self, room_id: &RoomId) -> Result<RoomInfo, RoomError> {
        self.resident(room_id).await?.info().await
    }

    /// Returns `true` if the room is in memory.
    pub async fn is_resident(&self, room_id: &RoomId) -> bool {
        self.rooms.lock().await.contains_key(room_id)
    }

    /// Number of resident rooms.
    pub async fn len(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.lock().await.is_empty()
    }

    /// Flushes every room and stops its actor. Used on graceful shutdown.
    pub async fn drain(&self) {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.drain().map(|(_, h)| h).collect();
        tracing::info!(rooms = handles.len(), "draining rooms");
        for handle in handles {
            if handle.shutdown().await.is_err() {
                tracing::debug!(room_id = %handle.room_id(), "room already stopped");
            }
        }
    }
}
