//! Room actor: an isolated Tokio task that owns one [`Room`].
//!
//! Every operation on a room is a [`RoomCommand`] sent through the actor's
//! channel, and the actor handles them one at a time. That channel is the
//! room's serialization point: actions are validated and applied in arrival
//! order, and the deltas they produce are broadcast from inside the actor,
//! so every member sees them in version order.
//!
//! Different rooms are different tasks and never contend.

use std::collections::HashMap;
use std::sync::Arc;

use tavern_persist::{DeltaWriter, DocumentStore, PersistError, PersistenceBridge};
use tavern_protocol::{
    Action, ChatEntry, Delta, PresenceEvent, RoomId, ServerMessage, Snapshot, UserId,
};
use tavern_session::ConnectionRegistry;
use tavern_transport::ConnectionId;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;

use crate::chat::ChatLog;
use crate::{Room, RoomConfig, RoomError, RoomState, sync};

/// The table of resident rooms, shared by the store and every actor (an
/// actor removes its own entry when it is evicted).
pub(crate) type RoomTable = Arc<Mutex<HashMap<RoomId, RoomHandle>>>;

/// The result of a successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    /// The state the joining connection was sent.
    pub snapshot: Snapshot,
    /// `false` when the user was already a member.
    pub newly_joined: bool,
}

/// Room metadata (not the table state itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub state: RoomState,
    pub version: u64,
    pub member_count: usize,
}

/// Commands sent to a room actor through its channel.
pub(crate) enum RoomCommand {
    Join {
        user_id: UserId,
        connection_id: ConnectionId,
        reply: oneshot::Sender<Result<JoinOutcome, RoomError>>,
    },
    Leave {
        user_id: UserId,
        connection_id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Apply {
        action: Action,
        reply: oneshot::Sender<Result<Delta, RoomError>>,
    },
    Members {
        user_id: UserId,
        reply: oneshot::Sender<Result<Vec<UserId>, RoomError>>,
    },
    Chat {
        user_id: UserId,
        text: String,
        reply: oneshot::Sender<Result<ChatEntry, RoomError>>,
    },
    ChatHistory {
        user_id: UserId,
        limit: Option<usize>,
        reply: oneshot::Sender<Result<Vec<ChatEntry>, RoomError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Info {
        reply: oneshot::Sender<RoomInfo>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl RoomCommand {
    /// Answers a command that will never be processed.
    fn reject(self, err: RoomError) {
        match self {
            Self::Join { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Apply { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Members { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Chat { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::ChatHistory { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            // Dropping the reply sender tells the caller the room is gone.
            Self::Leave { .. } | Self::Snapshot { .. } | Self::Info { .. } => {}
            Self::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Handle to a running room actor.
///
/// Cheap to clone; it wraps the command sender. The store keeps one per
/// resident room.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    generation: u64,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(make(reply_tx))
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }

    /// Adds `user_id` as a member and sends `connection_id` the snapshot.
    pub async fn join(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<JoinOutcome, RoomError> {
        self.request(|reply| RoomCommand::Join {
            user_id,
            connection_id,
            reply,
        })
        .await?
    }

    /// Removes `user_id` if they joined through `connection_id`. Returns
    /// `false` if they weren't a member or their membership belongs to a
    /// newer connection.
    pub async fn leave(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, RoomError> {
        self.request(|reply| RoomCommand::Leave {
            user_id,
            connection_id,
            reply,
        })
        .await
    }

    /// Validates, applies, and broadcasts an action.
    pub async fn apply(&self, action: Action) -> Result<Delta, RoomError> {
        self.request(|reply| RoomCommand::Apply { action, reply })
            .await?
    }

    /// Members in user id order. Only members may ask.
    pub async fn members(&self, user_id: UserId) -> Result<Vec<UserId>, RoomError> {
        self.request(|reply| RoomCommand::Members { user_id, reply })
            .await?
    }

    /// Posts a chat line and broadcasts it to every member.
    pub async fn chat(&self, user_id: UserId, text: String) -> Result<ChatEntry, RoomError> {
        self.request(|reply| RoomCommand::Chat {
            user_id,
            text,
            reply,
        })
        .await?
    }

    /// Recent chat, oldest first. Only members may ask.
    pub async fn chat_history(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> Result<Vec<ChatEntry>, RoomError> {
        self.request(|reply| RoomCommand::ChatHistory {
            user_id,
            limit,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot, RoomError> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    pub async fn info(&self) -> Result<RoomInfo, RoomError> {
        self.request(|reply| RoomCommand::Info { reply }).await
    }

    /// Flushes the room and stops the actor.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Shutdown { reply }).await
    }
}

/// The actor's private state. Runs inside a Tokio task.
struct RoomActor<S: DocumentStore> {
    room_id: RoomId,
    generation: u64,
    state: RoomState,
    room: Room,
    /// The connection each member joined through. Keys match the room's
    /// member set.
    sessions: HashMap<UserId, ConnectionId>,
    chat: ChatLog,
    config: RoomConfig,
    registry: ConnectionRegistry,
    bridge: PersistenceBridge<S>,
    writer: Option<DeltaWriter>,
    rooms: RoomTable,
    receiver: mpsc::Receiver<RoomCommand>,
    idle_deadline: Option<Instant>,
}

impl<S: DocumentStore> RoomActor<S> {
    async fn run(mut self) {
        match self.bridge.load(&self.room_id).await {
            Ok(Some(loaded)) => {
                self.room =
                    Room::from_snapshot(loaded.snapshot, loaded.replayed, self.config.log_capacity);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(room_id = %self.room_id, error = %err, "room failed to load");
                self.close(err).await;
                return;
            }
        }
        self.advance(RoomState::Active);
        self.writer = Some(self.bridge.spawn_writer(self.room_id.clone()));
        self.arm_idle_timer();
        tracing::info!(room_id = %self.room_id, version = self.room.version(), "room active");

        loop {
            let deadline = self.idle_deadline;
            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let RoomCommand::Shutdown { reply } = cmd {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    self.handle(cmd).await;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.try_evict().await {
                        return;
                    }
                }
            }
        }

        // Every handle was dropped.
        self.shutdown().await;
    }

    fn advance(&mut self, next: RoomState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal room transition {} → {next}",
            self.state
        );
        tracing::trace!(room_id = %self.room_id, from = %self.state, to = %next, "room state change");
        self.state = next;
    }

    fn not_member(&self, user_id: UserId) -> RoomError {
        RoomError::NotMember {
            user_id,
            room_id: self.room_id.clone(),
        }
    }

    async fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                user_id,
                connection_id,
                reply,
            } => {
                // The caller timed out while the command sat in the queue.
                if reply.is_closed() {
                    tracing::debug!(room_id = %self.room_id, %user_id, %connection_id, "join abandoned before it ran");
                    return;
                }
                let rejoin = self.sessions.get(&user_id) == Some(&connection_id);
                let result = self.handle_join(user_id.clone(), connection_id).await;
                let undelivered = matches!(reply.send(result), Err(Ok(_)));
                if undelivered && !rejoin {
                    self.undo_join(user_id, connection_id).await;
                }
            }
            RoomCommand::Leave {
                user_id,
                connection_id,
                reply,
            } => {
                let was_member = self.handle_leave(user_id, connection_id).await;
                let _ = reply.send(was_member);
            }
            RoomCommand::Apply { action, reply } => {
                let result = self.handle_apply(action).await;
                let _ = reply.send(result);
            }
            RoomCommand::Members { user_id, reply } => {
                let result = if self.room.is_member(&user_id) {
                    Ok(self.room.members().iter().cloned().collect())
                } else {
                    Err(self.not_member(user_id))
                };
                let _ = reply.send(result);
            }
            RoomCommand::Chat {
                user_id,
                text,
                reply,
            } => {
                let result = self.handle_chat(user_id, &text).await;
                let _ = reply.send(result);
            }
            RoomCommand::ChatHistory {
                user_id,
                limit,
                reply,
            } => {
                let result = if self.room.is_member(&user_id) {
                    Ok(self.chat.recent(limit))
                } else {
                    Err(self.not_member(user_id))
                };
                let _ = reply.send(result);
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.room.snapshot());
            }
            RoomCommand::Info { reply } => {
                let _ = reply.send(self.info());
            }
            RoomCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_join(
        &mut self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<JoinOutcome, RoomError> {
        let already = self.room.is_member(&user_id);
        if !already && self.room.members().len() >= self.config.max_members {
            return Err(RoomError::RoomFull(self.room_id.clone()));
        }

        // Attach before sending so the snapshot is the first room frame
        // and every later delta reaches this connection.
        self.registry
            .attach(connection_id, self.room_id.clone())
            .await
            .map_err(|_| RoomError::ConnectionGone(connection_id))?;

        let newly_joined = self.room.add_member(user_id.clone());
        let previous = self.sessions.insert(user_id.clone(), connection_id);
        if let Some(previous) = previous.filter(|p| *p != connection_id) {
            tracing::debug!(room_id = %self.room_id, %user_id, from = %previous, to = %connection_id, "membership moved to new connection");
        }
        let snapshot = self.room.snapshot();
        self.registry
            .send_to(connection_id, ServerMessage::snapshot(&snapshot))
            .await;
        self.idle_deadline = None;

        if newly_joined {
            tracing::info!(
                room_id = %self.room_id,
                %user_id,
                members = self.room.members().len(),
                "user joined"
            );
            self.chat.notice(format!("{user_id} has joined."));
            self.registry
                .broadcast(
                    &self.room_id,
                    ServerMessage::Presence {
                        room_id: self.room_id.clone(),
                        user_id,
                        event: PresenceEvent::Joined,
                    },
                    Some(connection_id),
                )
                .await;
        }

        Ok(JoinOutcome {
            snapshot,
            newly_joined,
        })
    }

    async fn handle_leave(&mut self, user_id: UserId, connection_id: ConnectionId) -> bool {
        match self.sessions.get(&user_id) {
            Some(current) if *current == connection_id => {}
            Some(current) => {
                tracing::debug!(
                    room_id = %self.room_id,
                    %user_id,
                    stale = %connection_id,
                    %current,
                    "leave from replaced connection ignored"
                );
                return false;
            }
            None => return false,
        }
        self.sessions.remove(&user_id);
        self.room.remove_member(&user_id);
        self.chat.notice(format!("{user_id} has left."));
        tracing::info!(
            room_id = %self.room_id,
            %user_id,
            members = self.room.members().len(),
            "user left"
        );
        self.registry
            .broadcast(
                &self.room_id,
                ServerMessage::Presence {
                    room_id: self.room_id.clone(),
                    user_id,
                    event: PresenceEvent::Left,
                },
                None,
            )
            .await;
        if self.room.members().is_empty() {
            self.arm_idle_timer();
        }
        true
    }

    /// Reverses a join whose caller stopped waiting for the reply.
    async fn undo_join(&mut self, user_id: UserId, connection_id: ConnectionId) {
        tracing::debug!(room_id = %self.room_id, %user_id, %connection_id, "join abandoned, undoing");
        self.registry.detach_from(connection_id, &self.room_id).await;
        self.handle_leave(user_id, connection_id).await;
    }

    async fn handle_chat(&mut self, user_id: UserId, text: &str) -> Result<ChatEntry, RoomError> {
        if !self.room.is_member(&user_id) {
            return Err(self.not_member(user_id));
        }
        let entry = self.chat.post(user_id, text).map_err(|reason| {
            tracing::debug!(room_id = %self.room_id, %reason, "chat rejected");
            RoomError::InvalidAction(reason.to_string())
        })?;
        self.registry
            .broadcast(
                &self.room_id,
                ServerMessage::ChatMessage {
                    room_id: self.room_id.clone(),
                    message: entry.clone(),
                },
                None,
            )
            .await;
        Ok(entry)
    }

    async fn handle_apply(&mut self, action: Action) -> Result<Delta, RoomError> {
        let user_id = action.user_id.clone();
        let kind = action.kind.clone();
        let delta = sync::apply(&mut self.room, action).map_err(|reason| {
            tracing::debug!(room_id = %self.room_id, %user_id, kind = %kind, %reason, "action rejected");
            RoomError::InvalidAction(reason.to_string())
        })?;

        self.registry
            .broadcast(&self.room_id, ServerMessage::delta(&delta), None)
            .await;

        if let Some(writer) = &self.writer {
            let due = delta.to_version % self.config.snapshot_every == 0;
            let snapshot = (due || writer.needs_snapshot()).then(|| self.room.snapshot());
            writer.persist(delta.clone(), snapshot);
        }

        Ok(delta)
    }

    fn arm_idle_timer(&mut self) {
        if self.room.members().is_empty() {
            self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
        }
    }

    /// Flushes and removes an idle room. Returns `true` if the actor should
    /// stop.
    async fn try_evict(&mut self) -> bool {
        self.advance(RoomState::Evicting);
        self.idle_deadline = None;
        if let Some(writer) = self.writer.take() {
            writer.abandon().await;
        }

        let snapshot = self.room.snapshot();
        if let Err(err) = self.bridge.flush(&snapshot).await {
            tracing::warn!(room_id = %self.room_id, error = %err, "eviction flush failed, room stays resident");
            self.resume();
            return false;
        }

        let mut rooms = self.rooms.lock().await;
        if !self.receiver.is_empty() {
            drop(rooms);
            tracing::debug!(room_id = %self.room_id, "eviction cancelled by pending command");
            self.resume();
            return false;
        }
        if rooms
            .get(&self.room_id)
            .is_some_and(|h| h.generation() == self.generation)
        {
            rooms.remove(&self.room_id);
        }
        self.receiver.close();
        drop(rooms);

        self.advance(RoomState::Closed);
        self.drain_pending();
        tracing::info!(room_id = %self.room_id, version = snapshot.version, "room evicted");
        true
    }

    fn resume(&mut self) {
        self.advance(RoomState::Active);
        self.writer = Some(self.bridge.spawn_writer(self.room_id.clone()));
        self.arm_idle_timer();
    }

    /// Final flush on server drain or when every handle is gone.
    async fn shutdown(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abandon().await;
        }
        if self.bridge.flush(&self.room.snapshot()).await.is_err() {
            tracing::error!(room_id = %self.room_id, "final flush failed");
        }
        self.advance(RoomState::Closed);
        self.receiver.close();
        self.drain_pending();
        tracing::info!(room_id = %self.room_id, "room actor stopped");
    }

    /// Stops accepting commands after a failed load.
    async fn close(&mut self, err: PersistError) {
        let mut rooms = self.rooms.lock().await;
        if rooms
            .get(&self.room_id)
            .is_some_and(|h| h.generation() == self.generation)
        {
            rooms.remove(&self.room_id);
        }
        self.receiver.close();
        drop(rooms);
        self.advance(RoomState::Closed);
        while let Ok(cmd) = self.receiver.try_recv() {
            cmd.reject(RoomError::Storage(err.clone()));
        }
    }

    fn drain_pending(&mut self) {
        while let Ok(cmd) = self.receiver.try_recv() {
            cmd.reject(RoomError::Unavailable(self.room_id.clone()));
        }
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.room_id.clone(),
            state: self.state,
            version: self.room.version(),
            member_count: self.room.members().len(),
        }
    }
}

/// Spawns a room actor and returns its handle.
///
/// The actor loads the room from storage before serving commands; commands
/// sent meanwhile wait in the channel.
pub(crate) fn spawn_room<S: DocumentStore>(
    room_id: RoomId,
    generation: u64,
    config: RoomConfig,
    registry: ConnectionRegistry,
    bridge: PersistenceBridge<S>,
    rooms: RoomTable,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(config.command_buffer);

    let actor = RoomActor {
        room_id: room_id.clone(),
        generation,
        state: RoomState::Loading,
        room: Room::new(room_id.clone(), config.log_capacity),
        sessions: HashMap::new(),
        chat: ChatLog::new(config.chat_history),
        config,
        registry,
        bridge,
        writer: None,
        rooms,
        receiver: rx,
        idle_deadline: None,
    };

    tokio::spawn(actor.run());

    RoomHandle {
        room_id,
        generation,
        sender: tx,
    }
}
