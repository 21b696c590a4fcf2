//! Per-connection handler: authentication, room membership, and message
//! routing.
//!
//! Each accepted connection gets its own Tokio task running this handler,
//! plus a writer task that drains the connection's outbound queue. The
//! flow is:
//!   1. Receive `auth` → verify the token → send `authenticated`
//!   2. Register with the connection registry (replacing any older
//!      session of the same user)
//!   3. Loop: receive frames → join, leave, act, chat, list members, ping
//!   4. On close, kick, idle timeout, or token expiry → deregister and
//!      leave the room

use std::sync::Arc;
use std::time::Duration;

use tavern_persist::DocumentStore;
use tavern_protocol::{
    Action, ActionRequest, ClientMessage, Codec, ErrorCode, RoomId, ServerMessage, UserId,
};
use tavern_session::{Authenticator, ConnectionState, Outbound, SessionError, VerifiedIdentity};
use tavern_transport::{Connection, ConnectionId, WebSocketConnection};
use tokio::sync::mpsc;

use crate::error::error_code;
use crate::server::ServerState;
use crate::TavernError;

/// How long the writer may keep flushing queued frames after the
/// connection is released.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Drop guard that disconnects a connection when the handler exits.
///
/// The normal path calls [`release`](Self::release). If the handler
/// panics or is aborted instead, `Drop` spawns the cleanup, since it
/// cannot await.
struct ConnectionGuard<A: Authenticator, S: DocumentStore, C: Codec> {
    id: ConnectionId,
    state: Option<Arc<ServerState<A, S, C>>>,
}

impl<A: Authenticator, S: DocumentStore, C: Codec> ConnectionGuard<A, S, C> {
    async fn release(mut self) {
        if let Some(state) = self.state.take() {
            state.disconnect(self.id).await;
        }
    }
}

impl<A: Authenticator, S: DocumentStore, C: Codec> Drop for ConnectionGuard<A, S, C> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let id = self.id;
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { state.disconnect(id).await });
            }
        }
    }
}

/// The per-connection view of who is talking and where they are.
struct Session {
    id: ConnectionId,
    user_id: UserId,
    state: ConnectionState,
}

impl Session {
    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "illegal transition {} → {next}",
            self.state
        );
        tracing::trace!(connection_id = %self.id, from = %self.state, to = %next, "state change");
        self.state = next;
    }

    /// The room the connection is joined to, if it matches `room_id`.
    fn joined_to(&self, room_id: &RoomId) -> bool {
        self.state.room() == Some(room_id)
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<A, S, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<A, S, C>>,
) -> Result<(), TavernError>
where
    A: Authenticator,
    S: DocumentStore,
    C: Codec,
{
    let conn_id = conn.id();
    tracing::debug!(connection_id = %conn_id, peer = %conn.peer_addr(), "handling new connection");

    // --- Step 1: authenticate ---
    let identity = match authenticate(&conn, &state).await {
        Ok(identity) => identity,
        Err(e) => {
            let _ = conn.close().await;
            return Err(e);
        }
    };
    let user_id = identity.user_id.clone();
    tracing::info!(connection_id = %conn_id, %user_id, "user authenticated");

    // --- Step 2: register ---
    let (outbound, queue) = mpsc::channel(state.config.outbound_buffer);
    let registration = state.registry.register(conn_id, user_id.clone(), outbound).await;
    let guard = ConnectionGuard {
        id: conn_id,
        state: Some(Arc::clone(&state)),
    };

    let conn = Arc::new(conn);
    let writer = tokio::spawn(write_frames(
        Arc::clone(&conn),
        Arc::clone(&state),
        queue,
        Arc::clone(&registration.kick),
    ));

    if let Some(replaced) = registration.replaced {
        if let Some(room_id) = replaced.room {
            if let Err(e) = state.rooms.leave(&room_id, &user_id, replaced.connection_id).await {
                tracing::debug!(%room_id, error = %e, "leave for replaced session failed");
            }
        }
    }
    reply(&state, conn_id, ServerMessage::Authenticated { user_id: user_id.clone() }).await;

    let mut session = Session {
        id: conn_id,
        user_id,
        state: ConnectionState::Unauthenticated,
    };
    session.advance(ConnectionState::Authenticated);

    // --- Step 3: message loop ---
    let idle_timeout = state.config.idle_timeout;
    let idle = tokio::time::sleep(idle_timeout);
    let expiry = tokio::time::sleep(identity.remaining().unwrap_or(Duration::ZERO));
    tokio::pin!(idle, expiry);

    loop {
        let data = tokio::select! {
            received = conn.recv() => match received {
                Ok(Some(data)) => data,
                Ok(None) => {
                    tracing::debug!(connection_id = %conn_id, "connection closed cleanly");
                    break;
                }
                Err(e) => {
                    tracing::debug!(connection_id = %conn_id, error = %e, "recv error");
                    break;
                }
            },
            _ = registration.kick.notified() => {
                tracing::info!(connection_id = %conn_id, "connection kicked");
                break;
            }
            _ = &mut idle => {
                tracing::info!(connection_id = %conn_id, "connection idle, closing");
                reply(&state, conn_id, ServerMessage::error(ErrorCode::Timeout, "no activity")).await;
                break;
            }
            _ = &mut expiry => {
                tracing::info!(connection_id = %conn_id, user_id = %session.user_id, "identity expired");
                let msg = ServerMessage::error(ErrorCode::AuthenticationFailure, "token expired");
                reply(&state, conn_id, msg).await;
                break;
            }
        };

        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
        state.registry.touch(conn_id).await;

        let msg: ClientMessage = match state.codec.decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(connection_id = %conn_id, error = %e, "failed to decode frame");
                let msg = ServerMessage::error(ErrorCode::BadRequest, e.to_string());
                reply(&state, conn_id, msg).await;
                continue;
            }
        };

        dispatch(&state, &mut session, msg).await;
    }

    // --- Step 4: tear down ---
    session.advance(ConnectionState::Closed);
    guard.release().await;
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        tracing::debug!(connection_id = %conn_id, "writer did not drain in time");
    }
    let _ = conn.close().await;
    Ok(())
}

/// Runs the handshake under `auth_timeout`. The window covers both the
/// wait for the `auth` frame and the verifier call.
async fn authenticate<A, S, C>(
    conn: &WebSocketConnection,
    state: &ServerState<A, S, C>,
) -> Result<VerifiedIdentity, TavernError>
where
    A: Authenticator,
    C: Codec,
{
    match tokio::time::timeout(state.config.auth_timeout, verify(conn, state)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(connection_id = %conn.id(), "authentication timed out");
            send_direct(conn, &state.codec, ServerMessage::error(ErrorCode::Timeout, "auth timed out"))
                .await?;
            Err(TavernError::Timeout("auth"))
        }
    }
}

/// Waits for the `auth` frame and verifies its token.
async fn verify<A, S, C>(
    conn: &WebSocketConnection,
    state: &ServerState<A, S, C>,
) -> Result<VerifiedIdentity, TavernError>
where
    A: Authenticator,
    C: Codec,
{
    let data = match conn.recv().await {
        Ok(Some(data)) => data,
        Ok(None) => {
            return Err(TavernError::Handshake("connection closed before auth".into()));
        }
        Err(e) => return Err(TavernError::Transport(e)),
    };

    let token = match state.codec.decode::<ClientMessage>(&data) {
        Ok(ClientMessage::Auth { token }) => token,
        _ => {
            let msg = ServerMessage::error(ErrorCode::BadRequest, "first message must be auth");
            send_direct(conn, &state.codec, msg).await?;
            return Err(TavernError::Handshake("first message must be auth".into()));
        }
    };

    let identity = match state.auth.authenticate(&token).await {
        Ok(identity) if !identity.is_expired() => identity,
        Ok(_) => {
            let msg = ServerMessage::error(ErrorCode::AuthenticationFailure, "token expired");
            send_direct(conn, &state.codec, msg).await?;
            return Err(TavernError::Session(SessionError::Expired));
        }
        Err(e) => {
            tracing::debug!(connection_id = %conn.id(), error = %e, "authentication failed");
            let msg = ServerMessage::error(ErrorCode::AuthenticationFailure, "unauthorized");
            send_direct(conn, &state.codec, msg).await?;
            return Err(TavernError::Session(e));
        }
    };

    Ok(identity)
}

/// Handles one decoded client message.
async fn dispatch<A, S, C>(state: &ServerState<A, S, C>, session: &mut Session, msg: ClientMessage)
where
    S: DocumentStore,
{
    let conn_id = session.id;
    match msg {
        ClientMessage::Auth { .. } => {
            let msg = ServerMessage::error(ErrorCode::BadRequest, "already authenticated");
            reply(state, conn_id, msg).await;
        }

        ClientMessage::Ping => reply(state, conn_id, ServerMessage::Pong).await,

        ClientMessage::Join { room_id } => join(state, session, room_id).await,

        ClientMessage::Leave { room_id } => {
            let current = session.state.room().cloned();
            match (current, room_id) {
                (Some(current), requested) if requested.as_ref().is_none_or(|r| *r == current) => {
                    leave_current(state, session, &current).await;
                    reply(state, conn_id, ServerMessage::Left { room_id: current }).await;
                }
                _ => {
                    let msg = ServerMessage::error(ErrorCode::NotJoined, "not joined to that room");
                    reply(state, conn_id, msg).await;
                }
            }
        }

        ClientMessage::Action { room_id, payload } => {
            if !session.joined_to(&room_id) {
                let msg = ServerMessage::error(ErrorCode::NotJoined, format!("not joined to {room_id}"));
                reply(state, conn_id, msg).await;
                return;
            }
            let ActionRequest { kind, payload } = payload;
            let action = Action {
                room_id,
                user_id: session.user_id.clone(),
                kind,
                payload,
            };
            // On success the room has already broadcast the delta.
            if let Err(e) = state.rooms.apply_action(action).await {
                tracing::debug!(connection_id = %conn_id, error = %e, "action rejected");
                reply(state, conn_id, ServerMessage::error(error_code(&e), e.to_string())).await;
            }
        }

        ClientMessage::Chat { room_id, text } => {
            if !session.joined_to(&room_id) {
                let msg = ServerMessage::error(ErrorCode::NotJoined, format!("not joined to {room_id}"));
                reply(state, conn_id, msg).await;
                return;
            }
            // On success the room has already broadcast the line, author included.
            if let Err(e) = state.rooms.chat(&room_id, &session.user_id, text).await {
                tracing::debug!(connection_id = %conn_id, error = %e, "chat rejected");
                reply(state, conn_id, ServerMessage::error(error_code(&e), e.to_string())).await;
            }
        }

        ClientMessage::ChatHistory { room_id, limit } => {
            match state.rooms.chat_history(&room_id, &session.user_id, limit).await {
                Ok(messages) => {
                    reply(state, conn_id, ServerMessage::ChatHistory { room_id, messages }).await;
                }
                Err(e) => {
                    reply(state, conn_id, ServerMessage::error(error_code(&e), e.to_string())).await;
                }
            }
        }

        ClientMessage::Members { room_id } => {
            match state.rooms.members(&room_id, &session.user_id).await {
                Ok(users) => reply(state, conn_id, ServerMessage::Members { room_id, users }).await,
                Err(e) => {
                    reply(state, conn_id, ServerMessage::error(error_code(&e), e.to_string())).await;
                }
            }
        }
    }
}

async fn join<A, S: DocumentStore, C>(
    state: &ServerState<A, S, C>,
    session: &mut Session,
    room_id: RoomId,
) {
    let conn_id = session.id;

    // A connection belongs to at most one room.
    if let Some(current) = session.state.room().cloned() {
        if current != room_id {
            leave_current(state, session, &current).await;
        }
    }

    let joining = state.rooms.join(&room_id, &session.user_id, conn_id);
    match tokio::time::timeout(state.config.join_timeout, joining).await {
        Ok(Ok(outcome)) => {
            tracing::debug!(
                connection_id = %conn_id,
                %room_id,
                version = outcome.snapshot.version,
                rejoin = !outcome.newly_joined,
                "joined room"
            );
            // The room sent the snapshot before replying.
            session.advance(ConnectionState::Joined(room_id));
        }
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %conn_id, %room_id, error = %e, "join failed");
            reply(state, conn_id, ServerMessage::error(error_code(&e), e.to_string())).await;
        }
        Err(_) => {
            // The room drops or undoes the queued join once it sees nobody
            // is waiting for the reply.
            tracing::warn!(connection_id = %conn_id, %room_id, "join timed out");
            let msg = ServerMessage::error(ErrorCode::Timeout, format!("joining {room_id} timed out"));
            reply(state, conn_id, msg).await;
        }
    }
}

/// Leaves the connection's current room. The registry is detached first so
/// no delta from the room reaches the connection afterwards.
async fn leave_current<A, S: DocumentStore, C>(
    state: &ServerState<A, S, C>,
    session: &mut Session,
    room_id: &RoomId,
) {
    state.registry.detach(session.id).await;
    if let Err(e) = state.rooms.leave(room_id, &session.user_id, session.id).await {
        tracing::debug!(%room_id, error = %e, "leave failed");
    }
    session.advance(ConnectionState::Authenticated);
}

/// Queues a message for this connection behind anything already queued.
async fn reply<A, S, C>(state: &ServerState<A, S, C>, id: ConnectionId, msg: ServerMessage) {
    if !state.registry.send_to(id, msg).await {
        tracing::debug!(connection_id = %id, "reply dropped");
    }
}

/// Sends a message straight to the socket, before the connection has an
/// outbound queue.
async fn send_direct(
    conn: &WebSocketConnection,
    codec: &impl Codec,
    msg: ServerMessage,
) -> Result<(), TavernError> {
    let bytes = codec.encode(&msg)?;
    conn.send(&bytes).await?;
    Ok(())
}

/// Drains the outbound queue onto the socket until every sender is gone.
async fn write_frames<A, S, C: Codec>(
    conn: Arc<WebSocketConnection>,
    state: Arc<ServerState<A, S, C>>,
    mut queue: mpsc::Receiver<Outbound>,
    kick: Arc<tokio::sync::Notify>,
) {
    while let Some(msg) = queue.recv().await {
        let bytes = match state.codec.encode(&*msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(connection_id = %conn.id(), error = %e, "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = conn.send(&bytes).await {
            tracing::debug!(connection_id = %conn.id(), error = %e, "send failed");
            kick.notify_one();
            break;
        }
    }
}
