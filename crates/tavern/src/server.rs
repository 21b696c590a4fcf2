//! `TavernServer` builder and server loop.
//!
//! This is the entry point for running a Tavern session engine. It ties
//! together all the layers: transport → protocol → session → room →
//! persistence.

use std::future::Future;
use std::sync::Arc;

use tavern_persist::{AlertSink, DocumentStore, LogAlert, PersistConfig, PersistenceBridge};
use tavern_protocol::{Codec, JsonCodec};
use tavern_room::{RoomConfig, RoomStore};
use tavern_session::{Authenticator, ConnectionRegistry};
use tavern_transport::{ConnectionId, Transport, WebSocketTransport};
use tokio::task::JoinSet;

use crate::handler::handle_connection;
use crate::{GatewayConfig, TavernError};

/// Shared server state passed to each connection handler task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. The registry
/// and the room store are themselves cheap handles onto shared tables.
pub(crate) struct ServerState<A, S, C> {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) rooms: RoomStore<S>,
    pub(crate) auth: A,
    pub(crate) codec: C,
    pub(crate) config: GatewayConfig,
}

impl<A, S: DocumentStore, C> ServerState<A, S, C> {
    /// Removes a connection and, if it was in a room, leaves that room.
    ///
    /// Idempotent: only the first call for a connection does anything.
    pub(crate) async fn disconnect(&self, id: ConnectionId) {
        let Some(departure) = self.registry.deregister(id).await else {
            return;
        };
        tracing::info!(
            connection_id = %id,
            user_id = %departure.user_id,
            "connection closed"
        );
        if let Some(room_id) = departure.room {
            if let Err(e) = self
                .rooms
                .leave(&room_id, &departure.user_id, departure.connection_id)
                .await {
                tracing::debug!(%room_id, error = %e, "leave on disconnect failed");
            }
        }
    }
}

/// Builder for configuring and starting a Tavern server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use tavern::prelude::*;
///
/// struct Trusting;
///
/// impl Authenticator for Trusting {
///     async fn authenticate(&self, token: &str) -> Result<VerifiedIdentity, SessionError> {
///         Ok(VerifiedIdentity::valid_for(UserId::new(token), Duration::from_secs(3600)))
///     }
/// }
///
/// # async fn run() -> Result<(), TavernError> {
/// let server = TavernServer::builder()
///     .bind("0.0.0.0:8080")
///     .build(Trusting, Arc::new(MemoryStore::new()))
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct TavernServerBuilder {
    bind_addr: String,
    gateway: GatewayConfig,
    rooms: RoomConfig,
    persistence: PersistConfig,
    alerts: Arc<dyn AlertSink>,
}

impl TavernServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            gateway: GatewayConfig::default(),
            rooms: RoomConfig::default(),
            persistence: PersistConfig::default(),
            alerts: Arc::new(LogAlert),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the per-connection limits.
    pub fn gateway(mut self, config: GatewayConfig) -> Self {
        self.gateway = config;
        self
    }

    /// Sets the settings shared by every room.
    pub fn rooms(mut self, config: RoomConfig) -> Self {
        self.rooms = config;
        self
    }

    /// Sets the storage retry policy.
    pub fn persistence(mut self, config: PersistConfig) -> Self {
        self.persistence = config;
        self
    }

    /// Sets where storage failures are reported. Defaults to [`LogAlert`].
    pub fn alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    /// Binds the listener and wires the layers together.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    pub async fn build<A, S>(
        self,
        auth: A,
        store: Arc<S>,
    ) -> Result<TavernServer<A, S, JsonCodec>, TavernError>
    where
        A: Authenticator,
        S: DocumentStore,
    {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;

        let registry = ConnectionRegistry::new();
        let bridge = PersistenceBridge::new(store, self.alerts, self.persistence);
        let rooms = RoomStore::new(registry.clone(), bridge, self.rooms);

        let state = Arc::new(ServerState {
            registry,
            rooms,
            auth,
            codec: JsonCodec,
            config: self.gateway.validated(),
        });

        Ok(TavernServer { transport, state })
    }
}

impl Default for TavernServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Tavern server.
///
/// Call [`run()`](Self::run) or [`run_until()`](Self::run_until) to start
/// accepting connections.
pub struct TavernServer<A, S, C> {
    transport: WebSocketTransport,
    state: Arc<ServerState<A, S, C>>,
}

impl TavernServer<(), (), ()> {
    /// Creates a new builder.
    pub fn builder() -> TavernServerBuilder {
        TavernServerBuilder::new()
    }
}

impl<A, S, C> TavernServer<A, S, C>
where
    A: Authenticator,
    S: DocumentStore,
    C: Codec,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The live connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.state.registry
    }

    /// The resident rooms.
    pub fn rooms(&self) -> &RoomStore<S> {
        &self.state.rooms
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), TavernError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` completes, then shuts down
    /// gracefully.
    ///
    /// Shutdown stops accepting, asks every connection to close, waits up
    /// to `shutdown_grace` for them, and flushes every resident room to
    /// storage.
    pub async fn run_until(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), TavernError> {
        tracing::info!(addr = ?self.transport.local_addr().ok(), "tavern server listening");

        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        handlers.spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        let closing = self.state.registry.close_all().await;
        tracing::info!(connections = closing, "shutting down");

        let grace = self.state.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = handlers.len(), "connections still open after grace period");
            handlers.abort_all();
        }

        self.state.rooms.drain().await;
        tracing::info!("tavern server stopped");
        Ok(())
    }
}
