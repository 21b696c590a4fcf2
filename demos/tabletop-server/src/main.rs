//! A tabletop session server for local play and development.
//!
//! Run with:
//! ```not_rust
//! cargo run -p tabletop-server
//! cargo run -p tabletop-server -- --bind 0.0.0.0:9000 --data-dir ./tables
//! ```
//!
//! Any non-empty token is accepted as the user id, so a client can sign in
//! with `{"type":"auth","token":"alice"}`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tavern::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "tabletop-server")]
#[command(about = "Real-time tabletop session server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Directory for room snapshots and deltas. Rooms live in memory only
    /// when omitted.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Maximum members per room
    #[arg(long, default_value_t = 8)]
    max_members: usize,

    /// Seconds an empty room stays in memory
    #[arg(long, default_value_t = 300)]
    room_idle_secs: u64,
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Trusts the token as the user id. Sessions last one hour.
struct DevAuthenticator;

impl Authenticator for DevAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<VerifiedIdentity, SessionError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SessionError::AuthFailed("empty token".into()));
        }
        Ok(VerifiedIdentity::valid_for(UserId::new(token), Duration::from_secs(3600)))
    }
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("ctrl-c received");
}

fn builder(args: &Args) -> TavernServerBuilder {
    let rooms = RoomConfig {
        max_members: args.max_members,
        idle_timeout: Duration::from_secs(args.room_idle_secs),
        ..RoomConfig::default()
    };
    TavernServer::builder().bind(&args.bind).rooms(rooms)
}

#[tokio::main]
async fn main() -> Result<(), TavernError> {
    let args = Args::parse();
    tavern::logging::init_tracing(env!("CARGO_BIN_NAME"), &args.log_level);
    tracing::warn!("accepting every token as its own user id; do not expose this server");

    match &args.data_dir {
        Some(dir) => {
            let store = JsonFileStore::open(dir.clone()).await?;
            tracing::info!(data_dir = %dir.display(), "storing rooms on disk");
            let server = builder(&args).build(DevAuthenticator, Arc::new(store)).await?;
            server.run_until(shutdown_signal()).await
        }
        None => {
            tracing::info!("storing rooms in memory");
            let server = builder(&args)
                .build(DevAuthenticator, Arc::new(MemoryStore::new()))
                .await?;
            server.run_until(shutdown_signal()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio_tungstenite::tungstenite::Message;

    type Ws = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn start() -> String {
        let server = TavernServer::builder()
            .bind("127.0.0.1:0")
            .build(DevAuthenticator, Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        addr
    }

    async fn ws(addr: &str) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut Ws, value: Value) {
        ws.send(Message::text(value.to_string())).await.unwrap();
    }

    async fn recv(ws: &mut Ws) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn sign_in(addr: &str, user: &str) -> Ws {
        let mut ws = ws(addr).await;
        send(&mut ws, json!({"type": "auth", "token": user})).await;
        assert_eq!(recv(&mut ws).await["type"], "authenticated");
        send(&mut ws, json!({"type": "join", "roomId": "keep"})).await;
        assert_eq!(recv(&mut ws).await["type"], "snapshot");
        ws
    }

    fn action(kind: &str, payload: Value) -> Value {
        json!({"type": "action", "roomId": "keep", "payload": {"type": kind, "payload": payload}})
    }

    #[tokio::test]
    async fn test_dev_authenticator_rejects_blank_token() {
        let result = DevAuthenticator.authenticate("   ").await;
        assert!(matches!(result, Err(SessionError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_turn_passes_between_players() {
        let addr = start().await;
        let mut gm = sign_in(&addr, "gm").await;
        let mut player = sign_in(&addr, "player").await;
        let _ = recv(&mut gm).await; // presence: player joined

        send(&mut gm, action("claimTurn", json!({}))).await;
        let claimed = recv(&mut gm).await;
        assert_eq!(claimed["change"]["entity"], "turn");
        assert_eq!(recv(&mut player).await, claimed);

        send(&mut player, action("setScene", json!({"name": "Crypt"}))).await;
        let rejected = recv(&mut player).await;
        assert_eq!(rejected["code"], "InvalidAction");

        send(&mut gm, action("endTurn", json!({}))).await;
        let _ = recv(&mut gm).await;
        let _ = recv(&mut player).await;

        send(&mut player, action("setScene", json!({"name": "Crypt"}))).await;
        let delta = recv(&mut player).await;
        assert_eq!(delta["toVersion"], 3);
        assert_eq!(recv(&mut gm).await, delta);
    }
}
