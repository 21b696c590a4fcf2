//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on an OS-assigned port and drive it with a
//! `tokio-tungstenite` client, so frames actually cross a socket.

#[cfg(feature = "websocket")]
mod websocket {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tavern_transport::{Connection, Transport, WebSocketConnection, WebSocketTransport};
    use tokio_tungstenite::tungstenite::Message;

    type ClientWs = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    /// Binds a transport on port 0, connects one client, and returns both ends.
    async fn connected_pair() -> (WebSocketConnection, ClientWs) {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr");

        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("client should connect");
        let conn = server.await.expect("accept task");
        (conn, client)
    }

    #[tokio::test]
    async fn test_websocket_send_and_receive_text_frames() {
        let (conn, mut client) = connected_pair().await;
        assert!(conn.id().into_inner() > 0);

        conn.send(br#"{"type":"pong"}"#).await.expect("send");
        let msg = client.next().await.expect("frame").expect("ok");
        assert!(msg.is_text(), "JSON should travel as a text frame");
        assert_eq!(msg.into_text().expect("utf8").as_str(), r#"{"type":"pong"}"#);

        client
            .send(Message::text(r#"{"type":"ping"}"#.to_owned()))
            .await
            .expect("client send");
        let received = conn.recv().await.expect("recv").expect("data");
        assert_eq!(received, br#"{"type":"ping"}"#);

        conn.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_client_close() {
        let (conn, mut client) = connected_pair().await;

        client.send(Message::Close(None)).await.expect("close frame");

        let result = conn.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }

    #[tokio::test]
    async fn test_websocket_pending_recv_does_not_block_send() {
        let (conn, mut client) = connected_pair().await;
        let conn = Arc::new(conn);

        // Park a reader on the connection; the client sends nothing yet.
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), conn.send(b"{}"))
            .await
            .expect("send must not wait for the parked reader")
            .expect("send");
        let msg = client.next().await.expect("frame").expect("ok");
        assert_eq!(msg.into_data().as_ref(), b"{}");

        client.send(Message::Close(None)).await.expect("close frame");
        let read = reader.await.expect("reader task").expect("recv");
        assert!(read.is_none());
    }
}
