//! One accepted client connection: the serialized write side.
//!
//! The read side stays with the endpoint loop that accepted the transport;
//! everything that writes (responses, publish pushes, heartbeat replies)
//! goes through this handle. A per-connection async mutex is held across
//! encode and write, so at most one writer is active at a time and frames
//! never interleave.

use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use ut_protocol::codec::encode_frame;
use ut_protocol::{PONG, UtResponse};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    Ws(axum::Error),
    #[error("serialize: {0}")]
    Json(#[from] serde_json::Error),
}

enum Sender {
    /// Raw stream: responses as frames, heartbeats as bare literals.
    Tcp(Mutex<OwnedWriteHalf>),
    /// WebSocket: one text message per body.
    Ws(Mutex<SplitSink<WebSocket, Message>>),
}

pub struct ClientConnection {
    id: String,
    sender: Sender,
}

impl ClientConnection {
    pub fn from_tcp(write: OwnedWriteHalf) -> Self {
        ClientConnection {
            id: Uuid::new_v4().to_string(),
            sender: Sender::Tcp(Mutex::new(write)),
        }
    }

    pub fn from_ws(sink: SplitSink<WebSocket, Message>) -> Self {
        ClientConnection {
            id: Uuid::new_v4().to_string(),
            sender: Sender::Ws(Mutex::new(sink)),
        }
    }

    /// Opaque subscriber identity, assigned at accept time.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Serialize and write one response body.
    pub async fn send(&self, response: &UtResponse) -> Result<(), SendError> {
        match &self.sender {
            Sender::Tcp(write) => {
                let body = serde_json::to_vec(response)?;
                let frame = encode_frame(response.response_type, response.id, false, &body);
                let mut write = write.lock().await;
                write.write_all(&frame).await?;
                Ok(())
            }
            Sender::Ws(sink) => {
                let text = serde_json::to_string(response)?;
                let mut sink = sink.lock().await;
                sink.send(Message::Text(text.into()))
                    .await
                    .map_err(SendError::Ws)
            }
        }
    }

    /// Answer a heartbeat.
    pub async fn send_pong(&self) -> Result<(), SendError> {
        match &self.sender {
            Sender::Tcp(write) => {
                let mut write = write.lock().await;
                write.write_all(PONG).await?;
                Ok(())
            }
            Sender::Ws(sink) => {
                let mut sink = sink.lock().await;
                sink.send(Message::Text("PONG".into()))
                    .await
                    .map_err(SendError::Ws)
            }
        }
    }

    /// Handshake and teardown texts on the WebSocket transport. No-op frames
    /// never exist on the raw stream, so there this writes the bytes as-is.
    pub async fn send_text(&self, text: &str) -> Result<(), SendError> {
        match &self.sender {
            Sender::Tcp(write) => {
                let mut write = write.lock().await;
                write.write_all(text.as_bytes()).await?;
                Ok(())
            }
            Sender::Ws(sink) => {
                let mut sink = sink.lock().await;
                sink.send(Message::Text(text.to_owned().into()))
                    .await
                    .map_err(SendError::Ws)
            }
        }
    }

    /// Best-effort close. Safe to call more than once.
    pub async fn close(&self) {
        match &self.sender {
            Sender::Tcp(write) => {
                let mut write = write.lock().await;
                let _ = write.shutdown().await;
            }
            Sender::Ws(sink) => {
                let mut sink = sink.lock().await;
                let _ = sink.send(Message::Close(None)).await;
            }
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transport = match &self.sender {
            Sender::Tcp(_) => "tcp",
            Sender::Ws(_) => "ws",
        };
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("transport", &transport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use ut_protocol::UtKind;
    use ut_protocol::codec::FrameDecoder;

    async fn tcp_pair() -> (Arc<ClientConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, _peer) = accepted.expect("accept");
        let (_read, write) = stream.into_split();
        (
            Arc::new(ClientConnection::from_tcp(write)),
            client.expect("connect"),
        )
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave_frames() {
        let (conn, mut peer) = tcp_pair().await;

        // Many tasks hammering one connection; every frame must decode.
        let mut tasks = Vec::new();
        for i in 0..50_u64 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                let response =
                    UtResponse::success(i, UtKind::Rpc, json!({"n": i, "pad": "x".repeat(64)}));
                conn.send(&response).await.expect("send");
            }));
        }

        let mut decoder = FrameDecoder::default();
        let mut seen = Vec::new();
        let mut buf = [0_u8; 4096];
        while seen.len() < 50 {
            let n = peer.read(&mut buf).await.expect("read");
            assert!(n > 0, "peer closed early");
            decoder.push(&buf[..n]);
            while let Some(frame) = decoder.next_frame().expect("intact frame stream") {
                let response: UtResponse =
                    serde_json::from_slice(&frame.payload).expect("intact body");
                seen.push(response.id);
            }
        }
        for task in tasks {
            task.await.expect("task");
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _peer) = tcp_pair().await;
        conn.close().await;
        conn.close().await;
        assert!(conn.send_pong().await.is_err(), "writes fail after close");
    }
}
