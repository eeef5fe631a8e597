//! Client transports: framed raw TCP (`utran://`) and WebSocket (`ws://`,
//! `wss://`).
//!
//! Raw-stream connections use the frame layout of [`ut_protocol::codec`] and
//! exchange the PING/PONG literals outside any frame. WebSocket connections
//! carry one body per text message and use text `PING`/`PONG` heartbeats; the
//! server confirms the upgrade with a text `ok` before any traffic.

use std::collections::VecDeque;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use ut_protocol::codec::{FrameDecoder, encode_frame};
use ut_protocol::{PING, PONG, UtRequest, UtResponse};

use crate::{ClientConfig, ClientError};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

/// One observation from the receive side of a transport.
#[derive(Debug)]
pub enum RxEvent {
    /// Heartbeat reply; counts as inbound traffic only.
    Pong,
    Response(UtResponse),
    /// Clean disconnect signal (EOF or close frame).
    Eof,
}

// ---------------------------------------------------------------------------
// Dial
// ---------------------------------------------------------------------------

/// Open a fresh transport for `cfg.url` and return its two halves.
pub async fn dial(cfg: &ClientConfig) -> Result<(TransportReader, TransportWriter), ClientError> {
    if let Some(addr) = cfg.url.strip_prefix("utran://") {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Connect(format!("{addr}: {e}")))?;
        let (read, write) = stream.into_split();
        return Ok((
            TransportReader::Tcp {
                read,
                decoder: FrameDecoder::new(cfg.max_size),
                queued: VecDeque::new(),
            },
            TransportWriter::Tcp(write),
        ));
    }

    if cfg.url.starts_with("ws://") || cfg.url.starts_with("wss://") {
        let request = build_ws_request(cfg)?;
        let (mut ws, _response) = connect_async(request)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        confirm_handshake(&mut ws).await?;
        let (sink, stream) = ws.split();
        return Ok((TransportReader::Ws(stream), TransportWriter::Ws(sink)));
    }

    Err(ClientError::BadUrl(cfg.url.clone()))
}

fn build_ws_request(
    cfg: &ClientConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ClientError> {
    let mut request = cfg
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::BadUrl(format!("{}: {e}", cfg.url)))?;

    if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
        let credentials = BASE64.encode(format!("{username}:{password}"));
        request.headers_mut().insert(
            "Authorization",
            format!("Basic {credentials}")
                .parse()
                .map_err(|_| ClientError::Connect("invalid auth header".to_owned()))?,
        );
    }

    Ok(request)
}

/// The server answers a successful upgrade with a text `ok`; anything else is
/// its rejection reason.
async fn confirm_handshake(ws: &mut WsStream) -> Result<(), ClientError> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next())
        .await
        .map_err(|_| ClientError::Handshake("no greeting before deadline".to_owned()))?;
    match first {
        Some(Ok(Message::Text(text))) if text.as_str() == "ok" => Ok(()),
        Some(Ok(Message::Text(text))) => Err(ClientError::Handshake(text.to_string())),
        Some(Ok(other)) => Err(ClientError::Handshake(format!(
            "unexpected greeting: {other:?}"
        ))),
        Some(Err(e)) => Err(ClientError::Handshake(e.to_string())),
        None => Err(ClientError::Handshake(
            "connection closed before greeting".to_owned(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Reader half
// ---------------------------------------------------------------------------

pub enum TransportReader {
    Tcp {
        read: OwnedReadHalf,
        decoder: FrameDecoder,
        queued: VecDeque<UtResponse>,
    },
    Ws(SplitStream<WsStream>),
}

impl TransportReader {
    /// Yield the next receive-side observation.
    ///
    /// Errors are fatal for this transport; the caller tears the link down
    /// and lets the reconnect flow take over.
    pub async fn next_event(&mut self) -> Result<RxEvent, ClientError> {
        match self {
            TransportReader::Tcp {
                read,
                decoder,
                queued,
            } => {
                let mut buf = [0_u8; READ_CHUNK];
                loop {
                    if let Some(response) = queued.pop_front() {
                        return Ok(RxEvent::Response(response));
                    }
                    let n = read
                        .read(&mut buf)
                        .await
                        .map_err(|_| ClientError::Disconnected)?;
                    if n == 0 {
                        return Ok(RxEvent::Eof);
                    }
                    // Heartbeats arrive as exactly the bare literal.
                    if &buf[..n] == PONG {
                        return Ok(RxEvent::Pong);
                    }
                    decoder.push(&buf[..n]);
                    while let Some(frame) = decoder.next_frame()? {
                        let response: UtResponse = serde_json::from_slice(&frame.payload)?;
                        queued.push_back(response);
                    }
                }
            }
            TransportReader::Ws(stream) => loop {
                match stream.next().await {
                    None => return Ok(RxEvent::Eof),
                    Some(Err(e)) => return Err(ClientError::Ws(e.to_string())),
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "PONG" {
                            return Ok(RxEvent::Pong);
                        }
                        let response: UtResponse = serde_json::from_str(&text)?;
                        return Ok(RxEvent::Response(response));
                    }
                    Some(Ok(Message::Pong(_))) => return Ok(RxEvent::Pong),
                    Some(Ok(Message::Close(_))) => return Ok(RxEvent::Eof),
                    Some(Ok(other)) => {
                        debug!(?other, "ignoring non-text websocket message");
                    }
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Writer half
// ---------------------------------------------------------------------------

pub enum TransportWriter {
    Tcp(OwnedWriteHalf),
    Ws(SplitSink<WsStream, Message>),
}

impl TransportWriter {
    /// Serialize and write one request body.
    pub async fn send_request(&mut self, request: &UtRequest) -> Result<(), ClientError> {
        match self {
            TransportWriter::Tcp(write) => {
                let body = serde_json::to_vec(request)?;
                let frame = encode_frame(request.kind(), request.id(), false, &body);
                write
                    .write_all(&frame)
                    .await
                    .map_err(|_| ClientError::Disconnected)
            }
            TransportWriter::Ws(sink) => {
                let text = serde_json::to_string(request)?;
                sink.send(Message::Text(text.into()))
                    .await
                    .map_err(|e| ClientError::Ws(e.to_string()))
            }
        }
    }

    /// Emit one heartbeat; reports whether the write succeeded.
    pub async fn send_ping(&mut self) -> bool {
        match self {
            TransportWriter::Tcp(write) => write.write_all(PING).await.is_ok(),
            TransportWriter::Ws(sink) => sink.send(Message::Text("PING".into())).await.is_ok(),
        }
    }

    /// Best-effort close: shut the write half down (raw stream EOF hint) or
    /// send a close frame. Safe to call more than once per connection.
    pub async fn close(&mut self) {
        match self {
            TransportWriter::Tcp(write) => {
                let _ = write.shutdown().await;
            }
            TransportWriter::Ws(sink) => {
                let _ = sink.send(Message::Close(None)).await;
            }
        }
    }
}
