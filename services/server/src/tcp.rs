//! Raw-stream endpoint: accept loop and per-connection receive loop.
//!
//! Each connection gets one receive task that feeds the frame decoder and
//! spawns a dispatch task per parsed request. Heartbeats are answered
//! reactively, with an anti-flood cut when PINGs arrive faster than the
//! configured floor. Malformed framing or bodies close the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use ut_protocol::codec::FrameDecoder;
use ut_protocol::{PING, UtRequest};

use crate::AppState;
use crate::connection::ClientConnection;
use crate::dispatcher;

/// Run the accept loop until the shutdown flag flips.
pub async fn run_tcp_listener(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("tcp listener stopping");
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            handle_client(stream, peer, state).await;
                        });
                    }
                    Err(err) => warn!(error = %err, "tcp accept failed"),
                }
            }
        }
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, state: AppState) {
    let (mut read, write) = stream.into_split();
    let conn = Arc::new(ClientConnection::from_tcp(write));
    info!(%peer, conn = %conn.id(), "client connected");

    let mut decoder = FrameDecoder::new(state.cfg.data_maxsize);
    // Dispatch tasks signal here when a request demands the connection close.
    let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
    let mut last_ping: Option<Instant> = None;
    let mut buf = [0_u8; 4096];

    loop {
        tokio::select! {
            _ = close_rx.recv() => break,
            read_result = read.read(&mut buf) => {
                let n = match read_result {
                    Ok(0) => {
                        // Zero-byte read: clean disconnect signal.
                        debug!(conn = %conn.id(), "eof");
                        break;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        debug!(conn = %conn.id(), error = %err, "read failed");
                        break;
                    }
                };

                if &buf[..n] == PING {
                    if let Some(previous) = last_ping {
                        if previous.elapsed() < state.cfg.limit_heartbeat_interval {
                            warn!(conn = %conn.id(), "heartbeat flood, dropping connection");
                            break;
                        }
                    }
                    last_ping = Some(Instant::now());
                    if conn.send_pong().await.is_err() {
                        break;
                    }
                    continue;
                }

                if !drain_frames(&state, &conn, &mut decoder, &buf[..n], &close_tx) {
                    break;
                }
            }
        }
    }

    state.subs.remove_subscriber(conn.id());
    conn.close().await;
    info!(conn = %conn.id(), "client disconnected");
}

/// Feed `chunk` into the decoder and spawn a dispatch task per complete
/// frame. Returns false when the connection must close (protocol error).
fn drain_frames(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    decoder: &mut FrameDecoder,
    chunk: &[u8],
    close_tx: &mpsc::Sender<()>,
) -> bool {
    decoder.push(chunk);
    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => {
                let request = match serde_json::from_slice::<UtRequest>(&frame.payload) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!(conn = %conn.id(), error = %err, "malformed request body");
                        return false;
                    }
                };
                let state = state.clone();
                let conn = Arc::clone(conn);
                let close_tx = close_tx.clone();
                tokio::spawn(async move {
                    if dispatcher::dispatch(&state, &conn, request).await {
                        let _ = close_tx.try_send(());
                    }
                });
            }
            Ok(None) => return true,
            Err(err) => {
                warn!(conn = %conn.id(), error = %err, "protocol error");
                return false;
            }
        }
    }
}
