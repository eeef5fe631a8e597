//! WebSocket endpoint and the axum application.
//!
//! Every path upgrades to a WebSocket session when the `Upgrade` header asks
//! for one; anything else falls through to the HTTP adapter. The upgrade is
//! optionally gated by Basic auth: after the switch the server sends a text
//! `ok` on success, or an error text and closes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ut_protocol::UtRequest;

use crate::config::BasicAuth;
use crate::connection::ClientConnection;
use crate::{AppState, dispatcher, http};

/// Build the web-endpoint application: WebSocket upgrades plus the HTTP
/// adapter on every path.
pub fn router(state: AppState) -> Router {
    Router::new().fallback(entry).with_state(state)
}

async fn entry(State(state): State<AppState>, request: Request) -> Response {
    if is_websocket_upgrade(request.headers()) {
        let authorized = check_basic_auth(state.cfg.auth.as_ref(), request.headers());
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => upgrade.on_upgrade(move |socket| ws_session(state, socket, authorized)),
            Err(rejection) => rejection.into_response(),
        };
    }
    let method = request.method().clone();
    let uri = request.uri().clone();
    http::handle(&state, &method, &uri).await
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// `None` admits everyone; otherwise the `Authorization: Basic …` header must
/// match the configured credentials.
fn check_basic_auth(auth: Option<&BasicAuth>, headers: &HeaderMap) -> bool {
    let Some(auth) = auth else {
        return true;
    };
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((username, password)) => username == auth.username && password == auth.password,
        None => false,
    }
}

async fn ws_session(state: AppState, socket: WebSocket, authorized: bool) {
    let (sink, mut stream) = socket.split();
    let conn = Arc::new(ClientConnection::from_ws(sink));

    if !authorized {
        warn!(conn = %conn.id(), "websocket handshake rejected");
        let _ = conn.send_text("authentication failed").await;
        conn.close().await;
        return;
    }
    if conn.send_text("ok").await.is_err() {
        return;
    }
    info!(conn = %conn.id(), "websocket client connected");

    let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
    let mut last_ping: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = close_rx.recv() => break,
            message = stream.next() => {
                let Some(Ok(message)) = message else { break };
                match message {
                    Message::Text(text) => {
                        if text.as_str() == "PING" {
                            if ping_flood(&mut last_ping, state.cfg.limit_heartbeat_interval) {
                                warn!(conn = %conn.id(), "heartbeat flood, dropping connection");
                                break;
                            }
                            if conn.send_pong().await.is_err() {
                                break;
                            }
                            continue;
                        }
                        if text.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<UtRequest>(&text) {
                            Ok(request) => {
                                let state = state.clone();
                                let conn = Arc::clone(&conn);
                                let close_tx = close_tx.clone();
                                tokio::spawn(async move {
                                    if dispatcher::dispatch(&state, &conn, request).await {
                                        let _ = close_tx.try_send(());
                                    }
                                });
                            }
                            Err(err) => {
                                warn!(conn = %conn.id(), error = %err, "malformed request body");
                                break;
                            }
                        }
                    }
                    // A ws ping control frame counts as the heartbeat too.
                    Message::Ping(_) => {
                        if ping_flood(&mut last_ping, state.cfg.limit_heartbeat_interval) {
                            warn!(conn = %conn.id(), "heartbeat flood, dropping connection");
                            break;
                        }
                        if conn.send_pong().await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    other => debug!(conn = %conn.id(), ?other, "ignoring message"),
                }
            }
        }
    }

    state.subs.remove_subscriber(conn.id());
    conn.close().await;
    info!(conn = %conn.id(), "websocket client disconnected");
}

/// True when this PING arrived within the anti-flood floor of the previous
/// one. Updates the stamp otherwise.
fn ping_flood(last_ping: &mut Option<Instant>, limit: Duration) -> bool {
    if let Some(previous) = *last_ping {
        if previous.elapsed() < limit {
            return true;
        }
    }
    *last_ping = Some(Instant::now());
    false
}
