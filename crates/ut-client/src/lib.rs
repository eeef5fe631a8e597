//! ut-client: asynchronous client for utran servers.
//!
//! Connects over raw TCP (`utran://host:port`) or WebSocket (`ws://`,
//! `wss://`), multiplexes concurrent calls over one connection, keeps the
//! link alive with PING/PONG heartbeats, and transparently reconnects with
//! in-flight replay and subscription restore.
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), ut_client::ClientError> {
//! use ut_client::{CallOptions, ClientConfig, UtClient, dicts};
//!
//! let client = UtClient::connect(ClientConfig::new("utran://127.0.0.1:8081")).await?;
//! let sum = client
//!     .call("add", vec![], dicts([("a", 2), ("b", 3)]), CallOptions::default())
//!     .await?;
//! assert_eq!(sum, serde_json::json!(5));
//! client.exit().await;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;
use ut_protocol::codec::DEFAULT_MAX_SIZE;
use ut_protocol::{ProtocolError, UtKind};

pub mod client;
pub mod heartbeat;
pub mod pending;
pub mod transport;

pub use client::{CallOptions, LinkState, MulticallOptions, TopicHandler, UtClient, dicts};
pub use heartbeat::HeartbeatConfig;
pub use pending::{CancelReason, PendingTable, Waiter};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection-level settings; per-call options can override `ignore` and the
/// wait deadline.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `utran://host:port`, `ws://…` or `wss://…`.
    pub url: String,
    pub max_reconnect_attempts: u32,
    /// Default for the per-call `ignore` option: failed responses yield their
    /// `result` instead of an error.
    pub ignore: bool,
    pub heartbeat: HeartbeatConfig,
    /// Payload cap fed to the frame decoder.
    pub max_size: usize,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            max_reconnect_attempts: 10,
            ignore: true,
            heartbeat: HeartbeatConfig::default(),
            max_size: DEFAULT_MAX_SIZE,
            username: None,
            password: None,
        }
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn ignore(mut self, ignore: bool) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url \"{0}\"")]
    BadUrl(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("websocket handshake rejected: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    Ws(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("malformed body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("request timed out locally")]
    LocalTimeout,
    #[error("connection lost")]
    Disconnected,
    #[error("max reconnect attempts reached")]
    ConnectionReset,
    #[error("client is closed")]
    Closed,
    #[error("remote {response_type} error: {error}")]
    Remote {
        response_type: UtKind,
        error: String,
    },
    #[error("nested multicall is not allowed")]
    NestedMulticall,
}
