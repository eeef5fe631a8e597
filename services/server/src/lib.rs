//! ut-server: the utran RPC + pub/sub server.
//!
//! One process runs two endpoints over one method registry and one
//! subscription container: a raw-stream endpoint speaking the framed wire
//! protocol on `rpc_port`, and a web endpoint on `web_port` serving
//! WebSocket sessions plus the HTTP GET/POST adapter.
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), ut_server::ServerError> {
//! use serde_json::json;
//! use ut_server::config::ServerConfig;
//! use ut_server::registry::{MethodRegistry, param};
//! use ut_server::UtServer;
//!
//! let registry = MethodRegistry::builder()
//!     .rpc("add", |_args, dicts| async move {
//!         let a: i64 = param(&dicts, "a")?;
//!         let b: i64 = param(&dicts, "b")?;
//!         Ok(json!(a + b))
//!     })
//!     .build();
//! let server = UtServer::start(ServerConfig::default(), registry).await?;
//! server.publish("orders", json!({"qty": 1})).await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod http;
pub mod registry;
pub mod subs;
pub mod tcp;
pub mod worker;
pub mod ws;

use config::ServerConfig;
use registry::MethodRegistry;
use subs::SubscriptionRegistry;
use worker::WorkerPool;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared state handed to every endpoint loop and dispatch task.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<MethodRegistry>,
    pub subs: Arc<SubscriptionRegistry>,
    pub worker_pool: Option<Arc<WorkerPool>>,
    pub cfg: Arc<ServerConfig>,
}

/// A running server. Dropping the handle does not stop the endpoints; call
/// [`UtServer::exit`].
pub struct UtServer {
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
    rpc_addr: SocketAddr,
    web_addr: SocketAddr,
}

impl UtServer {
    /// Bind both endpoints and start serving.
    pub async fn start(cfg: ServerConfig, registry: MethodRegistry) -> Result<UtServer, ServerError> {
        let worker_pool = if cfg.workers > 0 {
            Some(Arc::new(WorkerPool::new(cfg.workers)))
        } else {
            None
        };
        let state = AppState {
            registry: Arc::new(registry),
            subs: Arc::new(SubscriptionRegistry::new()),
            worker_pool,
            cfg: Arc::new(cfg),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let rpc_listener =
            TcpListener::bind((state.cfg.host.as_str(), state.cfg.rpc_port)).await?;
        let rpc_addr = rpc_listener.local_addr()?;
        tokio::spawn(tcp::run_tcp_listener(
            rpc_listener,
            state.clone(),
            shutdown_rx.clone(),
        ));

        let web_listener =
            TcpListener::bind((state.cfg.host.as_str(), state.cfg.web_port)).await?;
        let web_addr = web_listener.local_addr()?;
        let app = ws::router(state.clone());
        let mut web_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let _ = axum::serve(web_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = web_shutdown.changed().await;
                })
                .await;
        });

        info!(
            rpc = %rpc_addr,
            web = %web_addr,
            methods = state.registry.rpc_count(),
            workers = state.worker_pool.as_ref().map_or(0, |pool| pool.size()),
            "server started"
        );
        Ok(UtServer {
            state,
            shutdown_tx,
            rpc_addr,
            web_addr,
        })
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn web_addr(&self) -> SocketAddr {
        self.web_addr
    }

    /// Raw-stream URL clients connect to.
    pub fn rpc_url(&self) -> String {
        format!("utran://{}", self.rpc_addr)
    }

    /// WebSocket URL clients connect to.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.web_addr)
    }

    /// Push `msg` to every subscriber of `topic` through the same fan-out
    /// path client publishes take.
    pub async fn publish(&self, topic: &str, msg: Value) {
        let topics = [topic.to_owned()];
        dispatcher::fan_out_publish(&self.state, 0, &topics, &msg).await;
    }

    /// Stop both endpoint loops.
    pub fn exit(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
