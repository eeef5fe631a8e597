//! Client heartbeat: periodic PING emission with a PONG deadline.
//!
//! Two latent timers drive the exchange. The ping timer fires after
//! `ping_interval` and emits a PING through the connection's writer; the pong
//! timer then arms for `pong_timeout` and, if it fires, invokes the timeout
//! callback exactly once. Any inbound byte resets both timers via [`HeartbeatTimer::alive`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            ping_interval: Duration::from_secs(2),
            pong_timeout: Duration::from_secs(2),
        }
    }
}

/// Handle to the heartbeat task of one connection. Dropping it stops the
/// timers.
#[derive(Debug)]
pub struct HeartbeatTimer {
    alive: Arc<Notify>,
    task: JoinHandle<()>,
}

impl HeartbeatTimer {
    /// Spawn the timer task.
    ///
    /// `send_ping` emits one PING and reports whether the write succeeded;
    /// a failed write is treated like a missed PONG. `on_timeout` runs once
    /// when the pong deadline elapses, after which the task ends.
    pub fn spawn<P, T>(config: HeartbeatConfig, mut send_ping: P, on_timeout: T) -> Self
    where
        P: FnMut() -> BoxFuture<'static, bool> + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        let alive = Arc::new(Notify::new());
        let alive_task = Arc::clone(&alive);
        let task = tokio::spawn(async move {
            let mut on_timeout = Some(on_timeout);
            loop {
                tokio::select! {
                    // Inbound traffic re-arms the ping timer.
                    () = alive_task.notified() => continue,
                    () = tokio::time::sleep(config.ping_interval) => {}
                }

                if !send_ping().await {
                    debug!("ping write failed, treating as heartbeat timeout");
                    if let Some(cb) = on_timeout.take() {
                        cb();
                    }
                    return;
                }

                tokio::select! {
                    // Any byte from the peer before the deadline keeps the
                    // connection alive; PONG is just the usual such byte.
                    () = alive_task.notified() => continue,
                    () = tokio::time::sleep(config.pong_timeout) => {
                        if let Some(cb) = on_timeout.take() {
                            cb();
                        }
                        return;
                    }
                }
            }
        });
        HeartbeatTimer { alive, task }
    }

    /// Record inbound traffic: cancels a pending pong deadline and re-arms
    /// the ping timer.
    pub fn alive(&self) {
        self.alive.notify_one();
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
