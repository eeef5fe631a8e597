//! The utran client: call facade, receive loop, and reconnect controller.
//!
//! One connection multiplexes every concurrent call. A single receive task
//! decodes inbound traffic and routes correlated responses to the pending
//! table and publish pushes to topic callbacks. Link loss (EOF or a missed
//! PONG) moves the client into a reconnect window during which user sends
//! block; once a fresh transport is up, subscriptions are restored in one
//! frame and unacknowledged requests are resubmitted under their original
//! ids.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ut_protocol::{
    MulticallRequest, PublishPayload, RpcRequest, SubscribeRequest, SubscribeResult,
    UnsubscribeRequest, UnsubscribeResult, UtKind, UtRequest, UtResponse,
};

use crate::heartbeat::HeartbeatTimer;
use crate::pending::{CancelReason, PendingTable};
use crate::transport::{self, RxEvent, TransportReader, TransportWriter};
use crate::{ClientConfig, ClientError};

/// Callback invoked with `(msg, topic)` for every publish push on a
/// subscribed topic.
pub type TopicHandler = Arc<dyn Fn(Value, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Link lifecycle, published through a watch channel so senders can block on
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// A reconnect window is open; user sends wait for it to close.
    Reconnecting,
    Closed,
}

/// Per-call overrides of the connection-level defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Deadline on the waiter; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Return `result` instead of raising on a failed response; `None` uses
    /// the client default.
    pub ignore: Option<bool>,
}

/// Options for a batched call.
#[derive(Debug, Clone, Copy, Default)]
pub struct MulticallOptions {
    pub timeout: Option<Duration>,
    pub ignore: Option<bool>,
    /// After a mid-flight disconnect, resend every entry rather than only the
    /// unanswered ones. The batch is answered as one envelope, so both
    /// settings resubmit the full batch; the flag is kept for call-site
    /// symmetry with per-entry retries.
    pub retransmit_full: bool,
}

/// Build keyed arguments from `(name, value)` pairs.
pub fn dicts<K, V, I>(pairs: I) -> Map<String, Value>
where
    K: Into<String>,
    V: Serialize,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), serde_json::to_value(v).unwrap_or(Value::Null)))
        .collect()
}

struct LinkEvent {
    /// Link generation the event belongs to; stale events are dropped.
    epoch: u64,
}

struct ClientInner {
    cfg: ClientConfig,
    pending: PendingTable,
    topics: Mutex<HashMap<String, TopicHandler>>,
    next_id: AtomicU64,
    link_tx: watch::Sender<LinkState>,
    /// One writer at a time; the lock is held across encode and write.
    writer: tokio::sync::Mutex<Option<TransportWriter>>,
    /// Set on every successful reconnect, cleared once the pending table
    /// drains. Distinguishes replayable timeouts from genuine local ones.
    last_reconnect_at: Mutex<Option<Instant>>,
    close_reason: Mutex<Option<CancelReason>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    epoch: AtomicU64,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<HeartbeatTimer>>,
}

/// Handle to one client connection. Cheap to clone.
#[derive(Clone)]
pub struct UtClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for UtClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtClient").finish_non_exhaustive()
    }
}

impl UtClient {
    /// Dial `cfg.url` and start the receive loop and heartbeat.
    pub async fn connect(cfg: ClientConfig) -> Result<UtClient, ClientError> {
        let (reader, writer) = transport::dial(&cfg).await?;
        let (link_tx, _link_rx) = watch::channel(LinkState::Connected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            cfg,
            pending: PendingTable::new(),
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            link_tx,
            writer: tokio::sync::Mutex::new(Some(writer)),
            last_reconnect_at: Mutex::new(None),
            close_reason: Mutex::new(None),
            events_tx,
            epoch: AtomicU64::new(0),
            receive_task: Mutex::new(None),
            heartbeat: Mutex::new(None),
        });

        inner.start_link_tasks(reader);
        tokio::spawn(supervise(Arc::clone(&inner), events_rx));
        info!(url = %inner.cfg.url, "connected");
        Ok(UtClient { inner })
    }

    /// Invoke a remote method and await its result.
    pub async fn call(
        &self,
        method_name: &str,
        args: Vec<Value>,
        dicts: Map<String, Value>,
        opts: CallOptions,
    ) -> Result<Value, ClientError> {
        let request = UtRequest::Rpc(RpcRequest {
            id: self.inner.gen_id(),
            method_name: method_name.to_owned(),
            args,
            dicts,
        });
        let response = self.inner.send_and_wait(request, opts.timeout).await?;
        self.inner.unwrap_result(response, opts.ignore)
    }

    /// Build an rpc body for use inside [`UtClient::multicall`] instead of
    /// sending it.
    pub fn call_spec(
        &self,
        method_name: &str,
        args: Vec<Value>,
        dicts: Map<String, Value>,
    ) -> UtRequest {
        UtRequest::Rpc(RpcRequest {
            id: self.inner.gen_id(),
            method_name: method_name.to_owned(),
            args,
            dicts,
        })
    }

    /// Send a batch of prepared bodies as one envelope; results come back in
    /// entry order regardless of completion order.
    pub async fn multicall(
        &self,
        calls: Vec<UtRequest>,
        opts: MulticallOptions,
    ) -> Result<Vec<Value>, ClientError> {
        if calls.iter().any(|c| c.kind() == UtKind::Multicall) {
            return Err(ClientError::NestedMulticall);
        }
        let request = UtRequest::Multicall(MulticallRequest {
            id: self.inner.gen_id(),
            multiple: calls,
        });
        let response = self.inner.send_and_wait(request, opts.timeout).await?;
        let inner_responses: Vec<UtResponse> = serde_json::from_value(response.result)?;
        inner_responses
            .into_iter()
            .map(|r| self.inner.unwrap_result(r, opts.ignore))
            .collect()
    }

    /// Subscribe `topics` and route their pushes to `callback`.
    ///
    /// The callback may be an async closure; wrap synchronous work in an
    /// `async` block. Panics inside it are logged and swallowed.
    pub async fn subscribe<F, Fut>(
        &self,
        topics: &[&str],
        callback: F,
        opts: CallOptions,
    ) -> Result<SubscribeResult, ClientError>
    where
        F: Fn(Value, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: TopicHandler = Arc::new(move |msg, topic| Box::pin(callback(msg, topic)));
        {
            let mut map = self.inner.topics.lock().expect("topics lock");
            for topic in topics {
                map.insert((*topic).to_owned(), Arc::clone(&handler));
            }
        }
        let request = UtRequest::Subscribe(SubscribeRequest {
            id: self.inner.gen_id(),
            topics: topics.iter().map(|t| (*t).to_owned()).collect(),
        });
        let response = self.inner.send_and_wait(request, opts.timeout).await?;
        let result = self.inner.unwrap_result(response, opts.ignore)?;
        Ok(serde_json::from_value(result).unwrap_or_default())
    }

    /// Drop local handlers for `topics` and leave them on the server.
    pub async fn unsubscribe(
        &self,
        topics: &[&str],
        opts: CallOptions,
    ) -> Result<UnsubscribeResult, ClientError> {
        {
            let mut map = self.inner.topics.lock().expect("topics lock");
            for topic in topics {
                map.remove(*topic);
            }
        }
        let request = UtRequest::Unsubscribe(UnsubscribeRequest {
            id: self.inner.gen_id(),
            topics: topics.iter().map(|t| (*t).to_owned()).collect(),
        });
        let response = self.inner.send_and_wait(request, opts.timeout).await?;
        let result = self.inner.unwrap_result(response, opts.ignore)?;
        Ok(serde_json::from_value(result).unwrap_or_default())
    }

    /// Tear the connection down and release every waiter. Idempotent.
    pub async fn exit(&self) {
        self.inner.shutdown(CancelReason::Disconnected).await;
    }

    /// Wait until the client reaches its terminal state.
    pub async fn closed(&self) {
        let mut rx = self.inner.link_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == LinkState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn link_state(&self) -> LinkState {
        *self.inner.link_tx.borrow()
    }

    /// Topics with a locally registered handler.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner
            .topics
            .lock()
            .expect("topics lock")
            .keys()
            .cloned()
            .collect()
    }
}

impl ClientInner {
    fn gen_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Spawn the receive loop and heartbeat for the current transport under
    /// the current link epoch.
    fn start_link_tasks(self: &Arc<Self>, reader: TransportReader) {
        let epoch = self.epoch.load(Ordering::SeqCst);

        let rx_inner = Arc::clone(self);
        let handle = tokio::spawn(receive_loop(rx_inner, reader, epoch));
        *self.receive_task.lock().expect("receive task lock") = Some(handle);

        let ping_inner = Arc::clone(self);
        let events_tx = self.events_tx.clone();
        let timer = HeartbeatTimer::spawn(
            self.cfg.heartbeat,
            move || {
                let inner = Arc::clone(&ping_inner);
                Box::pin(async move { inner.send_ping().await })
            },
            move || {
                let _ = events_tx.send(LinkEvent { epoch });
            },
        );
        *self.heartbeat.lock().expect("heartbeat lock") = Some(timer);
    }

    async fn send_ping(&self) -> bool {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.send_ping().await,
            None => false,
        }
    }

    async fn send_body(&self, request: &UtRequest) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.send_request(request).await,
            None => Err(ClientError::Disconnected),
        }
    }

    fn mark_alive(&self) {
        if let Some(timer) = self.heartbeat.lock().expect("heartbeat lock").as_ref() {
            timer.alive();
        }
    }

    /// Register, send, and await one request; replays it under its original
    /// id across reconnect windows.
    async fn send_and_wait(
        self: &Arc<Self>,
        request: UtRequest,
        timeout: Option<Duration>,
    ) -> Result<UtResponse, ClientError> {
        let id = request.id();
        loop {
            self.await_connected().await?;
            let waiter = self.pending.register(request.clone());
            if let Err(err) = self.send_body(&request).await {
                // The reconnect flow releases the waiter once it concludes.
                debug!(id, error = %err, "send failed, awaiting reconnect");
            }

            let outcome = match timeout {
                Some(deadline) => match tokio::time::timeout(deadline, waiter.wait()).await {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => {
                        self.pending.discard(id);
                        let reconnected = self
                            .last_reconnect_at
                            .lock()
                            .expect("reconnect stamp lock")
                            .is_some();
                        if reconnected {
                            // The deadline raced a reconnect; resubmit the
                            // request under the same id on the new link.
                            debug!(id, "timeout inside reconnect window, resubmitting");
                            continue;
                        }
                        warn!(id, "local timeout, closing client");
                        self.shutdown(CancelReason::Disconnected).await;
                        return Err(ClientError::LocalTimeout);
                    }
                },
                None => waiter.wait().await,
            };

            match outcome {
                Ok(response) => {
                    if self.pending.is_empty() {
                        *self.last_reconnect_at.lock().expect("reconnect stamp lock") = None;
                    }
                    return Ok(response);
                }
                Err(CancelReason::Disconnected) => {
                    // Dropped mid-flight; loop resubmits after the reconnect
                    // window closes.
                    continue;
                }
                Err(CancelReason::ConnectionReset) => {
                    return Err(ClientError::ConnectionReset);
                }
            }
        }
    }

    /// Block while a reconnect window is open; error out once closed.
    async fn await_connected(&self) -> Result<(), ClientError> {
        let mut rx = self.link_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                LinkState::Connected => return Ok(()),
                LinkState::Closed => return Err(self.closed_error()),
                LinkState::Reconnecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    fn closed_error(&self) -> ClientError {
        match *self.close_reason.lock().expect("close reason lock") {
            Some(CancelReason::ConnectionReset) => ClientError::ConnectionReset,
            _ => ClientError::Closed,
        }
    }

    fn unwrap_result(&self, response: UtResponse, ignore: Option<bool>) -> Result<Value, ClientError> {
        let ignore = ignore.unwrap_or(self.cfg.ignore);
        if response.is_success() || ignore {
            Ok(response.result)
        } else {
            Err(ClientError::Remote {
                response_type: response.response_type,
                error: response.error,
            })
        }
    }

    fn route_response(self: &Arc<Self>, response: UtResponse) {
        if response.response_type == UtKind::Publish {
            match serde_json::from_value::<PublishPayload>(response.result) {
                Ok(payload) => self.invoke_topic_handler(payload),
                Err(err) => warn!(error = %err, "malformed publish payload"),
            }
            return;
        }
        self.pending.signal(response);
    }

    fn invoke_topic_handler(&self, payload: PublishPayload) {
        let handler = self
            .topics
            .lock()
            .expect("topics lock")
            .get(&payload.topic)
            .cloned();
        let Some(handler) = handler else {
            debug!(topic = %payload.topic, "publish for topic without a handler");
            return;
        };
        let topic = payload.topic;
        let fut = handler(payload.msg, topic.clone());
        tokio::spawn(async move {
            if let Err(err) = tokio::spawn(fut).await {
                warn!(%topic, error = %err, "publish callback panicked");
            }
        });
    }

    /// Abort the receive task and heartbeat and drop the writer.
    async fn teardown_link(&self) {
        let receive = self.receive_task.lock().expect("receive task lock").take();
        if let Some(handle) = receive {
            handle.abort();
        }
        let heartbeat = self.heartbeat.lock().expect("heartbeat lock").take();
        if let Some(timer) = heartbeat {
            timer.cancel();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.close().await;
        }
    }

    /// Rebuild the transport with bounded backoff; restores subscriptions
    /// and publishes Connected on success.
    async fn run_reconnect(self: &Arc<Self>) -> Result<(), ClientError> {
        for attempt in 0..self.cfg.max_reconnect_attempts {
            tokio::time::sleep(Duration::from_millis(500) * attempt.min(10)).await;
            // exit() may land while a window is open; stay closed then.
            if *self.link_tx.borrow() == LinkState::Closed {
                return Err(ClientError::Closed);
            }
            info!(
                attempt = attempt + 1,
                max = self.cfg.max_reconnect_attempts,
                "reconnecting"
            );
            match transport::dial(&self.cfg).await {
                Ok((reader, writer)) => {
                    *self.last_reconnect_at.lock().expect("reconnect stamp lock") =
                        Some(Instant::now());
                    *self.writer.lock().await = Some(writer);
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                    self.start_link_tasks(reader);
                    // Waiters stranded on the dead link learn about it now;
                    // each resubmits its request once the gate opens.
                    self.pending.cancel_all(CancelReason::Disconnected);
                    self.resubscribe().await;
                    self.link_tx.send_replace(LinkState::Connected);
                    info!("reconnected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "reconnect attempt failed");
                }
            }
        }
        Err(ClientError::ConnectionReset)
    }

    /// Re-subscribe every locally handled topic in one frame.
    async fn resubscribe(self: &Arc<Self>) {
        let topics: Vec<String> = self
            .topics
            .lock()
            .expect("topics lock")
            .keys()
            .cloned()
            .collect();
        if topics.is_empty() {
            return;
        }
        let request = UtRequest::Subscribe(SubscribeRequest {
            id: self.gen_id(),
            topics: topics.clone(),
        });
        let waiter = self.pending.register(request.clone());
        if let Err(err) = self.send_body(&request).await {
            warn!(error = %err, "re-subscribe send failed");
            return;
        }
        tokio::spawn(async move {
            match waiter.wait().await {
                Ok(response) if response.is_success() => {
                    info!(?topics, "re-subscribed");
                }
                Ok(response) => warn!(error = %response.error, "re-subscribe rejected"),
                Err(_) => {}
            }
        });
    }

    async fn shutdown(&self, reason: CancelReason) {
        {
            let mut close_reason = self.close_reason.lock().expect("close reason lock");
            if close_reason.is_none() {
                *close_reason = Some(reason);
            }
        }
        self.link_tx.send_replace(LinkState::Closed);
        self.teardown_link().await;
        self.pending.cancel_all(reason);
    }
}

/// Receive loop: decode inbound traffic, feed liveness, route bodies. Ends by
/// reporting link loss for its epoch.
async fn receive_loop(inner: Arc<ClientInner>, mut reader: TransportReader, epoch: u64) {
    loop {
        match reader.next_event().await {
            Ok(RxEvent::Pong) => inner.mark_alive(),
            Ok(RxEvent::Response(response)) => {
                inner.mark_alive();
                inner.route_response(response);
            }
            Ok(RxEvent::Eof) => {
                debug!("server closed the connection");
                break;
            }
            Err(err) => {
                warn!(error = %err, "receive loop failed");
                break;
            }
        }
    }
    let _ = inner.events_tx.send(LinkEvent { epoch });
}

/// Supervisor: consumes link-loss events and drives the reconnect state
/// machine. The epoch check makes each lost link enter the flow exactly once.
async fn supervise(inner: Arc<ClientInner>, mut events_rx: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events_rx.recv().await {
        if event.epoch != inner.epoch.load(Ordering::SeqCst) {
            continue;
        }
        if *inner.link_tx.borrow() == LinkState::Closed {
            return;
        }
        inner.link_tx.send_replace(LinkState::Reconnecting);
        // The old receive task must be gone before a fresh transport exists.
        // Waiters stay armed across the window: they are released for replay
        // only once a reconnect concludes, or with ConnectionReset below.
        inner.teardown_link().await;
        if let Err(err) = inner.run_reconnect().await {
            if matches!(err, ClientError::Closed) {
                return;
            }
            error!("reconnect attempts exhausted, closing");
            inner.shutdown(CancelReason::ConnectionReset).await;
            return;
        }
    }
}
