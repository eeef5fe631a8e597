// mock_server: a scriptable raw-stream utran server for client tests.
//
// Binds to port 0 (or a caller-chosen address, so a "restarted" server can
// reuse the port), answers heartbeats and requests per its options, records
// everything it receives, and can push publishes or drop dead.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use ut_protocol::codec::{FrameDecoder, encode_frame};
use ut_protocol::{PING, PONG, UtKind, UtRequest, UtResponse};

/// Behavior switches for one mock server instance.
#[derive(Debug, Clone, Copy)]
pub struct MockServerOptions {
    /// Answer each PING with a PONG. Disable to provoke the client's pong
    /// deadline.
    pub answer_pings: bool,
    /// Answer rpc requests. Disable to leave callers waiting (stalled
    /// in-flight requests for replay tests).
    pub respond_rpc: bool,
}

impl Default for MockServerOptions {
    fn default() -> Self {
        MockServerOptions {
            answer_pings: true,
            respond_rpc: true,
        }
    }
}

struct MockState {
    options: MockServerOptions,
    requests: Mutex<Vec<UtRequest>>,
    accepted: AtomicU64,
    next_conn: AtomicU64,
    senders: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    topic_subs: Mutex<HashMap<String, HashSet<u64>>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A mock raw-stream server. Each test spins up its own isolated instance.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    /// Start on a random free port.
    pub async fn start(options: MockServerOptions) -> std::io::Result<Self> {
        MockServer::bind("127.0.0.1:0", options).await
    }

    /// Start on an explicit address; lets a test restart "the same" server.
    pub async fn bind(addr: &str, options: MockServerOptions) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState {
            options,
            requests: Mutex::new(Vec::new()),
            accepted: AtomicU64::new(0),
            next_conn: AtomicU64::new(0),
            senders: Mutex::new(HashMap::new()),
            topic_subs: Mutex::new(HashMap::new()),
            conn_tasks: Mutex::new(Vec::new()),
        });
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let conn_id = accept_state.next_conn.fetch_add(1, Ordering::SeqCst);
                        accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                        let conn_state = Arc::clone(&accept_state);
                        let task = tokio::spawn(async move {
                            handle_connection(conn_state, stream, conn_id).await;
                        });
                        accept_state
                            .conn_tasks
                            .lock()
                            .expect("conn tasks lock")
                            .push(task);
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(MockServer {
            addr,
            state,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client-facing URL for this instance.
    pub fn url(&self) -> String {
        format!("utran://{}", self.addr)
    }

    /// Everything decoded from any connection, in arrival order.
    pub fn requests(&self) -> Vec<UtRequest> {
        self.state.requests.lock().expect("requests lock").clone()
    }

    /// How many connections were ever accepted.
    pub fn connection_count(&self) -> u64 {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Topics currently subscribed by at least one live connection.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let subs = self.state.topic_subs.lock().expect("topic subs lock");
        subs.iter()
            .filter(|(_, conns)| !conns.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Push one publish frame to every connection subscribed to `topic`.
    pub fn publish(&self, topic: &str, msg: Value) {
        let response = UtResponse::success(
            0,
            UtKind::Publish,
            json!({ "topic": topic, "msg": msg }),
        );
        let conns: Vec<u64> = self
            .state
            .topic_subs
            .lock()
            .expect("topic subs lock")
            .get(topic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let senders = self.state.senders.lock().expect("senders lock");
        for conn_id in conns {
            if let Some(tx) = senders.get(&conn_id) {
                let _ = tx.send(encode_response(&response));
            }
        }
    }

    /// Kill the listener and every live connection. The port becomes free for
    /// a replacement instance.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        for task in self.state.conn_tasks.lock().expect("conn tasks lock").drain(..) {
            task.abort();
        }
        self.state.senders.lock().expect("senders lock").clear();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn encode_response(response: &UtResponse) -> Vec<u8> {
    let body = serde_json::to_vec(response).expect("response serializes");
    encode_frame(response.response_type, response.id, false, &body)
}

async fn handle_connection(state: Arc<MockState>, stream: tokio::net::TcpStream, conn_id: u64) {
    let (mut read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state
        .senders
        .lock()
        .expect("senders lock")
        .insert(conn_id, tx.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::default();
    let mut buf = [0_u8; 4096];
    loop {
        let Ok(n) = read.read(&mut buf).await else {
            break;
        };
        if n == 0 {
            break;
        }
        if &buf[..n] == PING {
            if state.options.answer_pings {
                let _ = tx.send(PONG.to_vec());
            }
            continue;
        }
        decoder.push(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    let Ok(request) = serde_json::from_slice::<UtRequest>(&frame.payload) else {
                        continue;
                    };
                    state
                        .requests
                        .lock()
                        .expect("requests lock")
                        .push(request.clone());
                    if let Some(response) = respond(&state, conn_id, &request) {
                        let _ = tx.send(encode_response(&response));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    // Protocol garbage: drop the connection like a real server.
                    writer_task.abort();
                    remove_connection(&state, conn_id);
                    return;
                }
            }
        }
    }

    writer_task.abort();
    remove_connection(&state, conn_id);
}

fn remove_connection(state: &MockState, conn_id: u64) {
    state.senders.lock().expect("senders lock").remove(&conn_id);
    for conns in state.topic_subs.lock().expect("topic subs lock").values_mut() {
        conns.remove(&conn_id);
    }
}

/// Produce the canned response for one request, or `None` to stall.
fn respond(state: &Arc<MockState>, conn_id: u64, request: &UtRequest) -> Option<UtResponse> {
    match request {
        UtRequest::Rpc(rpc) => {
            if !state.options.respond_rpc {
                return None;
            }
            Some(answer_rpc(rpc))
        }
        UtRequest::Subscribe(sub) => {
            let mut subs = state.topic_subs.lock().expect("topic subs lock");
            let mut added = Vec::new();
            for topic in &sub.topics {
                let topic = topic.trim().to_lowercase();
                if topic.is_empty() {
                    continue;
                }
                if subs.entry(topic.clone()).or_default().insert(conn_id) {
                    added.push(topic);
                }
            }
            let all: Vec<String> = subs
                .iter()
                .filter(|(_, conns)| conns.contains(&conn_id))
                .map(|(topic, _)| topic.clone())
                .collect();
            Some(UtResponse::success(
                sub.id,
                UtKind::Subscribe,
                json!({ "allTopics": all, "subTopics": added }),
            ))
        }
        UtRequest::Unsubscribe(unsub) => {
            let mut subs = state.topic_subs.lock().expect("topic subs lock");
            let mut removed = Vec::new();
            for topic in &unsub.topics {
                let topic = topic.trim().to_lowercase();
                if let Some(conns) = subs.get_mut(&topic) {
                    if conns.remove(&conn_id) {
                        removed.push(topic);
                    }
                }
            }
            let all: Vec<String> = subs
                .iter()
                .filter(|(_, conns)| conns.contains(&conn_id))
                .map(|(topic, _)| topic.clone())
                .collect();
            Some(UtResponse::success(
                unsub.id,
                UtKind::Unsubscribe,
                json!({ "allTopics": all, "unSubTopics": removed }),
            ))
        }
        UtRequest::Multicall(mc) => {
            let inner: Vec<UtResponse> = mc
                .multiple
                .iter()
                .map(|entry| match entry {
                    UtRequest::Rpc(rpc) => answer_rpc(rpc),
                    other => UtResponse::failed(
                        other.id(),
                        other.kind(),
                        "unsupported inner kind in mock",
                    ),
                })
                .collect();
            Some(UtResponse::success(
                mc.id,
                UtKind::Multicall,
                serde_json::to_value(inner).expect("inner responses serialize"),
            ))
        }
        UtRequest::Publish(_) => None,
    }
}

/// Built-in methods: `add` sums `dicts.a + dicts.b`, `echo` mirrors its
/// arguments, anything else is unknown.
fn answer_rpc(rpc: &ut_protocol::RpcRequest) -> UtResponse {
    match rpc.method_name.as_str() {
        "add" => {
            let a = rpc.dicts.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = rpc.dicts.get("b").and_then(Value::as_i64).unwrap_or(0);
            UtResponse::success(rpc.id, UtKind::Rpc, json!(a + b)).with_method("add")
        }
        "echo" => UtResponse::success(
            rpc.id,
            UtKind::Rpc,
            json!({ "args": rpc.args, "dicts": rpc.dicts }),
        )
        .with_method("echo"),
        unknown => UtResponse::failed(rpc.id, UtKind::Rpc, format!("no such method \"{unknown}\""))
            .with_method(unknown),
    }
}
