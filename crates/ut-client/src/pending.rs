//! Pending-request table: correlates outbound request ids to waiters.
//!
//! Each in-flight request registers a oneshot waiter under its id. A matching
//! response signals the waiter; a transport drop cancels every waiter at
//! once. Responses that arrive before a waiter is armed (rare but permitted)
//! are cached and delivered at registration time.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;
use ut_protocol::{UtRequest, UtResponse};

/// Reason a waiter is released without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Transport dropped; the request may be replayed on the next link.
    Disconnected,
    /// Reconnect attempts exhausted; the client is closing.
    ConnectionReset,
}

pub type WaitOutcome = Result<UtResponse, CancelReason>;

/// The suspended side of one pending request.
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<WaitOutcome>,
}

impl Waiter {
    /// Resolve with the correlated response or a cancellation reason.
    ///
    /// A dropped sender (entry discarded without a signal) resolves as
    /// [`CancelReason::Disconnected`].
    pub async fn wait(self) -> WaitOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CancelReason::Disconnected),
        }
    }
}

struct PendingEntry {
    request: UtRequest,
    tx: oneshot::Sender<WaitOutcome>,
}

#[derive(Default)]
struct Inner {
    waiters: HashMap<u64, PendingEntry>,
    /// Responses that arrived before their waiter was armed.
    early: HashMap<u64, UtResponse>,
}

/// Shared table of in-flight requests for one client.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable::default()
    }

    /// Store `request` and return the waiter to block on.
    ///
    /// Each id may have at most one active waiter; registering a duplicate is
    /// a programming error.
    pub fn register(&self, request: UtRequest) -> Waiter {
        let id = request.id();
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("pending table lock");
        if let Some(response) = inner.early.remove(&id) {
            let _ = tx.send(Ok(response));
            return Waiter { rx };
        }
        let prev = inner.waiters.insert(id, PendingEntry { request, tx });
        debug_assert!(prev.is_none(), "duplicate pending request id {id}");
        Waiter { rx }
    }

    /// Deliver `response` to the waiter for its id, or cache it if no waiter
    /// is armed yet. Duplicate signals for an already-resolved id overwrite
    /// the cache and are otherwise ignored.
    pub fn signal(&self, response: UtResponse) {
        let mut inner = self.inner.lock().expect("pending table lock");
        match inner.waiters.remove(&response.id) {
            Some(entry) => {
                let _ = entry.tx.send(Ok(response));
            }
            None => {
                debug!(id = response.id, "response without armed waiter, caching");
                inner.early.insert(response.id, response);
            }
        }
    }

    /// Release every waiter with `reason`. Used on transport drop.
    pub fn cancel_all(&self, reason: CancelReason) {
        let mut inner = self.inner.lock().expect("pending table lock");
        for (_, entry) in inner.waiters.drain() {
            let _ = entry.tx.send(Err(reason));
        }
    }

    /// Remove the entry and any cached response for `id`, returning the
    /// stored request. Used by the reconnect replay path.
    pub fn discard(&self, id: u64) -> Option<UtRequest> {
        let mut inner = self.inner.lock().expect("pending table lock");
        inner.early.remove(&id);
        inner.waiters.remove(&id).map(|entry| entry.request)
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().expect("pending table lock").waiters.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ut_protocol::{RpcRequest, UtKind};

    fn rpc(id: u64) -> UtRequest {
        UtRequest::Rpc(RpcRequest {
            id,
            method_name: "noop".to_owned(),
            args: vec![],
            dicts: serde_json::Map::new(),
        })
    }

    #[tokio::test]
    async fn signal_resolves_registered_waiter() {
        let table = PendingTable::new();
        let waiter = table.register(rpc(1));
        table.signal(UtResponse::success(1, UtKind::Rpc, json!(5)));
        let response = waiter.wait().await.expect("response");
        assert_eq!(response.result, json!(5));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn early_response_is_cached_until_registration() {
        let table = PendingTable::new();
        table.signal(UtResponse::success(7, UtKind::Rpc, json!("early")));
        let waiter = table.register(rpc(7));
        let response = waiter.wait().await.expect("cached response");
        assert_eq!(response.result, json!("early"));
    }

    #[tokio::test]
    async fn cancel_all_releases_every_waiter() {
        let table = PendingTable::new();
        let first = table.register(rpc(1));
        let second = table.register(rpc(2));
        table.cancel_all(CancelReason::Disconnected);
        assert_eq!(first.wait().await, Err(CancelReason::Disconnected));
        assert_eq!(second.wait().await, Err(CancelReason::Disconnected));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn discard_returns_the_stored_request_for_replay() {
        let table = PendingTable::new();
        let _waiter = table.register(rpc(50));
        let request = table.discard(50).expect("stored request");
        assert_eq!(request.id(), 50);
        assert!(table.discard(50).is_none(), "discard is idempotent");
    }

    #[tokio::test]
    async fn dropped_entry_resolves_waiter_as_disconnected() {
        let table = PendingTable::new();
        let waiter = table.register(rpc(3));
        let _ = table.discard(3);
        assert_eq!(waiter.wait().await, Err(CancelReason::Disconnected));
    }
}
