//! Request dispatcher: one entry point per inbound request.
//!
//! The endpoint loops spawn `dispatch` in its own task per request, so a slow
//! handler never starves the connection's receive side. The return value
//! tells the loop whether the connection must close; only
//! unsubscribe-without-subscription (and multicall entries doing the same)
//! signal that.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, warn};
use ut_protocol::{
    MulticallRequest, PublishRequest, RpcRequest, SubscribeRequest, UnsubscribeRequest, UtKind,
    UtRequest, UtResponse,
};

use crate::AppState;
use crate::connection::ClientConnection;
use crate::subs::normalize_topic;

/// Handle `request` and send its response (if any) on `conn`. Returns whether
/// the connection must close.
pub async fn dispatch(state: &AppState, conn: &Arc<ClientConnection>, request: UtRequest) -> bool {
    let (response, close) = match request {
        UtRequest::Multicall(mc) => {
            let (response, close) = handle_multicall(state, conn, mc).await;
            (Some(response), close)
        }
        other => handle_single(state, conn, other).await,
    };
    if let Some(response) = response {
        if let Err(err) = conn.send(&response).await {
            debug!(conn = %conn.id(), error = %err, "response send failed");
            return true;
        }
    }
    close
}

/// Handle one non-batched request and produce its response body, if the kind
/// has one. A multicall reaching this level is a nesting violation.
async fn handle_single(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    request: UtRequest,
) -> (Option<UtResponse>, bool) {
    match request {
        UtRequest::Rpc(rpc) => handle_rpc(state, rpc).await,
        UtRequest::Subscribe(sub) => handle_subscribe(state, conn, &sub),
        UtRequest::Unsubscribe(unsub) => handle_unsubscribe(state, conn, &unsub),
        UtRequest::Publish(publish) => handle_publish(state, publish).await,
        UtRequest::Multicall(mc) => (
            Some(UtResponse::failed(
                mc.id,
                UtKind::Multicall,
                "nested multicall is not allowed",
            )),
            false,
        ),
    }
}

async fn handle_rpc(state: &AppState, rpc: RpcRequest) -> (Option<UtResponse>, bool) {
    let RpcRequest {
        id,
        method_name,
        args,
        dicts,
    } = rpc;
    let Some(method) = state.registry.rpc_method(&method_name) else {
        let response = UtResponse::failed(id, UtKind::Rpc, format!("no such method \"{method_name}\""))
            .with_method(method_name);
        return (Some(response), false);
    };

    let outcome = if method.use_worker() {
        match &state.worker_pool {
            Some(pool) => pool.execute(method.call(args, dicts)).await,
            None => Err("no worker pool".to_owned()),
        }
    } else {
        method.call(args, dicts).await
    };

    let response = match outcome {
        Ok(result) => UtResponse::success(id, UtKind::Rpc, result),
        Err(error) => {
            debug!(method = %method_name, %error, "rpc handler failed");
            UtResponse::failed(id, UtKind::Rpc, error)
        }
    }
    .with_method(method_name);
    (Some(response), false)
}

fn handle_subscribe(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    sub: &SubscribeRequest,
) -> (Option<UtResponse>, bool) {
    if sub.topics.is_empty() {
        let all = state.subs.topics_of(conn.id());
        let response = UtResponse::failed(sub.id, UtKind::Subscribe, "no topics specified")
            .with_result(json!({ "allTopics": all, "subTopics": [] }));
        return (Some(response), false);
    }

    let added = if state.subs.has_subscriber(conn.id()) {
        state.subs.add_topics(conn.id(), &sub.topics)
    } else {
        state.subs.add_subscriber(Arc::clone(conn), &sub.topics)
    };
    let all = state.subs.topics_of(conn.id());
    debug!(conn = %conn.id(), ?added, "subscribed");
    let response = UtResponse::success(
        sub.id,
        UtKind::Subscribe,
        json!({ "allTopics": all, "subTopics": added }),
    );
    (Some(response), false)
}

fn handle_unsubscribe(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    unsub: &UnsubscribeRequest,
) -> (Option<UtResponse>, bool) {
    if !state.subs.has_subscriber(conn.id()) {
        warn!(conn = %conn.id(), "unsubscribe without subscription");
        let response = UtResponse::failed(
            unsub.id,
            UtKind::Unsubscribe,
            "not a subscriber, closing connection",
        );
        return (Some(response), true);
    }

    let removed = state.subs.remove_topics(conn.id(), &unsub.topics);
    let all = state.subs.topics_of(conn.id());
    let response = UtResponse::success(
        unsub.id,
        UtKind::Unsubscribe,
        json!({ "allTopics": all, "unSubTopics": removed }),
    );
    (Some(response), false)
}

async fn handle_publish(state: &AppState, publish: PublishRequest) -> (Option<UtResponse>, bool) {
    fan_out_publish(state, publish.id, &publish.topics, &publish.msg).await;
    // The publisher gets no correlated response.
    (None, false)
}

/// Deliver one publish to every subscriber of each topic, one response frame
/// per (topic, subscriber) pair. Used for client publishes and server pushes
/// alike.
pub async fn fan_out_publish(state: &AppState, id: u64, topics: &[String], msg: &Value) {
    for topic in topics {
        let Some(topic) = normalize_topic(topic) else {
            debug!("skipping empty publish topic");
            continue;
        };
        let subscribers = state.subs.subscribers_of(&topic);
        let response = UtResponse::success(
            id,
            UtKind::Publish,
            json!({ "topic": topic, "msg": msg }),
        );
        for subscriber in subscribers {
            if let Err(err) = subscriber.send(&response).await {
                debug!(sub = %subscriber.id(), error = %err, "publish delivery failed");
            }
        }
        // Let receive loops breathe between topic fan-outs.
        tokio::task::yield_now().await;
    }
}

/// Expand a batch: dispatch every entry concurrently on the same connection
/// and collect the inner bodies in request order. Inner failures never fail
/// the envelope.
async fn handle_multicall(
    state: &AppState,
    conn: &Arc<ClientConnection>,
    mc: MulticallRequest,
) -> (UtResponse, bool) {
    let entries = mc.multiple.into_iter().map(|entry| async move {
        let id = entry.id();
        let kind = entry.kind();
        let (response, close) = handle_single(state, conn, entry).await;
        // Kinds without a response body still occupy their result slot.
        (
            response.unwrap_or_else(|| UtResponse::success(id, kind, Value::Null)),
            close,
        )
    });
    let outcomes = join_all(entries).await;

    let mut close = false;
    let mut bodies = Vec::with_capacity(outcomes.len());
    for (body, entry_close) in outcomes {
        close |= entry_close;
        bodies.push(body);
    }
    let result = serde_json::to_value(bodies).unwrap_or(Value::Null);
    (UtResponse::success(mc.id, UtKind::Multicall, result), close)
}
