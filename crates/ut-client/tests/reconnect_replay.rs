//! Reconnect with replay: in-flight requests are resubmitted under their
//! original ids, and subscriptions are restored on the new link.

use std::time::Duration;

use serde_json::json;
use ut_client::{CallOptions, ClientConfig, ClientError, HeartbeatConfig, LinkState, UtClient};
use ut_protocol::UtRequest;
use ut_test_utils::{MockServer, MockServerOptions};

fn fast_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        ping_interval: Duration::from_millis(50),
        pong_timeout: Duration::from_millis(50),
    }
}

/// Rebinding races the old listener's teardown; retry briefly.
async fn bind_with_retry(addr: &str, options: MockServerOptions) -> MockServer {
    for _ in 0..50 {
        match MockServer::bind(addr, options).await {
            Ok(server) => return server,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("could not rebind {addr}");
}

fn rpc_ids(requests: &[UtRequest]) -> Vec<u64> {
    requests
        .iter()
        .filter_map(|request| match request {
            UtRequest::Rpc(rpc) => Some(rpc.id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn an_in_flight_request_is_replayed_with_its_original_id() {
    // First server swallows rpc requests, so the call stays in flight.
    let stalling = MockServerOptions {
        respond_rpc: false,
        ..MockServerOptions::default()
    };
    let first = MockServer::start(stalling).await.expect("first server");
    let addr = first.local_addr().to_string();
    let url = first.url();

    let client = UtClient::connect(ClientConfig::new(url).heartbeat(fast_heartbeat()))
        .await
        .expect("connect");

    let caller = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call(
                    "add",
                    vec![],
                    ut_client::dicts([("a", 20), ("b", 30)]),
                    CallOptions {
                        timeout: Some(Duration::from_secs(5)),
                        ..CallOptions::default()
                    },
                )
                .await
        })
    };

    // Let the request reach the first server, then kill it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while rpc_ids(&first.requests()).is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "request never sent");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let original_ids = rpc_ids(&first.requests());
    first.shutdown();

    // A replacement on the same port answers normally.
    let second = bind_with_retry(&addr, MockServerOptions::default()).await;

    // The caller observes exactly one return value and no error.
    let value = tokio::time::timeout(Duration::from_secs(10), caller)
        .await
        .expect("caller finished")
        .expect("join")
        .expect("call succeeded after replay");
    assert_eq!(value, json!(50));

    // The replayed request carried the id the first server saw.
    let replayed_ids = rpc_ids(&second.requests());
    assert_eq!(replayed_ids, original_ids, "replay must reuse the id");
    drop(second);
    client.exit().await;
}

#[tokio::test]
async fn subscriptions_are_restored_after_reconnect() {
    let server = MockServer::start(MockServerOptions::default())
        .await
        .expect("server");
    let addr = server.local_addr().to_string();

    let client = UtClient::connect(ClientConfig::new(server.url()).heartbeat(fast_heartbeat()))
        .await
        .expect("connect");
    client
        .subscribe(
            &["orders", "fills"],
            |_msg, _topic| async {},
            CallOptions::default(),
        )
        .await
        .expect("subscribe");

    server.shutdown();
    let replacement = bind_with_retry(&addr, MockServerOptions::default()).await;

    // One subscribe frame on the new link restores every handled topic.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut restored = replacement.subscribed_topics();
        restored.sort();
        if restored == ["fills", "orders"] {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscriptions were not restored, got {restored:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut local = client.subscribed_topics();
    local.sort();
    assert_eq!(local, ["fills", "orders"]);

    let subscribe_frames = replacement
        .requests()
        .iter()
        .filter(|request| matches!(request, UtRequest::Subscribe(_)))
        .count();
    assert_eq!(subscribe_frames, 1, "one subscribe frame restores all topics");

    drop(replacement);
    client.exit().await;
}

#[tokio::test]
async fn exhausted_reconnects_close_the_client() {
    let server = MockServer::start(MockServerOptions::default())
        .await
        .expect("server");
    let client = UtClient::connect(
        ClientConfig::new(server.url())
            .heartbeat(fast_heartbeat())
            .max_reconnect_attempts(1),
    )
    .await
    .expect("connect");

    // Kill the server with no replacement; the single attempt must fail.
    server.shutdown();
    drop(server);

    tokio::time::timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("client closes after exhaustion");
    assert_eq!(client.link_state(), LinkState::Closed);

    let err = client
        .call("add", vec![], serde_json::Map::new(), CallOptions::default())
        .await
        .expect_err("closed client rejects calls");
    assert!(
        matches!(err, ClientError::ConnectionReset),
        "expected ConnectionReset, got {err}"
    );
}
