//! WebSocket endpoint: handshake gate, calls, and pub/sub over text frames.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use ut_client::{CallOptions, ClientConfig, ClientError, UtClient};
use ut_server::UtServer;
use ut_server::config::{BasicAuth, ServerConfig};
use ut_server::registry::{MethodRegistry, param};

fn test_registry() -> MethodRegistry {
    MethodRegistry::builder()
        .rpc("add", |_args, dicts| async move {
            let a: i64 = param(&dicts, "a")?;
            let b: i64 = param(&dicts, "b")?;
            Ok(json!(a + b))
        })
        .build()
}

fn test_config(auth: Option<BasicAuth>) -> ServerConfig {
    ServerConfig {
        web_port: 0,
        rpc_port: 0,
        auth,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn calls_work_over_websocket() {
    let server = UtServer::start(test_config(None), test_registry())
        .await
        .expect("start");
    let client = UtClient::connect(ClientConfig::new(server.ws_url()))
        .await
        .expect("connect");

    let sum = client
        .call(
            "add",
            vec![],
            ut_client::dicts([("a", 20), ("b", 22)]),
            CallOptions::default(),
        )
        .await
        .expect("call");
    assert_eq!(sum, json!(42));

    client.exit().await;
    server.exit();
}

#[tokio::test]
async fn pushes_arrive_over_websocket() {
    let server = UtServer::start(test_config(None), test_registry())
        .await
        .expect("start");
    let client = UtClient::connect(ClientConfig::new(server.ws_url()))
        .await
        .expect("connect");

    let (pushes_tx, mut pushes_rx) = mpsc::unbounded_channel();
    client
        .subscribe(
            &["orders"],
            move |msg, topic| {
                let pushes_tx = pushes_tx.clone();
                async move {
                    let _ = pushes_tx.send((topic, msg));
                }
            },
            CallOptions::default(),
        )
        .await
        .expect("subscribe");

    server.publish("orders", json!({"qty": 3})).await;
    let (topic, msg) = tokio::time::timeout(Duration::from_secs(2), pushes_rx.recv())
        .await
        .expect("push within deadline")
        .expect("push");
    assert_eq!(topic, "orders");
    assert_eq!(msg, json!({"qty": 3}));

    client.exit().await;
    server.exit();
}

#[tokio::test]
async fn handshake_accepts_matching_credentials() {
    let auth = BasicAuth {
        username: "svc".to_owned(),
        password: "secret".to_owned(),
    };
    let server = UtServer::start(test_config(Some(auth)), test_registry())
        .await
        .expect("start");

    let client = UtClient::connect(
        ClientConfig::new(server.ws_url()).basic_auth("svc", "secret"),
    )
    .await
    .expect("authorized connect");
    let sum = client
        .call(
            "add",
            vec![],
            ut_client::dicts([("a", 1), ("b", 1)]),
            CallOptions::default(),
        )
        .await
        .expect("call");
    assert_eq!(sum, json!(2));

    client.exit().await;
    server.exit();
}

#[tokio::test]
async fn handshake_rejects_bad_credentials() {
    let auth = BasicAuth {
        username: "svc".to_owned(),
        password: "secret".to_owned(),
    };
    let server = UtServer::start(test_config(Some(auth)), test_registry())
        .await
        .expect("start");

    let err = UtClient::connect(
        ClientConfig::new(server.ws_url())
            .basic_auth("svc", "wrong")
            .max_reconnect_attempts(0),
    )
    .await
    .expect_err("rejected");
    assert!(
        matches!(err, ClientError::Handshake(_)),
        "expected handshake rejection, got {err}"
    );
    server.exit();
}
