//! Server-side heartbeat handling: reactive PONGs and the anti-flood cut.

use std::time::Duration;

use ut_server::UtServer;
use ut_server::config::ServerConfig;
use ut_server::registry::MethodRegistry;
use ut_test_utils::{ProbeEvent, RawProbe};

async fn start_server(limit: Duration) -> UtServer {
    let cfg = ServerConfig {
        web_port: 0,
        rpc_port: 0,
        limit_heartbeat_interval: limit,
        ..ServerConfig::default()
    };
    UtServer::start(cfg, MethodRegistry::builder().build())
        .await
        .expect("start")
}

#[tokio::test]
async fn paced_pings_each_get_a_pong() {
    let server = start_server(Duration::from_millis(50)).await;
    let mut probe = RawProbe::connect(&server.rpc_addr().to_string())
        .await
        .expect("connect");

    for _ in 0..3 {
        probe.send_ping().await.expect("ping");
        match probe.next_event().await.expect("event") {
            ProbeEvent::Pong => {}
            other => panic!("expected pong, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    server.exit();
}

#[tokio::test]
async fn two_pings_inside_the_floor_drop_the_connection() {
    let server = start_server(Duration::from_secs(1)).await;
    let mut probe = RawProbe::connect(&server.rpc_addr().to_string())
        .await
        .expect("connect");

    probe.send_ping().await.expect("first ping");
    match probe.next_event().await.expect("event") {
        ProbeEvent::Pong => {}
        other => panic!("expected pong for the first ping, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    probe.send_ping().await.expect("second ping");

    // No PONG for the flooding ping; the server just hangs up.
    match probe.next_event().await.expect("event") {
        ProbeEvent::Eof => {}
        other => panic!("expected eof after the flood, got {other:?}"),
    }
    server.exit();
}
