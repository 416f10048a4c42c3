//! End-to-end live broadcast tests.
//!
//! Covers the basic connect → broadcast → frame path: the connect
//! acknowledgement, frame ordering per subscriber, the dev-mode broadcast
//! endpoint, and the operator stats surface.

use basekit::{Config, Dependencies, Kit};
use bk_test_utils::{ConnectOptions, SseClient};
use std::net::SocketAddr;
use std::time::Duration;

const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Harness helpers (duplicated per suite so each file runs standalone)
// ---------------------------------------------------------------------------

fn test_config() -> Config {
    let mut config = Config::default();
    config.dev_mode = true;
    // Keep timer-driven traffic out of the assertions.
    config.broker.heartbeat_secs = 600;
    config.broker.cleanup_secs = 600;
    config
}

async fn start_kit(config: Config) -> (SocketAddr, Kit) {
    let kit = basekit::wire(config, Dependencies::default())
        .await
        .expect("wiring failed");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind server");
    let addr = listener.local_addr().expect("local addr");
    let router = kit.router(axum::Router::new());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, kit)
}

fn events_url(addr: SocketAddr) -> String {
    format!("http://{addr}/events")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Scenario: client connects, receives an assigned session id, and a single
/// broadcast arrives as one frame with the right name and payload.
#[tokio::test]
async fn connect_then_broadcast_delivers_one_frame() {
    let (addr, kit) = start_kit(test_config()).await;

    let mut client = SseClient::connect(&events_url(addr), ConnectOptions::default())
        .await
        .expect("connect");
    let ack = client.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    assert!(!ack.session_id.is_empty());
    assert_eq!(ack.replayed, 0);
    assert!(!ack.dropped);

    kit.broker.broadcast("msg", "one");

    let frame = client.next_data_frame(FRAME_TIMEOUT).await.expect("frame");
    assert_eq!(frame.event.as_deref(), Some("msg"));
    assert_eq!(frame.data, "one");
    assert!(frame.id.is_some(), "live frames carry the event id");

    kit.shutdown().await;
}

#[tokio::test]
async fn every_subscriber_sees_the_same_events_in_the_same_order() {
    let (addr, kit) = start_kit(test_config()).await;

    let mut a = SseClient::connect(&events_url(addr), ConnectOptions::default())
        .await
        .expect("connect a");
    let mut b = SseClient::connect(&events_url(addr), ConnectOptions::default())
        .await
        .expect("connect b");
    let ack_a = a.connect_ack(FRAME_TIMEOUT).await.expect("ack a");
    let ack_b = b.connect_ack(FRAME_TIMEOUT).await.expect("ack b");
    assert_ne!(ack_a.session_id, ack_b.session_id);

    kit.broker.broadcast("msg", "first");
    kit.broker.broadcast("msg", "second");

    for client in [&mut a, &mut b] {
        let first = client.next_data_frame(FRAME_TIMEOUT).await.expect("first");
        let second = client.next_data_frame(FRAME_TIMEOUT).await.expect("second");
        assert_eq!(first.data, "first");
        assert_eq!(second.data, "second");
        assert!(
            first.id < second.id,
            "ids must be increasing per subscriber"
        );
    }

    kit.shutdown().await;
}

#[tokio::test]
async fn dev_broadcast_endpoint_injects_events() {
    let (addr, kit) = start_kit(test_config()).await;

    let mut client = SseClient::connect(&events_url(addr), ConnectOptions::default())
        .await
        .expect("connect");
    client.connect_ack(FRAME_TIMEOUT).await.expect("ack");

    let http = reqwest::Client::new();
    let response = http
        .post(format!("http://{addr}/broadcast?type=note&data=hello"))
        .send()
        .await
        .expect("broadcast request");
    assert_eq!(response.status().as_u16(), 202);

    let frame = client.next_data_frame(FRAME_TIMEOUT).await.expect("frame");
    assert_eq!(frame.event.as_deref(), Some("note"));
    assert_eq!(frame.data, "hello");

    // Missing type parameter is a client error.
    let response = http
        .post(format!("http://{addr}/broadcast?data=x"))
        .send()
        .await
        .expect("broadcast request");
    assert_eq!(response.status().as_u16(), 400);

    kit.shutdown().await;
}

#[tokio::test]
async fn stats_reports_session_and_broadcast_counters() {
    let (addr, kit) = start_kit(test_config()).await;

    let mut client = SseClient::connect(&events_url(addr), ConnectOptions::default())
        .await
        .expect("connect");
    client.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    kit.broker.broadcast("msg", "one");
    client.next_data_frame(FRAME_TIMEOUT).await.expect("frame");

    let stats: serde_json::Value = reqwest::Client::new()
        .get(format!("http://{addr}/stats"))
        .send()
        .await
        .expect("stats request")
        .json()
        .await
        .expect("stats json");
    assert_eq!(stats["broker"]["sessions"], 1);
    assert_eq!(stats["broker"]["attached_subscribers"], 1);
    assert_eq!(stats["broker"]["events_broadcast"], 1);

    kit.shutdown().await;
}

#[tokio::test]
async fn unknown_routes_get_the_json_not_found_envelope() {
    let (addr, kit) = start_kit(test_config()).await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/no-such-route"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 404);
    let body: serde_json::Value = response.json().await.expect("error json");
    assert_eq!(body["code"], "NOT_FOUND");

    kit.shutdown().await;
}

/// Broker shutdown closes the stream; the client observes end-of-stream.
#[tokio::test]
async fn shutdown_ends_open_streams() {
    let (addr, kit) = start_kit(test_config()).await;

    let mut client = SseClient::connect(&events_url(addr), ConnectOptions::default())
        .await
        .expect("connect");
    client.connect_ack(FRAME_TIMEOUT).await.expect("ack");

    kit.shutdown().await;

    let err = client
        .next_frame(FRAME_TIMEOUT)
        .await
        .expect_err("stream must end after shutdown");
    assert!(
        matches!(
            err,
            bk_test_utils::SseClientError::Closed | bk_test_utils::SseClientError::Transport(_)
        ),
        "got: {err}"
    );
}
