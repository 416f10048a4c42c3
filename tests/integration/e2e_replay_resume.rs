//! End-to-end replay and resume tests.
//!
//! A client that disconnects and reconnects with its session cookie and a
//! `Last-Event-ID` cursor receives exactly the events it missed, marked with
//! the `-replayed` name suffix and carrying their original ids, before the
//! live feed resumes.

use basekit::{Config, Dependencies, Kit};
use bk_test_utils::{ConnectOptions, SseClient};
use std::net::SocketAddr;
use std::time::Duration;

const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

fn test_config() -> Config {
    let mut config = Config::default();
    config.dev_mode = true;
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

/// Scenario: miss two events while away, reconnect with the cursor of the
/// last delivered event, get both replayed in order, then live events.
#[tokio::test]
async fn reconnect_replays_missed_events_then_resumes_live() {
    let (addr, kit) = start_kit(test_config()).await;

    let mut client = SseClient::connect(&events_url(addr), ConnectOptions::default())
        .await
        .expect("connect");
    let ack = client.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    let session_id = ack.session_id;

    kit.broker.broadcast("msg", "one");
    let one = client.next_data_frame(FRAME_TIMEOUT).await.expect("one");
    assert_eq!(one.data, "one");
    let cursor = one.id.clone().expect("live frame id");

    // Disconnect and miss two events.
    drop(client);
    tokio::time::sleep(Duration::from_millis(150)).await;
    kit.broker.broadcast("msg", "two");
    kit.broker.broadcast("msg", "three");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut resumed = SseClient::connect(
        &events_url(addr),
        ConnectOptions {
            session_id: Some(session_id.clone()),
            last_event_id: Some(cursor),
        },
    )
    .await
    .expect("reconnect");
    let ack = resumed.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    assert_eq!(ack.session_id, session_id, "session id survives reconnects");
    assert_eq!(ack.replayed, 2);
    assert!(!ack.dropped);

    let two = resumed.next_data_frame(FRAME_TIMEOUT).await.expect("two");
    let three = resumed.next_data_frame(FRAME_TIMEOUT).await.expect("three");
    assert_eq!(two.event.as_deref(), Some("msg-replayed"));
    assert_eq!(two.data, "two");
    assert_eq!(three.event.as_deref(), Some("msg-replayed"));
    assert_eq!(three.data, "three");

    kit.broker.broadcast("msg", "four");
    let four = resumed.next_data_frame(FRAME_TIMEOUT).await.expect("four");
    assert_eq!(four.event.as_deref(), Some("msg"), "live events are unmarked");
    assert_eq!(four.data, "four");

    // Ids stay strictly increasing across the replay/live boundary.
    let ids: Vec<String> = [&two, &three, &four]
        .iter()
        .map(|f| f.id.clone().expect("id"))
        .collect();
    assert!(ids[0] < ids[1] && ids[1] < ids[2], "ids: {ids:?}");

    kit.shutdown().await;
}

/// Boundary: a cursor equal to the most recent delivered id replays nothing.
#[tokio::test]
async fn reconnect_at_the_tip_replays_nothing() {
    let (addr, kit) = start_kit(test_config()).await;

    let mut client = SseClient::connect(&events_url(addr), ConnectOptions::default())
        .await
        .expect("connect");
    let ack = client.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    let session_id = ack.session_id;

    kit.broker.broadcast("msg", "one");
    let one = client.next_data_frame(FRAME_TIMEOUT).await.expect("one");
    let cursor = one.id.clone().expect("id");
    drop(client);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut resumed = SseClient::connect(
        &events_url(addr),
        ConnectOptions {
            session_id: Some(session_id),
            last_event_id: Some(cursor),
        },
    )
    .await
    .expect("reconnect");
    let ack = resumed.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    assert_eq!(ack.replayed, 0, "nothing was missed");

    kit.broker.broadcast("msg", "fresh");
    let fresh = resumed.next_data_frame(FRAME_TIMEOUT).await.expect("fresh");
    assert_eq!(fresh.data, "fresh");

    kit.shutdown().await;
}

/// A reconnect without any cursor replays the whole remembered window.
#[tokio::test]
async fn reconnect_without_cursor_replays_all_buffered_events() {
    let (addr, kit) = start_kit(test_config()).await;

    let mut client = SseClient::connect(&events_url(addr), ConnectOptions::default())
        .await
        .expect("connect");
    let ack = client.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    let session_id = ack.session_id;
    drop(client);
    tokio::time::sleep(Duration::from_millis(150)).await;

    kit.broker.broadcast("msg", "a");
    kit.broker.broadcast("msg", "b");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut resumed = SseClient::connect(
        &events_url(addr),
        ConnectOptions {
            session_id: Some(session_id),
            last_event_id: None,
        },
    )
    .await
    .expect("reconnect");
    let ack = resumed.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    assert_eq!(ack.replayed, 2);
    assert!(!ack.dropped, "a cursorless reconnect is not an overflow");

    kit.shutdown().await;
}
