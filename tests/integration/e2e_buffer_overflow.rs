//! Buffer overflow signalling on reconnect.
//!
//! With a buffer of N and more than N events missed, the reconnecting client
//! cannot be made whole: it receives exactly one synthetic `buffer-overflow`
//! frame followed by the newest N events, all marked replayed.

use basekit::{Config, Dependencies, Kit};
use bk_test_utils::{ConnectOptions, SseClient};
use std::net::SocketAddr;
use std::time::Duration;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);
const BUFFER_SIZE: usize = 100;

fn test_config() -> Config {
    let mut config = Config::default();
    config.dev_mode = true;
    config.broker.buffer_size = BUFFER_SIZE;
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

#[tokio::test]
async fn overflowed_reconnect_gets_one_marker_then_the_newest_window() {
    let (addr, kit) = start_kit(test_config()).await;
    let url = format!("http://{addr}/events");

    let mut client = SseClient::connect(&url, ConnectOptions::default())
        .await
        .expect("connect");
    let ack = client.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    let session_id = ack.session_id;

    kit.broker.broadcast("msg", "seed");
    let seed = client.next_data_frame(FRAME_TIMEOUT).await.expect("seed");
    let cursor = seed.id.clone().expect("id");
    drop(client);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // 150 events into a 100-slot buffer: m1..=m50 fall off the end.
    for i in 1..=150 {
        kit.broker.broadcast("msg", format!("m{i}"));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut resumed = SseClient::connect(
        &url,
        ConnectOptions {
            session_id: Some(session_id),
            last_event_id: Some(cursor),
        },
    )
    .await
    .expect("reconnect");
    let ack = resumed.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    assert!(ack.dropped, "the ack must warn about the lossy replay");

    let marker = resumed.next_data_frame(FRAME_TIMEOUT).await.expect("marker");
    assert_eq!(marker.event.as_deref(), Some("buffer-overflow"));

    let mut replayed = Vec::with_capacity(BUFFER_SIZE);
    for i in 0..BUFFER_SIZE {
        let frame = resumed
            .next_data_frame(FRAME_TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("replay frame {i}: {e}"));
        assert_eq!(frame.event.as_deref(), Some("msg-replayed"));
        replayed.push(frame.data);
    }
    assert_eq!(replayed.first().map(String::as_str), Some("m51"));
    assert_eq!(replayed.last().map(String::as_str), Some("m150"));

    // Exactly one marker, exactly the newest window, then straight to live.
    kit.broker.broadcast("msg", "live-again");
    let live = resumed.next_data_frame(FRAME_TIMEOUT).await.expect("live");
    assert_eq!(live.event.as_deref(), Some("msg"));
    assert_eq!(live.data, "live-again");

    kit.shutdown().await;
}

/// A cursor adjacent to the remembered window resumes cleanly even though
/// the buffer has overflowed at some point.
#[tokio::test]
async fn adjacent_cursor_resumes_without_the_marker() {
    let mut config = test_config();
    config.broker.buffer_size = 5;
    let (addr, kit) = start_kit(config).await;
    let url = format!("http://{addr}/events");

    let mut client = SseClient::connect(&url, ConnectOptions::default())
        .await
        .expect("connect");
    let ack = client.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    let session_id = ack.session_id;

    // Overflow the buffer while attached, tracking the cursor as we go.
    let mut cursor = None;
    for i in 1..=8 {
        kit.broker.broadcast("msg", format!("m{i}"));
        let frame = client.next_data_frame(FRAME_TIMEOUT).await.expect("frame");
        if i == 3 {
            cursor = frame.id.clone();
        }
    }
    drop(client);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Buffer remembers m4..=m8; a cursor at m3 is adjacent to m4.
    let mut resumed = SseClient::connect(
        &url,
        ConnectOptions {
            session_id: Some(session_id),
            last_event_id: cursor,
        },
    )
    .await
    .expect("reconnect");
    let ack = resumed.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    assert!(!ack.dropped, "adjacent cursor means nothing was lost");
    assert_eq!(ack.replayed, 5);

    let first = resumed.next_data_frame(FRAME_TIMEOUT).await.expect("first");
    assert_eq!(first.data, "m4");

    kit.shutdown().await;
}
