//! Duplicate-session protection.
//!
//! Two clients presenting the same session id at the same time: the later
//! connect is refused with a conflict and the earlier subscriber keeps its
//! stream.

use basekit::{Config, Dependencies, Kit};
use bk_test_utils::{ConnectOptions, SseClient, SseClientError};
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

#[tokio::test]
async fn second_client_with_the_same_session_id_is_refused() {
    let (addr, kit) = start_kit(test_config()).await;
    let url = format!("http://{addr}/events");

    let mut original = SseClient::connect(&url, ConnectOptions::default())
        .await
        .expect("connect");
    let ack = original.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    let session_id = ack.session_id;

    let err = SseClient::connect(
        &url,
        ConnectOptions {
            session_id: Some(session_id.clone()),
            last_event_id: None,
        },
    )
    .await
    .expect_err("the racing connect must be rejected");
    match err {
        SseClientError::Status(409) => {}
        other => panic!("expected 409 conflict, got {other}"),
    }

    // The legitimate connection is untouched.
    kit.broker.broadcast("msg", "still-mine");
    let frame = original.next_data_frame(FRAME_TIMEOUT).await.expect("frame");
    assert_eq!(frame.data, "still-mine");

    // After the original disconnects, the id becomes reusable again.
    drop(original);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let mut resumed = SseClient::connect(
        &url,
        ConnectOptions {
            session_id: Some(session_id.clone()),
            last_event_id: None,
        },
    )
    .await
    .expect("reconnect after detach");
    let ack = resumed.connect_ack(FRAME_TIMEOUT).await.expect("ack");
    assert_eq!(ack.session_id, session_id);

    kit.shutdown().await;
}
