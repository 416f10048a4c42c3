//! Component expansion through the HTTP filter.
//!
//! Application routes merged into the kit router get their `text/html`
//! responses rewritten: registered `<bk-*>` elements are expanded (with
//! slots and nesting), renderer failures leave the element in place without
//! failing the response, and the SSE stream bypasses the filter entirely.

use axum::Router;
use axum::response::Html;
use axum::routing::get;
use basekit::{Config, Dependencies, Kit, RenderError};
use bk_components::{Attrs, Slots};
use bk_test_utils::{ConnectOptions, SseClient};
use std::net::SocketAddr;
use std::time::Duration;

const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

fn test_config(dev_mode: bool) -> Config {
    let mut config = Config::default();
    config.dev_mode = dev_mode;
    config.broker.heartbeat_secs = 600;
    config.broker.cleanup_secs = 600;
    config
}

fn app_routes() -> Router {
    Router::new()
        .route(
            "/page",
            get(|| async {
                Html(
                    "<html><body>\
                     <bk-badge label=\"new\"></bk-badge>\
                     </body></html>",
                )
            }),
        )
        .route(
            "/card",
            get(|| async {
                Html(
                    "<html><body><bk-card>\
                     <bk-slot name=\"header\"><em>Title</em></bk-slot>\
                     <p>body text</p>\
                     </bk-card></body></html>",
                )
            }),
        )
        .route(
            "/broken",
            get(|| async { Html("<html><body><bk-broken></bk-broken></body></html>") }),
        )
        .route("/plain", get(|| async { "<bk-badge></bk-badge>" }))
}

fn register_components(kit: &Kit) {
    kit.components.register("bk-badge", |attrs: &Attrs, _: &Slots| {
        let label = attrs.get("label").map_or("?", String::as_str);
        Ok(format!(r#"<span class="badge">{label}</span>"#))
    });
    kit.components.register("bk-card", |_: &Attrs, slots: &Slots| {
        let header = slots.get("header").map_or("", String::as_str);
        let body = slots.get("default").map_or("", String::as_str);
        Ok(format!(
            r#"<div class="card"><h2>{header}</h2><div class="card-body">{body}</div></div>"#
        ))
    });
    kit.components.register("bk-broken", |_: &Attrs, _: &Slots| {
        Err(RenderError::new("template missing"))
    });
}

async fn start_kit(config: Config) -> (SocketAddr, Kit) {
    let kit = basekit::wire(config, Dependencies::default())
        .await
        .expect("wiring failed");
    register_components(&kit);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind server");
    let addr = listener.local_addr().expect("local addr");
    let router = kit.router(app_routes());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, kit)
}

async fn fetch(addr: SocketAddr, path: &str) -> (u16, String) {
    let response = reqwest::Client::new()
        .get(format!("http://{addr}{path}"))
        .send()
        .await
        .expect("request");
    let status = response.status().as_u16();
    let body = response.text().await.expect("body");
    (status, body)
}

#[tokio::test]
async fn registered_components_are_expanded_in_html_responses() {
    let (addr, kit) = start_kit(test_config(false)).await;

    let (status, body) = fetch(addr, "/page").await;
    assert_eq!(status, 200);
    assert!(body.contains(r#"<span class="badge">new</span>"#), "got: {body}");
    assert!(!body.contains("bk-badge"), "got: {body}");

    kit.shutdown().await;
}

#[tokio::test]
async fn slots_feed_the_renderer() {
    let (addr, kit) = start_kit(test_config(false)).await;

    let (_, body) = fetch(addr, "/card").await;
    assert!(body.contains("<h2><em>Title</em></h2>"), "got: {body}");
    assert!(body.contains("<p>body text</p>"), "got: {body}");
    assert!(!body.contains("bk-slot"), "got: {body}");

    kit.shutdown().await;
}

#[tokio::test]
async fn renderer_failure_never_fails_the_response() {
    let (addr, kit) = start_kit(test_config(false)).await;

    let (status, body) = fetch(addr, "/broken").await;
    assert_eq!(status, 200, "renderer errors must not 500");
    assert!(body.contains("<bk-broken>"), "element left as-is: {body}");

    kit.shutdown().await;
}

#[tokio::test]
async fn non_html_responses_are_untouched() {
    let (addr, kit) = start_kit(test_config(false)).await;

    let (_, body) = fetch(addr, "/plain").await;
    assert!(body.contains("<bk-badge>"), "got: {body}");

    kit.shutdown().await;
}

#[tokio::test]
async fn dev_mode_adds_expansion_boundary_comments() {
    let (addr, kit) = start_kit(test_config(true)).await;

    let (_, body) = fetch(addr, "/page").await;
    assert!(body.contains("<!-- bk-badge -->"), "got: {body}");
    assert!(body.contains("<!-- /bk-badge -->"), "got: {body}");

    kit.shutdown().await;
}

/// The filter must not buffer the event stream: frames flow live and their
/// payloads are not rewritten even when they contain component markup.
#[tokio::test]
async fn sse_frames_bypass_the_rewrite_filter() {
    let (addr, kit) = start_kit(test_config(false)).await;

    let mut client = SseClient::connect(
        &format!("http://{addr}/events"),
        ConnectOptions::default(),
    )
    .await
    .expect("connect");
    client.connect_ack(FRAME_TIMEOUT).await.expect("ack");

    kit.broker
        .broadcast("html-update", "<bk-badge label=\"x\"></bk-badge>");
    let frame = client.next_data_frame(FRAME_TIMEOUT).await.expect("frame");
    assert_eq!(frame.event.as_deref(), Some("html-update"));
    assert_eq!(
        frame.data, "<bk-badge label=\"x\"></bk-badge>",
        "event payloads stream through unexpanded"
    );

    kit.shutdown().await;
}
