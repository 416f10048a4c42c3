//! The SSE endpoint: binds a long-lived HTTP response to a broker session.
//!
//! Wire format per frame:
//! ```text
//! id: <event-id>
//! event: <name>            (suffix "-replayed" on replayed frames)
//! data: <payload lines>
//! ```
//! The first frame is always a `connected` acknowledgement carrying the
//! assigned session id; buffered replay frames follow, then the live pump.

use crate::http::response;
use crate::state::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use bk_broker::{BrokerHandle, RegisterError, Registration};
use bk_protocol::{ConnectAck, Event, EventId, event_names};
use std::collections::HashMap;
use std::convert::Infallible;
use tracing::{debug, warn};

/// Session identity cookie. Long-lived so it outlives the replay window.
pub const SESSION_COOKIE: &str = "sse-session-id";
/// Fallback for clients that cannot send cookies.
pub const SESSION_HEADER: &str = "x-sse-session-id";
/// Optional auth session token; resolved to a user id in session metadata.
pub const AUTH_COOKIE: &str = "bk-auth";

const COOKIE_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 365;

pub async fn events(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let supplied_id = cookie_value(&headers, SESSION_COOKIE)
        .or_else(|| header_string(&headers, SESSION_HEADER));
    let last_event_id = last_event_id(&headers);
    let metadata = connect_metadata(&state, &headers);

    match state
        .broker
        .register(supplied_id, last_event_id, metadata)
        .await
    {
        Ok(registration) => stream_response(&state, registration),
        Err(RegisterError::SessionConflict) => {
            response::session_conflict("session already has a live subscriber")
        }
        Err(RegisterError::ShuttingDown) => response::shutting_down("broker is shutting down"),
    }
}

fn stream_response(state: &AppState, registration: Registration) -> Response {
    let session_id = registration.session_id.clone();
    let ack = ConnectAck {
        session_id: session_id.clone(),
        replayed: registration.replay.len(),
        dropped: registration.dropped,
    };
    let guard = UnregisterGuard {
        broker: state.broker.clone(),
        session_id: session_id.clone(),
    };

    let stream = async_stream::stream! {
        // Owned by the stream: dropping the response (client gone, server
        // shutdown) detaches the subscriber promptly.
        let _guard = guard;
        let ack_json = serde_json::to_string(&ack).unwrap_or_else(|_| "{}".to_owned());
        yield Ok::<SseEvent, Infallible>(
            SseEvent::default()
                .event(event_names::CONNECTED)
                .data(ack_json),
        );
        for event in registration.replay {
            yield Ok(frame(&event));
        }
        let mut live = registration.events;
        while let Some(event) = live.recv().await {
            yield Ok(frame(&event));
        }
        debug!("event feed closed");
    };

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    // Disable proxy buffering so frames reach the client as written.
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(cookie) = HeaderValue::from_str(&session_cookie(&session_id, state.secure_cookies)) {
        headers.append(header::SET_COOKIE, cookie);
    }
    response
}

fn frame(event: &Event) -> SseEvent {
    let text = String::from_utf8_lossy(&event.data);
    // Bare carriage returns are not representable in data: lines.
    let data = if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text.into_owned()
    };
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.wire_name())
        .data(data)
}

struct UnregisterGuard {
    broker: BrokerHandle,
    session_id: String,
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        self.broker.unregister(&self.session_id);
    }
}

// ---------------------------------------------------------------------------
// Header plumbing
// ---------------------------------------------------------------------------

fn last_event_id(headers: &HeaderMap) -> Option<EventId> {
    let raw = headers.get("last-event-id")?.to_str().ok()?;
    match raw.parse::<EventId>() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(last_event_id = raw, "ignoring malformed Last-Event-ID");
            None
        }
    }
}

fn connect_metadata(state: &AppState, headers: &HeaderMap) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(agent) = header_string(headers, "user-agent") {
        metadata.insert("user_agent".to_owned(), agent);
    }
    if let Some(token) = cookie_value(headers, AUTH_COOKIE) {
        if let Some(user_id) = state.auth.validate_session(&token) {
            metadata.insert("user_id".to_owned(), user_id);
        }
    }
    metadata
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
}

/// First matching cookie across all `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some((key, value)) = pair.split_once('=') {
                if key == name {
                    return Some(value.to_owned());
                }
            }
        }
    }
    None
}

fn session_cookie(session_id: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={session_id}; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}; HttpOnly; SameSite=Strict"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}
