//! Response-body interceptor that expands `<bk-*>` components.
//!
//! Runs after the handler writes and before bytes reach the network. Only
//! buffered `text/html` responses are rewritten; streaming bodies (SSE and
//! anything else without an exact size) bypass the filter untouched, as do
//! responses whose bytes contain no component tag.

use crate::state::AppState;
use axum::body::{Body, HttpBody};
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

/// Largest HTML document the filter will buffer for rewriting.
const MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

pub async fn expand_components(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if !is_buffered_html(&response) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BUFFER_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to buffer html response, dropping body");
            return crate::http::response::internal_error(state.dev_mode, e);
        }
    };

    let Ok(html) = std::str::from_utf8(&bytes) else {
        // Claimed text/html but is not UTF-8; pass through unchanged.
        debug!("non-utf8 html response left unexpanded");
        return Response::from_parts(parts, Body::from(bytes));
    };

    let expanded = state.components.expand_document(html, state.dev_mode);
    // The body length changed; let the new body drive Content-Length.
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(expanded))
}

fn is_buffered_html(response: &Response) -> bool {
    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/html"));
    if !is_html {
        return false;
    }
    // An unbounded size hint means the handler is streaming (event streams,
    // chunked bodies); those are never buffered here.
    response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= MAX_BUFFER_BYTES as u64)
}
