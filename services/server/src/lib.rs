//! HTTP surface of the kit: the SSE endpoint, the operator endpoints, and
//! the component rewrite filter, assembled into one axum router.

pub mod filter;
pub mod http;
pub mod state;

pub use state::AppState;

use axum::{
    Router, middleware,
    routing::{get, post},
};

/// Assemble the kit endpoints, merge the application's routes, and wrap the
/// whole surface in the component rewrite filter. The filter only touches
/// buffered `text/html` responses, so the SSE endpoint streams through it
/// unbuffered.
pub fn build_router(state: AppState, app: Router) -> Router {
    let mut kit = Router::new()
        .route("/events", get(http::sse::events))
        .route("/stats", get(http::stats::stats))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz));

    if state.dev_mode {
        // Test-only surface: synchronous broadcast injection.
        kit = kit.route("/broadcast", post(http::broadcast::broadcast));
    }

    kit.with_state(state.clone())
        .merge(app)
        .fallback(fallback_404)
        .layer(middleware::from_fn_with_state(
            state,
            filter::expand_components,
        ))
}

async fn fallback_404() -> axum::response::Response {
    http::response::not_found("no such route")
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
