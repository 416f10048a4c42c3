//! Operator stats: broker counters plus job queue depths.

use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bk_protocol::StatsSnapshot;
use chrono::Utc;

pub async fn stats(State(state): State<AppState>) -> Response {
    let broker = state.broker.stats().await.unwrap_or_default();
    let jobs = state.jobs.stats().await;
    Json(StatsSnapshot {
        broker,
        jobs,
        generated_at: Some(Utc::now()),
    })
    .into_response()
}
