//! Dev-mode broadcast injection endpoint.

use crate::http::response;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct BroadcastParams {
    /// Event name, e.g. `message` or `html-update`.
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub data: Option<String>,
}

pub async fn broadcast(
    State(state): State<AppState>,
    Query(params): Query<BroadcastParams>,
) -> Response {
    let Some(name) = params.event_type.filter(|t| !t.is_empty()) else {
        return response::bad_request("missing 'type' query parameter");
    };
    state
        .broker
        .broadcast(name, params.data.unwrap_or_default());
    (
        StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({ "accepted": true })),
    )
        .into_response()
}
