use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bk_protocol::{HttpErrorEnvelope, error_codes};
use std::fmt::Display;

pub type HttpResponse = Response;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> HttpResponse {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

pub fn bad_request(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, error_codes::BAD_REQUEST, message)
}

pub fn not_found(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, message)
}

/// Internal error; detail is only echoed back in dev mode.
pub fn internal_error(dev_mode: bool, err: impl Display) -> HttpResponse {
    let message = if dev_mode {
        err.to_string()
    } else {
        "internal error".to_owned()
    };
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_codes::INTERNAL_ERROR,
        message,
    )
}

/// A second client raced an attached session id.
pub fn session_conflict(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::CONFLICT, error_codes::SESSION_CONFLICT, message)
}

pub fn shutting_down(message: impl Into<String>) -> HttpResponse {
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        error_codes::SHUTTING_DOWN,
        message,
    )
}
