//! JSON response bodies shared by the gate and the admin surface.
//!
//! Deny responses carry a machine-readable reason code and generic text.
//! Pattern text and categories never appear here.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::security::gate::DenyReason;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessageBody {
    pub success: bool,
    pub message: String,
}

pub fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            success: false,
            error: code,
            message: message.into(),
        }),
    )
        .into_response()
}

pub fn deny_response(reason: DenyReason) -> Response {
    error_response(reason.status(), reason.code(), reason.message())
}

pub fn payload_too_large(limit: usize) -> Response {
    error_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        "payload_too_large",
        format!("Request body exceeds {limit} bytes"),
    )
}

pub fn message_response(message: impl Into<String>) -> Response {
    Json(MessageBody {
        success: true,
        message: message.into(),
    })
    .into_response()
}
