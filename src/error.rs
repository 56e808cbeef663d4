// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::service::ServiceError;
use crate::storage::AttachmentError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: &'static str,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal server error",
        )
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::NotFound(what) => Self::not_found(format!("{what} not found")),
            ServiceError::AlreadyTriggered(_) => Self::conflict("already_triggered", e.to_string()),
            ServiceError::Validation(message) => {
                Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
            }
            ServiceError::InvalidHeartbeatToken => Self::new(
                StatusCode::NOT_FOUND,
                "invalid_heartbeat_token",
                e.to_string(),
            ),
            ServiceError::InvalidSession => {
                Self::new(StatusCode::UNAUTHORIZED, "invalid_session", e.to_string())
            }
            ServiceError::InvalidWebhookUrl(inner) => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_webhook_url",
                inner.to_string(),
            ),
            ServiceError::Attachment(inner) => attachment_error(inner),
            ServiceError::Crypto(_) | ServiceError::Store(_) => {
                // Details stay in the log, never in the response
                error!(error = %e, "Request failed");
                Self::internal()
            }
        }
    }
}

fn attachment_error(e: AttachmentError) -> ApiError {
    match e {
        AttachmentError::FileTooLarge { .. }
        | AttachmentError::QuotaExceeded { .. }
        | AttachmentError::TooManyFiles { .. } => ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "attachment_limit",
            e.to_string(),
        ),
        AttachmentError::ExtensionNotAllowed(_) | AttachmentError::TypeNotAllowed(_) => {
            ApiError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "attachment_type",
                e.to_string(),
            )
        }
        AttachmentError::Empty => ApiError::new(StatusCode::BAD_REQUEST, "attachment_empty", e.to_string()),
        AttachmentError::SwitchTriggered(_) => ApiError::conflict("already_triggered", e.to_string()),
        AttachmentError::NotFound(_) => ApiError::not_found(e.to_string()),
        AttachmentError::Crypto(_) | AttachmentError::Store(_) | AttachmentError::Io(_) => {
            error!(error = %e, "Attachment operation failed");
            ApiError::internal()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });
        (self.status, body).into_response()
    }
}
