// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Public quick-heartbeat page.
//!
//! The link in reminder emails lands here. The token in the path is the
//! only credential, so the page says nothing beyond success or rejection.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use tracing::warn;

use crate::error::ApiError;
use crate::service::ServiceError;
use crate::state::AppState;

/// `GET` / `POST /heartbeat/{token}`.
pub async fn quick_heartbeat(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.service.quick_heartbeat(&token) {
        Ok(count) => (StatusCode::OK, Html(confirmation_page(count))).into_response(),
        Err(ServiceError::InvalidHeartbeatToken) => {
            warn!("Quick heartbeat rejected: invalid token");
            (StatusCode::NOT_FOUND, Html(rejection_page())).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

fn confirmation_page(count: usize) -> String {
    let noun = if count == 1 { "switch" } else { "switches" };
    page(
        "Heartbeat received",
        &format!("Heartbeat received. {count} {noun} reset."),
    )
}

fn rejection_page() -> String {
    page(
        "Invalid heartbeat token",
        "Invalid heartbeat token. No switches were reset.",
    )
}

fn page(title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <meta name=\"robots\" content=\"noindex\">\n<title>{title}</title>\n</head>\n\
         <body>\n<main>\n<h1>{title}</h1>\n<p>{message}</p>\n</main>\n</body>\n</html>\n"
    )
}
