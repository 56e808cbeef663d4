// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod health;
pub mod heartbeat;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/heartbeat/{token}",
            get(heartbeat::quick_heartbeat).post(heartbeat::quick_heartbeat),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use chrono::Duration;
    use tower::ServiceExt;

    use super::*;
    use crate::scheduler::Clock;
    use crate::service::testing::{fixture, new_switch, Fixture};
    use crate::storage::SwitchStore;

    fn app(f: &Fixture) -> Router {
        router(AppState::new(f.service.clone()))
    }

    async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let f = fixture();
        let (status, body) = send(&app(&f), Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn quick_heartbeat_resets_switches() {
        let f = fixture();
        let switch = f.service.create_switch(new_switch(60)).unwrap();
        let token = f.service.ensure_heartbeat_token().unwrap();
        f.clock.advance(Duration::minutes(20));
        let app = app(&f);

        for method in [Method::GET, Method::POST] {
            let (status, body) = send(&app, method, &format!("/heartbeat/{token}")).await;
            assert_eq!(status, StatusCode::OK);
            assert!(body.contains("Heartbeat received. 1 switch reset."));
        }

        let stored = f.store.get_switch(&switch.id).unwrap().unwrap();
        assert_eq!(stored.last_seen, f.clock.now());
    }

    #[tokio::test]
    async fn wrong_token_renders_rejection() {
        let f = fixture();
        f.service.ensure_heartbeat_token().unwrap();

        let (status, body) = send(&app(&f), Method::GET, "/heartbeat/not-the-token").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("Invalid heartbeat token"));
    }
}
