// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Signed trigger notifications.
//!
//! Each target receives the same JSON body. When a target has a secret,
//! `X-Deadswitch-Signature` carries `hex(HMAC-SHA256(secret, body))`.
//! A failing target never stops the remaining ones.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{redirect, Client};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::models::{Switch, SwitchStatus};

pub const EVENT_HEADER: &str = "X-Deadswitch-Event";
pub const SIGNATURE_HEADER: &str = "X-Deadswitch-Signature";
pub const TRIGGER_EVENT: &str = "switch.triggered";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(6);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WebhookError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("failed to serialize payload: {0}")]
    Serialize(String),

    #[error("webhook signing failed: {0}")]
    Signing(String),

    #[error("POST {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("POST {url} returned {status}")]
    Status { url: String, status: u16 },
}

/// Body posted to every webhook when a switch fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub message_id: String,
    pub recipient_email: String,
    pub content: String,
    pub trigger_duration: u32,
    pub last_seen: DateTime<Utc>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl WebhookPayload {
    /// Build the trigger payload from a switch and its decrypted content.
    pub fn triggered(switch: &Switch, content: &str) -> Self {
        Self {
            event: TRIGGER_EVENT.to_string(),
            message_id: switch.id.clone(),
            recipient_email: switch.recipient_email.clone(),
            content: content.to_string(),
            trigger_duration: switch.trigger_duration,
            last_seen: switch.last_seen,
            status: SwitchStatus::Triggered.as_str().to_string(),
            created_at: switch.created_at,
        }
    }
}

/// A resolved destination. `secret` is plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub url: String,
    pub secret: Option<String>,
}

impl fmt::Debug for WebhookTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookTarget")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Default)]
pub struct WebhookReport {
    /// URLs that answered 2xx, in send order.
    pub fired: Vec<String>,
    pub failed: usize,
    pub last_error: Option<WebhookError>,
}

impl WebhookReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSender {
    http: Client,
}

impl WebhookSender {
    pub fn new() -> Result<Self, WebhookError> {
        // Redirects could lead to hosts that were never validated
        let http = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(Self { http })
    }

    /// POST `payload` to every target, continuing past failures.
    pub async fn send_all(&self, targets: &[WebhookTarget], payload: &WebhookPayload) -> WebhookReport {
        let mut report = WebhookReport::default();
        if targets.is_empty() {
            return report;
        }

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                report.failed = targets.len();
                report.last_error = Some(WebhookError::Serialize(e.to_string()));
                return report;
            }
        };

        for target in targets {
            match self.post(target, &payload.event, &body).await {
                Ok(()) => {
                    info!(url = %target.url, message_id = %payload.message_id, "Webhook delivered");
                    report.fired.push(target.url.clone());
                }
                Err(e) => {
                    warn!(url = %target.url, message_id = %payload.message_id, error = %e, "Webhook failed");
                    report.failed += 1;
                    report.last_error = Some(e);
                }
            }
        }
        report
    }

    async fn post(&self, target: &WebhookTarget, event: &str, body: &[u8]) -> Result<(), WebhookError> {
        let mut request = self
            .http
            .post(&target.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, event);

        if let Some(secret) = target.secret.as_deref().filter(|s| !s.is_empty()) {
            request = request.header(SIGNATURE_HEADER, sign(secret, body)?);
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| WebhookError::Request {
                url: target.url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(WebhookError::Status {
                url: target.url.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// =============================================================================
// Test receiver
// =============================================================================
