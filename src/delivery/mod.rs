// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Delivery
//!
//! Everything that leaves the process when a switch fires or a reminder
//! is due.
//!
//! - `email` - SMTP transport, MIME building, retry
//! - `webhook` - HMAC-signed JSON POSTs
//! - `url_guard` - webhook URL acceptance (SSRF rules)
//! - `templates` - email wording
//! - `pipeline` - the ordered steps run for one triggered switch

pub mod email;
pub mod pipeline;
pub mod templates;
pub mod url_guard;
pub mod webhook;

pub use email::{EmailError, Mailer, OutgoingEmail, SendOutcome, SmtpConfig, SmtpMailer};
pub use pipeline::{DeliveryError, DeliveryPipeline, DeliveryReport, EmailStatus};
pub use url_guard::{validate_webhook_url, HostAllowList, UrlValidationError};
pub use webhook::{WebhookError, WebhookPayload, WebhookReport, WebhookSender, WebhookTarget};
