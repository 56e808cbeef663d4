// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Delivery of one triggered switch.
//!
//! Order of work:
//!
//! 1. Decrypt attachments and content. Any failure here aborts the run and
//!    nothing is sent.
//! 2. Email the recipient (or simulate when SMTP is not configured).
//! 3. Fan out to enabled webhooks plus the settings webhook.
//! 4. Purge attachment files, records, and the switch directory.
//! 5. Email the owner a confirmation when SMTP and an owner are set.
//!
//! Steps 2 to 5 log failures and carry on, so once the recipient email has
//! been attempted `deliver` always returns `Ok`. The caller marks the switch
//! triggered afterwards.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::email::{send_or_simulate, EmailAttachment, EmailError, Mailer, SendOutcome, SmtpConfig};
use super::templates;
use super::webhook::{WebhookPayload, WebhookReport, WebhookSender, WebhookTarget};
use crate::crypto::{CryptoError, CryptoService};
use crate::models::{Settings, Switch};
use crate::storage::{AttachmentError, AttachmentStore, StoreError, SwitchStore};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to decrypt switch content: {0}")]
    Content(#[source] CryptoError),

    #[error("failed to load SMTP settings: {0}")]
    SmtpSettings(#[source] CryptoError),

    #[error("failed to open attachments: {0}")]
    Attachments(#[from] AttachmentError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to the recipient email.
#[derive(Debug, Clone)]
pub enum EmailStatus {
    Sent,
    Simulated,
    Failed(EmailError),
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub switch_id: String,
    pub email: EmailStatus,
    pub attachments_sent: usize,
    pub webhooks: WebhookReport,
    pub attachments_purged: usize,
    pub confirmation_sent: bool,
}

pub struct DeliveryPipeline {
    store: Arc<dyn SwitchStore>,
    crypto: Arc<CryptoService>,
    attachments: Arc<AttachmentStore>,
    mailer: Arc<dyn Mailer>,
    webhooks: WebhookSender,
}

impl DeliveryPipeline {
    pub fn new(
        store: Arc<dyn SwitchStore>,
        crypto: Arc<CryptoService>,
        attachments: Arc<AttachmentStore>,
        mailer: Arc<dyn Mailer>,
        webhooks: WebhookSender,
    ) -> Self {
        Self {
            store,
            crypto,
            attachments,
            mailer,
            webhooks,
        }
    }

    pub fn mailer(&self) -> &dyn Mailer {
        self.mailer.as_ref()
    }

    /// Run every delivery step for `switch`. Does not change its status.
    pub async fn deliver(&self, switch: &Switch) -> Result<DeliveryReport, DeliveryError> {
        let attachments = self.attachments.read_all_decrypted(&switch.id)?;
        let content = self
            .crypto
            .decrypt(&switch.encrypted_content)
            .map_err(DeliveryError::Content)?;

        let settings = self.store.get_settings()?;
        let smtp = SmtpConfig::from_settings(&settings, &self.crypto).map_err(DeliveryError::SmtpSettings)?;

        let attachments_sent = attachments.len();
        let email = templates::delivery_email(
            switch,
            &content,
            attachments.into_iter().map(EmailAttachment::from).collect(),
        );
        let email_status = match send_or_simulate(self.mailer.as_ref(), smtp.as_ref(), &email).await {
            Ok(SendOutcome::Sent) => EmailStatus::Sent,
            Ok(SendOutcome::Simulated) => EmailStatus::Simulated,
            Err(e) => {
                error!(switch_id = %switch.id, error = %e, "Recipient email failed");
                EmailStatus::Failed(e)
            }
        };

        let (targets, unresolved) = self.webhook_targets(&settings);
        let payload = WebhookPayload::triggered(switch, &content);
        let mut webhooks = self.webhooks.send_all(&targets, &payload).await;
        webhooks.failed += unresolved;

        let attachments_purged = match self.attachments.purge_switch(&switch.id) {
            Ok(count) => count,
            Err(e) => {
                error!(switch_id = %switch.id, error = %e, "Attachment purge failed");
                0
            }
        };

        let confirmation_sent = match smtp.as_ref() {
            Some(smtp) if settings.has_owner() => {
                let notice = templates::confirmation_email(&settings.owner_email, switch, &webhooks.fired);
                match self.mailer.send(smtp, &notice).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(switch_id = %switch.id, error = %e, "Owner confirmation failed");
                        false
                    }
                }
            }
            _ => false,
        };

        info!(
            switch_id = %switch.id,
            email = ?email_status,
            attachments = attachments_sent,
            webhooks_fired = webhooks.fired.len(),
            webhooks_failed = webhooks.failed,
            "Switch delivered"
        );

        Ok(DeliveryReport {
            switch_id: switch.id.clone(),
            email: email_status,
            attachments_sent,
            webhooks,
            attachments_purged,
            confirmation_sent,
        })
    }

    /// Enabled registrations plus the settings webhook, secrets decrypted.
    /// A target whose secret cannot be decrypted is skipped and counted, as
    /// is an unreadable registration list.
    fn webhook_targets(&self, settings: &Settings) -> (Vec<WebhookTarget>, usize) {
        let mut targets = Vec::new();
        let mut unresolved = 0;

        let registered = match self.store.list_webhooks() {
            Ok(webhooks) => webhooks,
            Err(e) => {
                error!(error = %e, "Failed to list webhooks, sending to settings webhook only");
                unresolved += 1;
                Vec::new()
            }
        };
        let registered = registered
            .into_iter()
            .filter(|webhook| webhook.enabled)
            .map(|webhook| (webhook.url, webhook.secret.unwrap_or_default()));
        let legacy = (!settings.webhook_url.trim().is_empty())
            .then(|| (settings.webhook_url.trim().to_string(), settings.webhook_secret.clone()));

        for (url, stored_secret) in registered.chain(legacy) {
            if targets.iter().any(|t: &WebhookTarget| t.url == url) {
                continue;
            }
            let secret = if stored_secret.is_empty() {
                None
            } else {
                match self.crypto.decrypt_if_needed(&stored_secret) {
                    Ok(secret) => Some(secret),
                    Err(e) => {
                        error!(url = %url, error = %e, "Webhook secret could not be decrypted, skipping");
                        unresolved += 1;
                        continue;
                    }
                }
            };
            targets.push(WebhookTarget { url, secret });
        }
        (targets, unresolved)
    }
}
