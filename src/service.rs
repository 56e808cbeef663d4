// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Switch Service
//!
//! The operations an authenticated management API calls: switch CRUD,
//! heartbeats, attachments, settings, and webhook registrations.
//!
//! Every mutation of a triggered switch fails with
//! [`ServiceError::AlreadyTriggered`]. Secrets are encrypted before they
//! reach the store and never returned in plaintext except through
//! [`SwitchService::get_switch_plaintext`] and [`SwitchService::smtp_config`].

use std::sync::Arc;

use chrono::Duration;
use subtle::ConstantTimeEq;
use tracing::info;
use uuid::Uuid;

use crate::crypto::{generate_token, CryptoError, CryptoService, SessionToken};
use crate::delivery::{validate_webhook_url, HostAllowList, SmtpConfig, UrlValidationError};
use crate::models::{
    validate_trigger_duration, Attachment, Settings, Switch, SwitchEdit, SwitchStatus, Webhook, WebhookEdit,
};
use crate::scheduler::{Clock, SystemClock};
use crate::storage::{AttachmentError, AttachmentStore, StoreError, SwitchStore};

/// Random bytes in management and heartbeat tokens.
pub const TOKEN_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("switch {0} has already been triggered")]
    AlreadyTriggered(String),

    #[error("{0}")]
    Validation(String),

    #[error("invalid heartbeat token")]
    InvalidHeartbeatToken,

    #[error("invalid session")]
    InvalidSession,

    #[error(transparent)]
    InvalidWebhookUrl(#[from] UrlValidationError),

    #[error(transparent)]
    Attachment(AttachmentError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::AlreadyTriggered(id) => ServiceError::AlreadyTriggered(id),
            other => ServiceError::Store(other),
        }
    }
}

impl From<AttachmentError> for ServiceError {
    fn from(e: AttachmentError) -> Self {
        match e {
            AttachmentError::SwitchTriggered(id) => ServiceError::AlreadyTriggered(id),
            AttachmentError::NotFound(id) => ServiceError::NotFound(format!("Attachment {id}")),
            AttachmentError::Store(e) => e.into(),
            other => ServiceError::Attachment(other),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Input for [`SwitchService::create_switch`].
#[derive(Debug, Clone)]
pub struct NewSwitch {
    pub content: String,
    pub recipient_email: String,
    pub trigger_duration: i64,
}

/// Fields to change on an existing switch; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct SwitchUpdate {
    pub content: Option<String>,
    pub recipient_email: Option<String>,
    pub trigger_duration: Option<i64>,
}

/// A switch with its message decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainSwitch {
    pub switch: Switch,
    pub content: String,
}

/// Changes to a webhook registration. `secret: Some("")` removes the secret.
#[derive(Debug, Clone, Default)]
pub struct WebhookUpdate {
    pub url: Option<String>,
    pub secret: Option<String>,
    pub enabled: Option<bool>,
}

pub struct SwitchService {
    store: Arc<dyn SwitchStore>,
    crypto: Arc<CryptoService>,
    attachments: Arc<AttachmentStore>,
    allow_list: HostAllowList,
    clock: Arc<dyn Clock>,
}

impl SwitchService {
    pub fn new(
        store: Arc<dyn SwitchStore>,
        crypto: Arc<CryptoService>,
        attachments: Arc<AttachmentStore>,
        allow_list: HostAllowList,
    ) -> Self {
        Self {
            store,
            crypto,
            attachments,
            allow_list,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // =========================================================================
    // Switches
    // =========================================================================

    pub fn create_switch(&self, input: NewSwitch) -> ServiceResult<Switch> {
        let trigger_duration = validate_trigger_duration(input.trigger_duration).map_err(ServiceError::Validation)?;
        let recipient_email = validate_recipient(&input.recipient_email)?;
        let now = self.clock.now();

        let switch = Switch {
            id: Uuid::new_v4().to_string(),
            encrypted_content: self.crypto.encrypt(&input.content)?,
            recipient_email,
            trigger_duration,
            last_seen: now,
            reminder_sent: false,
            status: SwitchStatus::Active,
            created_at: now,
            management_token: generate_token(TOKEN_BYTES),
        };
        self.store.insert_switch(&switch)?;

        info!(switch_id = %switch.id, trigger_duration, "Switch created");
        Ok(switch)
    }

    pub fn get_switch(&self, id: &str) -> ServiceResult<Switch> {
        self.store
            .get_switch(id)?
            .ok_or_else(|| ServiceError::NotFound(format!("Switch {id}")))
    }

    pub fn get_switch_plaintext(&self, id: &str) -> ServiceResult<PlainSwitch> {
        let switch = self.get_switch(id)?;
        let content = self.crypto.decrypt(&switch.encrypted_content)?;
        Ok(PlainSwitch { switch, content })
    }

    pub fn list_switches(&self) -> ServiceResult<Vec<Switch>> {
        Ok(self.store.list_switches()?)
    }

    /// Edit content, recipient, or duration. The deadline clock is not reset.
    ///
    /// Only the changed fields are written, inside one store write, so a
    /// heartbeat landing concurrently is never rolled back.
    pub fn update_switch(&self, id: &str, update: SwitchUpdate) -> ServiceResult<Switch> {
        self.active_switch(id)?;

        let edit = SwitchEdit {
            encrypted_content: update
                .content
                .map(|content| self.crypto.encrypt(&content))
                .transpose()?,
            recipient_email: update
                .recipient_email
                .map(|recipient| validate_recipient(&recipient))
                .transpose()?,
            trigger_duration: update
                .trigger_duration
                .map(|minutes| validate_trigger_duration(minutes).map_err(ServiceError::Validation))
                .transpose()?,
        };

        let switch = self.store.edit_switch(id, &edit)?;
        info!(switch_id = %switch.id, "Switch updated");
        Ok(switch)
    }

    /// Reset one switch's deadline clock.
    pub fn heartbeat(&self, id: &str) -> ServiceResult<Switch> {
        let switch = self.store.heartbeat_switch(id, self.clock.now())?;
        info!(switch_id = %id, deadline = %switch.deadline(), "Heartbeat received");
        Ok(switch)
    }

    /// Remove a switch in any state, with its attachment files.
    pub fn delete_switch(&self, id: &str) -> ServiceResult<()> {
        self.get_switch(id)?;
        self.attachments.purge_switch(id)?;
        self.store.delete_switch(id)?;
        info!(switch_id = %id, "Switch deleted");
        Ok(())
    }

    fn active_switch(&self, id: &str) -> ServiceResult<Switch> {
        let switch = self.get_switch(id)?;
        if !switch.is_active() {
            return Err(ServiceError::AlreadyTriggered(switch.id));
        }
        Ok(switch)
    }

    // =========================================================================
    // Quick heartbeat
    // =========================================================================

    /// Reset every active switch if `token` matches the deployment's
    /// heartbeat token. Returns how many switches were reset.
    pub fn quick_heartbeat(&self, token: &str) -> ServiceResult<usize> {
        let settings = self.store.get_settings()?;
        let expected = settings.heartbeat_token.as_bytes();
        if expected.is_empty() || !bool::from(expected.ct_eq(token.as_bytes())) {
            return Err(ServiceError::InvalidHeartbeatToken);
        }

        let count = self.store.heartbeat_all(self.clock.now())?;
        info!(count, "Quick heartbeat reset all active switches");
        Ok(count)
    }

    /// Create the heartbeat token on first start. Returns the token in use.
    pub fn ensure_heartbeat_token(&self) -> ServiceResult<String> {
        let mut settings = self.store.get_settings()?;
        if settings.heartbeat_token.is_empty() {
            settings.heartbeat_token = generate_token(TOKEN_BYTES);
            self.store.save_settings(&settings)?;
            info!("Generated heartbeat token");
        }
        Ok(settings.heartbeat_token)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_settings(&self) -> ServiceResult<Settings> {
        Ok(self.store.get_settings()?)
    }

    /// Save settings. Empty secrets and hashes keep their stored values;
    /// new secrets are encrypted.
    pub fn save_settings(&self, incoming: Settings) -> ServiceResult<Settings> {
        let current = self.store.get_settings()?;

        if !incoming.webhook_url.trim().is_empty() {
            validate_webhook_url(&incoming.webhook_url, &self.allow_list)?;
        }
        if !incoming.owner_email.trim().is_empty() {
            validate_recipient(&incoming.owner_email)?;
        }

        let settings = Settings {
            smtp_password: self.keep_or_encrypt(&incoming.smtp_password, current.smtp_password)?,
            webhook_secret: self.keep_or_encrypt(&incoming.webhook_secret, current.webhook_secret)?,
            heartbeat_token: keep_if_empty(incoming.heartbeat_token, current.heartbeat_token),
            master_password_hash: keep_if_empty(incoming.master_password_hash, current.master_password_hash),
            recovery_key_hash: keep_if_empty(incoming.recovery_key_hash, current.recovery_key_hash),
            webhook_url: incoming.webhook_url.trim().to_string(),
            owner_email: incoming.owner_email.trim().to_string(),
            ..incoming
        };

        self.store.save_settings(&settings)?;
        info!(smtp = settings.has_smtp(), owner = settings.has_owner(), "Settings saved");
        Ok(settings)
    }

    /// Decrypted SMTP settings, or `None` when sending should be simulated.
    pub fn smtp_config(&self) -> ServiceResult<Option<SmtpConfig>> {
        let settings = self.store.get_settings()?;
        Ok(SmtpConfig::from_settings(&settings, &self.crypto)?)
    }

    fn keep_or_encrypt(&self, incoming: &str, stored: String) -> ServiceResult<String> {
        if incoming.is_empty() {
            return Ok(stored);
        }
        Ok(self.crypto.encrypt_if_needed(incoming)?)
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    pub fn register_webhook(&self, url: &str, secret: Option<&str>, enabled: bool) -> ServiceResult<Webhook> {
        let url = validate_webhook_url(url, &self.allow_list)?;
        let webhook = Webhook {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            secret: self.seal_secret(secret)?,
            enabled,
            created_at: self.clock.now(),
        };
        self.store.insert_webhook(&webhook)?;
        info!(webhook_id = %webhook.id, url = %webhook.url, "Webhook registered");
        Ok(webhook)
    }

    pub fn update_webhook(&self, id: &str, update: WebhookUpdate) -> ServiceResult<Webhook> {
        let edit = WebhookEdit {
            url: update
                .url
                .map(|url| validate_webhook_url(&url, &self.allow_list).map(|url| url.to_string()))
                .transpose()?,
            secret: update
                .secret
                .map(|secret| self.seal_secret(Some(&secret)))
                .transpose()?,
            enabled: update.enabled,
        };

        let webhook = self.store.edit_webhook(id, &edit)?;
        info!(webhook_id = %webhook.id, enabled = webhook.enabled, "Webhook updated");
        Ok(webhook)
    }

    pub fn delete_webhook(&self, id: &str) -> ServiceResult<()> {
        self.store.delete_webhook(id)?;
        info!(webhook_id = %id, "Webhook deleted");
        Ok(())
    }

    pub fn list_webhooks(&self) -> ServiceResult<Vec<Webhook>> {
        Ok(self.store.list_webhooks()?)
    }

    fn seal_secret(&self, secret: Option<&str>) -> ServiceResult<Option<String>> {
        match secret.map(str::trim).filter(|s| !s.is_empty()) {
            Some(secret) => Ok(Some(self.crypto.encrypt_if_needed(secret)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    pub fn upload_attachment(&self, switch_id: &str, filename: &str, data: &[u8]) -> ServiceResult<Attachment> {
        let switch = self.get_switch(switch_id)?;
        Ok(self.attachments.upload(&switch, filename, data)?)
    }

    pub fn list_attachments(&self, switch_id: &str) -> ServiceResult<Vec<Attachment>> {
        self.get_switch(switch_id)?;
        Ok(self.store.list_attachments(switch_id)?)
    }

    pub fn delete_attachment(&self, switch_id: &str, attachment_id: &str) -> ServiceResult<()> {
        let switch = self.get_switch(switch_id)?;
        Ok(self.attachments.delete(&switch, attachment_id)?)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub fn issue_session(&self, ttl: Duration) -> ServiceResult<String> {
        Ok(SessionToken::issue(&self.crypto, ttl, self.clock.now())?)
    }

    pub fn verify_session(&self, token: &str) -> ServiceResult<SessionToken> {
        SessionToken::verify(&self.crypto, token, self.clock.now()).map_err(|_| ServiceError::InvalidSession)
    }
}

fn keep_if_empty(incoming: String, stored: String) -> String {
    if incoming.is_empty() {
        stored
    } else {
        incoming
    }
}

fn validate_recipient(raw: &str) -> ServiceResult<String> {
    let email = raw.trim();
    if email.is_empty() {
        return Err(ServiceError::Validation("recipient email is required".into()));
    }
    if email.contains(['\r', '\n']) {
        return Err(ServiceError::Validation("email must not contain line breaks".into()));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(email.to_string())
        }
        _ => Err(ServiceError::Validation(format!("invalid email address: {email}"))),
    }
}
