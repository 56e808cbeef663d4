// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Data Models
//!
//! Records persisted by the switch store. Sensitive fields are stored in
//! their encrypted form; the names say so (`encrypted_content`,
//! `smtp_password`, `secret`).
//!
//! ## Model Categories
//!
//! - **Switch**: message, recipient, deadline, state
//! - **Attachment**: ciphertext file belonging to one switch
//! - **Settings**: singleton SMTP / owner / heartbeat configuration
//! - **Webhook**: outbound endpoint registrations

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Shortest allowed trigger duration, in minutes.
pub const MIN_TRIGGER_MINUTES: u32 = 1;

/// Longest allowed trigger duration (one year), in minutes.
pub const MAX_TRIGGER_MINUTES: u32 = 525_600;

/// Fixed primary key of the settings singleton.
pub const SETTINGS_ID: u32 = 1;

// =============================================================================
// Switch
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStatus {
    Active,
    /// Terminal: delivery has run and nothing may change the switch.
    Triggered,
}

impl SwitchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchStatus::Active => "active",
            SwitchStatus::Triggered => "triggered",
        }
    }
}

/// A dead man's switch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Switch {
    pub id: String,
    /// Message body, output of `CryptoService::encrypt`.
    pub encrypted_content: String,
    pub recipient_email: String,
    /// Minutes without a heartbeat before the switch fires.
    pub trigger_duration: u32,
    pub last_seen: DateTime<Utc>,
    pub reminder_sent: bool,
    pub status: SwitchStatus,
    pub created_at: DateTime<Utc>,
    /// Correlation token for external systems. Not an access credential.
    pub management_token: String,
}

impl Switch {
    pub fn is_active(&self) -> bool {
        self.status == SwitchStatus::Active
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.trigger_duration))
    }

    /// `last_seen + trigger_duration`.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.last_seen + self.duration()
    }

    /// Time left before the deadline, clamped at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline() - now).max(Duration::zero())
    }

    /// Active and past its deadline.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.deadline() <= now
    }

    /// Active, not yet reminded, and far enough into its window.
    pub fn needs_reminder(&self, now: DateTime<Utc>, policy: ReminderPolicy) -> bool {
        self.is_active() && !self.reminder_sent && policy.threshold_reached(self, now)
    }

    /// Reset the deadline clock.
    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        self.reminder_sent = false;
    }
}

/// Field changes applied to a stored switch inside one store write.
/// Heartbeat state (`last_seen`, `reminder_sent`) is left as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchEdit {
    pub encrypted_content: Option<String>,
    pub recipient_email: Option<String>,
    pub trigger_duration: Option<u32>,
}

impl SwitchEdit {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, switch: &mut Switch) {
        if let Some(content) = &self.encrypted_content {
            switch.encrypted_content = content.clone();
        }
        if let Some(recipient) = &self.recipient_email {
            switch.recipient_email = recipient.clone();
        }
        if let Some(minutes) = self.trigger_duration {
            switch.trigger_duration = minutes;
        }
    }
}

/// When the owner is reminded, as a share of the trigger window.
///
/// Only a single threshold is supported. A list of per-offset reminders
/// would replace this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderPolicy {
    percent_elapsed: u32,
}

impl ReminderPolicy {
    pub const fn new(percent_elapsed: u32) -> Self {
        Self { percent_elapsed }
    }

    pub fn percent_elapsed(&self) -> u32 {
        self.percent_elapsed
    }

    fn threshold_reached(&self, switch: &Switch, now: DateTime<Utc>) -> bool {
        let elapsed = (now - switch.last_seen).num_seconds();
        if elapsed < 0 {
            return false;
        }
        let window = i64::from(switch.trigger_duration) * 60;
        elapsed * 100 >= window * i64::from(self.percent_elapsed)
    }
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self::new(50)
    }
}

/// Check a caller-supplied trigger duration.
pub fn validate_trigger_duration(minutes: i64) -> Result<u32, String> {
    if minutes < i64::from(MIN_TRIGGER_MINUTES) || minutes > i64::from(MAX_TRIGGER_MINUTES) {
        return Err(format!(
            "trigger duration must be between {MIN_TRIGGER_MINUTES} and {MAX_TRIGGER_MINUTES} minutes"
        ));
    }
    u32::try_from(minutes).map_err(|e| e.to_string())
}

// =============================================================================
// Attachment
// =============================================================================

/// An encrypted file attached to a switch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub switch_id: String,
    /// Sanitized original filename, used only when delivering.
    pub filename: String,
    /// Location of the ciphertext on disk.
    pub storage_path: PathBuf,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Sniffed content type.
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Settings
// =============================================================================

/// Singleton deployment settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    /// Marked ciphertext (`enc:v1:...`) or empty.
    pub smtp_password: String,
    pub smtp_from: String,
    pub smtp_from_name: String,
    /// Legacy single webhook; fires alongside registered webhooks.
    pub webhook_url: String,
    /// Marked ciphertext or empty.
    pub webhook_secret: String,
    /// Receives reminders and delivery confirmations.
    pub owner_email: String,
    /// Path token for the public quick-heartbeat link.
    pub heartbeat_token: String,
    /// Consumed by the authentication layer.
    pub master_password_hash: String,
    /// Consumed by the authentication layer.
    pub recovery_key_hash: String,
}

impl Settings {
    pub fn has_smtp(&self) -> bool {
        !self.smtp_host.trim().is_empty() && !self.smtp_from.trim().is_empty()
    }

    pub fn has_owner(&self) -> bool {
        !self.owner_email.trim().is_empty()
    }
}

// =============================================================================
// Webhook
// =============================================================================

/// A registered outbound webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Webhook {
    pub id: String,
    /// Validated https URL.
    pub url: String,
    /// Marked ciphertext of the HMAC secret, or `None`.
    pub secret: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Field changes applied to a stored webhook inside one store write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookEdit {
    pub url: Option<String>,
    /// `Some(None)` removes the secret.
    pub secret: Option<Option<String>>,
    pub enabled: Option<bool>,
}

impl WebhookEdit {
    pub fn apply(&self, webhook: &mut Webhook) {
        if let Some(url) = &self.url {
            webhook.url = url.clone();
        }
        if let Some(secret) = &self.secret {
            webhook.secret = secret.clone();
        }
        if let Some(enabled) = self.enabled {
            webhook.enabled = enabled;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::switch_at;
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn due_exactly_at_deadline() {
        let switch = switch_at("s", t0(), 60);
        assert!(!switch.is_due(t0() + Duration::minutes(59)));
        assert!(switch.is_due(t0() + Duration::minutes(60)));
        assert!(switch.is_due(t0() + Duration::minutes(61)));
    }

    #[test]
    fn triggered_switch_is_never_due() {
        let mut switch = switch_at("s", t0(), 1);
        switch.status = SwitchStatus::Triggered;
        assert!(!switch.is_due(t0() + Duration::days(1)));
        assert!(!switch.needs_reminder(t0() + Duration::days(1), ReminderPolicy::default()));
    }

    #[test]
    fn reminder_threshold_is_half_the_window() {
        let policy = ReminderPolicy::default();
        let mut switch = switch_at("s", t0(), 100);
        assert!(!switch.needs_reminder(t0() + Duration::minutes(49), policy));
        assert!(switch.needs_reminder(t0() + Duration::minutes(50), policy));

        switch.reminder_sent = true;
        assert!(!switch.needs_reminder(t0() + Duration::minutes(90), policy));
    }

    #[test]
    fn heartbeat_resets_clock_and_reminder() {
        let mut switch = switch_at("s", t0(), 60);
        switch.reminder_sent = true;
        let later = t0() + Duration::minutes(45);
        switch.record_heartbeat(later);
        assert_eq!(switch.deadline(), later + Duration::minutes(60));
        assert!(!switch.reminder_sent);
    }

    #[test]
    fn edit_leaves_heartbeat_state_alone() {
        let mut switch = switch_at("s", t0(), 60);
        switch.reminder_sent = true;
        let edit = SwitchEdit {
            recipient_email: Some("new@example.com".into()),
            trigger_duration: Some(120),
            ..SwitchEdit::default()
        };
        edit.apply(&mut switch);

        assert_eq!(switch.recipient_email, "new@example.com");
        assert_eq!(switch.trigger_duration, 120);
        assert_eq!(switch.last_seen, t0());
        assert!(switch.reminder_sent);
        assert!(SwitchEdit::default().is_empty());
    }

    #[test]
    fn remaining_never_negative() {
        let switch = switch_at("s", t0(), 10);
        assert_eq!(switch.remaining(t0() + Duration::minutes(4)), Duration::minutes(6));
        assert_eq!(switch.remaining(t0() + Duration::hours(2)), Duration::zero());
    }

    #[test]
    fn trigger_duration_bounds() {
        assert!(validate_trigger_duration(0).is_err());
        assert!(validate_trigger_duration(-5).is_err());
        assert_eq!(validate_trigger_duration(1), Ok(1));
        assert_eq!(validate_trigger_duration(525_600), Ok(525_600));
        assert!(validate_trigger_duration(525_601).is_err());
    }

    #[test]
    fn settings_smtp_requires_host_and_from() {
        let mut settings = Settings::default();
        assert!(!settings.has_smtp());
        settings.smtp_host = "smtp.example.com".into();
        assert!(!settings.has_smtp());
        settings.smtp_from = "noreply@example.com".into();
        assert!(settings.has_smtp());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SwitchStatus::Triggered).unwrap(),
            "\"triggered\""
        );
    }
}
