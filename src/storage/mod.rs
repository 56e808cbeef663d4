// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage
//!
//! Persistence for switches, attachments, settings, and webhooks, plus the
//! encrypted attachment files on disk.
//!
//! The rest of the service talks to the [`SwitchStore`] trait. Production
//! uses [`RedbStore`]; tests use [`InMemoryStore`]. Both apply each
//! read-modify-write (heartbeat, trigger) atomically per record.

pub mod attachments;
pub mod content;
pub mod database;
pub mod memory;
pub mod paths;

use chrono::{DateTime, Utc};

use crate::models::{Attachment, ReminderPolicy, Settings, Switch, SwitchEdit, Webhook, WebhookEdit};

pub use attachments::{AttachmentError, AttachmentLimits, AttachmentStore, DecryptedAttachment};
pub use database::RedbStore;
pub use memory::InMemoryStore;
pub use paths::StoragePaths;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("switch {0} has already been triggered")]
    AlreadyTriggered(String),

    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Record store consumed by the service, scheduler, and delivery pipeline.
pub trait SwitchStore: Send + Sync {
    // ========== Switches ==========

    fn insert_switch(&self, switch: &Switch) -> StoreResult<()>;

    fn get_switch(&self, id: &str) -> StoreResult<Option<Switch>>;

    /// Apply `edit` to the stored switch and return the result. Refused
    /// once the stored copy is triggered.
    fn edit_switch(&self, id: &str, edit: &SwitchEdit) -> StoreResult<Switch>;

    /// Remove a switch and every attachment record belonging to it.
    fn delete_switch(&self, id: &str) -> StoreResult<()>;

    fn list_switches(&self) -> StoreResult<Vec<Switch>>;

    /// Reset one active switch's clock.
    fn heartbeat_switch(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Switch>;

    /// Reset every active switch's clock; returns how many were reset.
    fn heartbeat_all(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Flag the reminder for the window that started at `window_start`.
    /// Returns `false` (and changes nothing) when the switch is no longer
    /// active or a heartbeat has since moved `last_seen`.
    fn mark_reminder_sent(&self, id: &str, window_start: DateTime<Utc>) -> StoreResult<bool>;

    /// Move a switch to the terminal state. Idempotent.
    fn mark_triggered(&self, id: &str) -> StoreResult<()>;

    /// Active switches owed a reminder at `now`.
    fn due_reminders(
        &self,
        now: DateTime<Utc>,
        policy: ReminderPolicy,
    ) -> StoreResult<Vec<Switch>> {
        Ok(self
            .list_switches()?
            .into_iter()
            .filter(|switch| switch.needs_reminder(now, policy))
            .collect())
    }

    /// Active switches whose deadline has passed at `now`.
    fn due_triggers(&self, now: DateTime<Utc>) -> StoreResult<Vec<Switch>> {
        Ok(self
            .list_switches()?
            .into_iter()
            .filter(|switch| switch.is_due(now))
            .collect())
    }

    // ========== Attachments ==========

    fn insert_attachment(&self, attachment: &Attachment) -> StoreResult<()>;

    fn get_attachment(&self, id: &str) -> StoreResult<Option<Attachment>>;

    fn list_attachments(&self, switch_id: &str) -> StoreResult<Vec<Attachment>>;

    fn delete_attachment(&self, id: &str) -> StoreResult<()>;

    // ========== Settings ==========

    /// The settings singleton, or defaults when never saved.
    fn get_settings(&self) -> StoreResult<Settings>;

    fn save_settings(&self, settings: &Settings) -> StoreResult<()>;

    // ========== Webhooks ==========

    fn insert_webhook(&self, webhook: &Webhook) -> StoreResult<()>;

    fn get_webhook(&self, id: &str) -> StoreResult<Option<Webhook>>;

    fn list_webhooks(&self) -> StoreResult<Vec<Webhook>>;

    fn edit_webhook(&self, id: &str, edit: &WebhookEdit) -> StoreResult<Webhook>;

    fn delete_webhook(&self, id: &str) -> StoreResult<()>;
}
