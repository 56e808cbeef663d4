// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded switch store backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `switches`: switch_id → JSON `Switch`
//! - `attachments`: attachment_id → JSON `Attachment`
//! - `settings`: 1 → JSON `Settings`
//! - `webhooks`: webhook_id → JSON `Webhook`

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};

use super::{StoreError, StoreResult, SwitchStore};
use crate::models::{
    Attachment, Settings, Switch, SwitchEdit, SwitchStatus, Webhook, WebhookEdit, SETTINGS_ID,
};

// =============================================================================
// Table Definitions
// =============================================================================

const SWITCHES: TableDefinition<&str, &[u8]> = TableDefinition::new("switches");

const ATTACHMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("attachments");

const SETTINGS: TableDefinition<u32, &[u8]> = TableDefinition::new("settings");

const WEBHOOKS: TableDefinition<&str, &[u8]> = TableDefinition::new("webhooks");

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

// =============================================================================
// RedbStore
// =============================================================================

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SWITCHES)?;
            let _ = write_txn.open_table(ATTACHMENTS)?;
            let _ = write_txn.open_table(SETTINGS)?;
            let _ = write_txn.open_table(WEBHOOKS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // =========================================================================
    // Generic JSON helpers
    // =========================================================================

    fn read_record<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StoreResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(def)?;
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn read_all<T: DeserializeOwned>(&self, def: JsonTable) -> StoreResult<Vec<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(def)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(value.value())?);
        }
        Ok(records)
    }

    fn insert_record<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StoreResult<()> {
        let json = serde_json::to_vec(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(def)?;
            table.insert(key, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// `kind` names the record in `NotFound` errors ("Webhook wh-1").
    fn remove_record(&self, def: JsonTable, kind: &str, key: &str) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(def)?;
            if table.remove(key)?.is_none() {
                return Err(StoreError::NotFound(format!("{kind} {key}")));
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Read, mutate, and write back one record inside a single transaction.
    fn modify_record<T, F>(&self, def: JsonTable, kind: &str, key: &str, mutate: F) -> StoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> StoreResult<()>,
    {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(def)?;

            // Read existing value and deserialize before mutating
            let existing_bytes = {
                let existing = table
                    .get(key)?
                    .ok_or_else(|| StoreError::NotFound(format!("{kind} {key}")))?;
                existing.value().to_vec()
            };

            let mut record: T = serde_json::from_slice(&existing_bytes)?;
            mutate(&mut record)?;

            let json = serde_json::to_vec(&record)?;
            table.insert(key, json.as_slice())?;
            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    fn modify_switch<F>(&self, id: &str, mutate: F) -> StoreResult<Switch>
    where
        F: FnOnce(&mut Switch) -> StoreResult<()>,
    {
        self.modify_record(SWITCHES, "Switch", id, mutate)
    }
}

impl SwitchStore for RedbStore {
    fn insert_switch(&self, switch: &Switch) -> StoreResult<()> {
        self.insert_record(SWITCHES, &switch.id, switch)
    }

    fn get_switch(&self, id: &str) -> StoreResult<Option<Switch>> {
        self.read_record(SWITCHES, id)
    }

    fn edit_switch(&self, id: &str, edit: &SwitchEdit) -> StoreResult<Switch> {
        self.modify_switch(id, |stored| {
            if stored.status == SwitchStatus::Triggered {
                return Err(StoreError::AlreadyTriggered(stored.id.clone()));
            }
            edit.apply(stored);
            Ok(())
        })
    }

    fn delete_switch(&self, id: &str) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut switches = write_txn.open_table(SWITCHES)?;
            if switches.remove(id)?.is_none() {
                return Err(StoreError::NotFound(format!("Switch {id}")));
            }

            let mut attachments = write_txn.open_table(ATTACHMENTS)?;
            let mut owned = Vec::new();
            for entry in attachments.iter()? {
                let (key, value) = entry?;
                let attachment: Attachment = serde_json::from_slice(value.value())?;
                if attachment.switch_id == id {
                    owned.push(key.value().to_string());
                }
            }
            for key in owned {
                attachments.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list_switches(&self) -> StoreResult<Vec<Switch>> {
        self.read_all(SWITCHES)
    }

    fn heartbeat_switch(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Switch> {
        self.modify_switch(id, |switch| {
            if switch.status == SwitchStatus::Triggered {
                return Err(StoreError::AlreadyTriggered(switch.id.clone()));
            }
            switch.record_heartbeat(now);
            Ok(())
        })
    }

    fn heartbeat_all(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let mut count = 0;
        {
            let mut table = write_txn.open_table(SWITCHES)?;
            let mut active = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let switch: Switch = serde_json::from_slice(value.value())?;
                if switch.is_active() {
                    active.push(switch);
                }
            }
            for mut switch in active {
                switch.record_heartbeat(now);
                let json = serde_json::to_vec(&switch)?;
                table.insert(switch.id.as_str(), json.as_slice())?;
                count += 1;
            }
        }
        write_txn.commit()?;
        Ok(count)
    }

    fn mark_reminder_sent(&self, id: &str, window_start: DateTime<Utc>) -> StoreResult<bool> {
        let mut marked = false;
        self.modify_switch(id, |switch| {
            if switch.is_active() && switch.last_seen == window_start {
                switch.reminder_sent = true;
                marked = true;
            }
            Ok(())
        })?;
        Ok(marked)
    }

    fn mark_triggered(&self, id: &str) -> StoreResult<()> {
        self.modify_switch(id, |switch| {
            switch.status = SwitchStatus::Triggered;
            Ok(())
        })
        .map(|_| ())
    }

    fn insert_attachment(&self, attachment: &Attachment) -> StoreResult<()> {
        self.insert_record(ATTACHMENTS, &attachment.id, attachment)
    }

    fn get_attachment(&self, id: &str) -> StoreResult<Option<Attachment>> {
        self.read_record(ATTACHMENTS, id)
    }

    fn list_attachments(&self, switch_id: &str) -> StoreResult<Vec<Attachment>> {
        let mut attachments: Vec<Attachment> = self
            .read_all::<Attachment>(ATTACHMENTS)?
            .into_iter()
            .filter(|attachment| attachment.switch_id == switch_id)
            .collect();
        attachments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(attachments)
    }

    fn delete_attachment(&self, id: &str) -> StoreResult<()> {
        self.remove_record(ATTACHMENTS, "Attachment", id)
    }

    fn get_settings(&self) -> StoreResult<Settings> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS)?;
        match table.get(SETTINGS_ID)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(Settings::default()),
        }
    }

    fn save_settings(&self, settings: &Settings) -> StoreResult<()> {
        let json = serde_json::to_vec(settings)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS)?;
            table.insert(SETTINGS_ID, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn insert_webhook(&self, webhook: &Webhook) -> StoreResult<()> {
        self.insert_record(WEBHOOKS, &webhook.id, webhook)
    }

    fn get_webhook(&self, id: &str) -> StoreResult<Option<Webhook>> {
        self.read_record(WEBHOOKS, id)
    }

    fn list_webhooks(&self) -> StoreResult<Vec<Webhook>> {
        let mut webhooks: Vec<Webhook> = self.read_all(WEBHOOKS)?;
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(webhooks)
    }

    fn edit_webhook(&self, id: &str, edit: &WebhookEdit) -> StoreResult<Webhook> {
        self.modify_record(WEBHOOKS, "Webhook", id, |webhook: &mut Webhook| {
            edit.apply(webhook);
            Ok(())
        })
    }

    fn delete_webhook(&self, id: &str) -> StoreResult<()> {
        self.remove_record(WEBHOOKS, "Webhook", id)
    }
}
