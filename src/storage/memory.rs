// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory switch store for tests and throwaway instances.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::{StoreError, StoreResult, SwitchStore};
use crate::models::{Attachment, Settings, Switch, SwitchEdit, SwitchStatus, Webhook, WebhookEdit};

#[derive(Default)]
struct Tables {
    switches: HashMap<String, Switch>,
    attachments: HashMap<String, Attachment>,
    settings: Option<Settings>,
    webhooks: HashMap<String, Webhook>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> StoreResult<T> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&tables))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> StoreResult<T>) -> StoreResult<T> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        f(&mut tables)
    }

    fn modify_switch<F>(&self, id: &str, mutate: F) -> StoreResult<Switch>
    where
        F: FnOnce(&mut Switch) -> StoreResult<()>,
    {
        self.write(|tables| {
            let switch = tables
                .switches
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("Switch {id}")))?;
            mutate(switch)?;
            Ok(switch.clone())
        })
    }
}

impl SwitchStore for InMemoryStore {
    fn insert_switch(&self, switch: &Switch) -> StoreResult<()> {
        self.write(|tables| {
            tables.switches.insert(switch.id.clone(), switch.clone());
            Ok(())
        })
    }

    fn get_switch(&self, id: &str) -> StoreResult<Option<Switch>> {
        self.read(|tables| tables.switches.get(id).cloned())
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
        self.write(|tables| {
            if tables.switches.remove(id).is_none() {
                return Err(StoreError::NotFound(format!("Switch {id}")));
            }
            tables
                .attachments
                .retain(|_, attachment| attachment.switch_id != id);
            Ok(())
        })
    }

    fn list_switches(&self) -> StoreResult<Vec<Switch>> {
        self.read(|tables| {
            let mut switches: Vec<Switch> = tables.switches.values().cloned().collect();
            switches.sort_by(|a, b| a.id.cmp(&b.id));
            switches
        })
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
        self.write(|tables| {
            let mut count = 0;
            for switch in tables.switches.values_mut().filter(|s| s.is_active()) {
                switch.record_heartbeat(now);
                count += 1;
            }
            Ok(count)
        })
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
        self.write(|tables| {
            tables
                .attachments
                .insert(attachment.id.clone(), attachment.clone());
            Ok(())
        })
    }

    fn get_attachment(&self, id: &str) -> StoreResult<Option<Attachment>> {
        self.read(|tables| tables.attachments.get(id).cloned())
    }

    fn list_attachments(&self, switch_id: &str) -> StoreResult<Vec<Attachment>> {
        self.read(|tables| {
            let mut attachments: Vec<Attachment> = tables
                .attachments
                .values()
                .filter(|attachment| attachment.switch_id == switch_id)
                .cloned()
                .collect();
            attachments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            attachments
        })
    }

    fn delete_attachment(&self, id: &str) -> StoreResult<()> {
        self.write(|tables| {
            tables
                .attachments
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(format!("Attachment {id}")))
        })
    }

    fn get_settings(&self) -> StoreResult<Settings> {
        self.read(|tables| tables.settings.clone().unwrap_or_default())
    }

    fn save_settings(&self, settings: &Settings) -> StoreResult<()> {
        self.write(|tables| {
            tables.settings = Some(settings.clone());
            Ok(())
        })
    }

    fn insert_webhook(&self, webhook: &Webhook) -> StoreResult<()> {
        self.write(|tables| {
            tables.webhooks.insert(webhook.id.clone(), webhook.clone());
            Ok(())
        })
    }

    fn get_webhook(&self, id: &str) -> StoreResult<Option<Webhook>> {
        self.read(|tables| tables.webhooks.get(id).cloned())
    }

    fn list_webhooks(&self) -> StoreResult<Vec<Webhook>> {
        self.read(|tables| {
            let mut webhooks: Vec<Webhook> = tables.webhooks.values().cloned().collect();
            webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            webhooks
        })
    }

    fn edit_webhook(&self, id: &str, edit: &WebhookEdit) -> StoreResult<Webhook> {
        self.write(|tables| match tables.webhooks.get_mut(id) {
            Some(stored) => {
                edit.apply(stored);
                Ok(stored.clone())
            }
            None => Err(StoreError::NotFound(format!("Webhook {id}"))),
        })
    }

    fn delete_webhook(&self, id: &str) -> StoreResult<()> {
        self.write(|tables| {
            tables
                .webhooks
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(format!("Webhook {id}")))
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::ReminderPolicy;

    /// Wraps an [`InMemoryStore`] whose webhook table can no longer be read.
    #[derive(Default)]
    pub struct UnreadableWebhooks {
        pub inner: InMemoryStore,
    }

    impl SwitchStore for UnreadableWebhooks {
        fn insert_switch(&self, switch: &Switch) -> StoreResult<()> {
            self.inner.insert_switch(switch)
        }

        fn get_switch(&self, id: &str) -> StoreResult<Option<Switch>> {
            self.inner.get_switch(id)
        }

        fn edit_switch(&self, id: &str, edit: &SwitchEdit) -> StoreResult<Switch> {
            self.inner.edit_switch(id, edit)
        }

        fn delete_switch(&self, id: &str) -> StoreResult<()> {
            self.inner.delete_switch(id)
        }

        fn list_switches(&self) -> StoreResult<Vec<Switch>> {
            self.inner.list_switches()
        }

        fn heartbeat_switch(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Switch> {
            self.inner.heartbeat_switch(id, now)
        }

        fn heartbeat_all(&self, now: DateTime<Utc>) -> StoreResult<usize> {
            self.inner.heartbeat_all(now)
        }

        fn mark_reminder_sent(&self, id: &str, window_start: DateTime<Utc>) -> StoreResult<bool> {
            self.inner.mark_reminder_sent(id, window_start)
        }

        fn mark_triggered(&self, id: &str) -> StoreResult<()> {
            self.inner.mark_triggered(id)
        }

        fn due_reminders(&self, now: DateTime<Utc>, policy: ReminderPolicy) -> StoreResult<Vec<Switch>> {
            self.inner.due_reminders(now, policy)
        }

        fn insert_attachment(&self, attachment: &Attachment) -> StoreResult<()> {
            self.inner.insert_attachment(attachment)
        }

        fn get_attachment(&self, id: &str) -> StoreResult<Option<Attachment>> {
            self.inner.get_attachment(id)
        }

        fn list_attachments(&self, switch_id: &str) -> StoreResult<Vec<Attachment>> {
            self.inner.list_attachments(switch_id)
        }

        fn delete_attachment(&self, id: &str) -> StoreResult<()> {
            self.inner.delete_attachment(id)
        }

        fn get_settings(&self) -> StoreResult<Settings> {
            self.inner.get_settings()
        }

        fn save_settings(&self, settings: &Settings) -> StoreResult<()> {
            self.inner.save_settings(settings)
        }

        fn insert_webhook(&self, webhook: &Webhook) -> StoreResult<()> {
            self.inner.insert_webhook(webhook)
        }

        fn get_webhook(&self, _id: &str) -> StoreResult<Option<Webhook>> {
            Err(StoreError::Poisoned)
        }

        fn list_webhooks(&self) -> StoreResult<Vec<Webhook>> {
            Err(StoreError::Poisoned)
        }

        fn edit_webhook(&self, _id: &str, _edit: &WebhookEdit) -> StoreResult<Webhook> {
            Err(StoreError::Poisoned)
        }

        fn delete_webhook(&self, _id: &str) -> StoreResult<()> {
            Err(StoreError::Poisoned)
        }
    }
}
