// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Trigger Scheduler
//!
//! Background task that evaluates every active switch on a fixed interval
//! (default 60 s).
//!
//! ## Strategy
//!
//! Each tick runs two scans in order:
//! 1. **Reminders**: switches past the reminder threshold with no reminder
//!    sent, and not yet due, get an owner email carrying the quick-heartbeat
//!    link, then are flagged `reminder_sent` for that window. A heartbeat
//!    that lands during the send starts a new window, and the flag is not
//!    carried into it.
//! 2. **Triggers**: switches past their deadline are re-read, delivered
//!    through the [`DeliveryPipeline`], then marked triggered. A switch
//!    whose delivery cannot start (decryption failure) stays active and is
//!    retried next tick; it never blocks the others.
//!
//! Ticks run sequentially inside one task, so they never overlap.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`. A tick in progress finishes
//! before the loop exits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crypto::CryptoService;
use crate::delivery::email::{send_or_simulate, SmtpConfig};
use crate::delivery::{templates, DeliveryPipeline};
use crate::models::ReminderPolicy;
use crate::storage::SwitchStore;

/// Default interval between scans.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Source of "now" for deadline arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reminders_sent: usize,
    pub reminders_skipped: usize,
    pub triggered: usize,
    pub failed: usize,
}

pub struct TriggerScheduler {
    store: Arc<dyn SwitchStore>,
    crypto: Arc<CryptoService>,
    pipeline: Arc<DeliveryPipeline>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    policy: ReminderPolicy,
    public_base_url: String,
}

impl TriggerScheduler {
    pub fn new(
        store: Arc<dyn SwitchStore>,
        crypto: Arc<CryptoService>,
        pipeline: Arc<DeliveryPipeline>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            crypto,
            pipeline,
            clock: Arc::new(SystemClock),
            interval: DEFAULT_TICK_INTERVAL,
            policy: ReminderPolicy::default(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: ReminderPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run the scheduler loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(scheduler.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            reminder_percent = self.policy.percent_elapsed(),
            "Trigger scheduler starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Trigger scheduler shutting down");
                return;
            }

            let summary = self.tick().await;
            if summary != TickSummary::default() {
                info!(
                    reminders_sent = summary.reminders_sent,
                    reminders_skipped = summary.reminders_skipped,
                    triggered = summary.triggered,
                    failed = summary.failed,
                    "Scheduler tick complete"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Trigger scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// One pass: reminders, then triggers.
    pub async fn tick(&self) -> TickSummary {
        let now = self.clock.now();
        let mut summary = TickSummary::default();
        self.reminder_scan(now, &mut summary).await;
        self.trigger_scan(now, &mut summary).await;
        summary
    }

    async fn reminder_scan(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let due: Vec<_> = match self.store.due_reminders(now, self.policy) {
            // The trigger scan handles these in this same tick
            Ok(due) => due.into_iter().filter(|switch| !switch.is_due(now)).collect(),
            Err(e) => {
                error!(error = %e, "Reminder scan: failed to query switches");
                return;
            }
        };
        if due.is_empty() {
            return;
        }

        let settings = match self.store.get_settings() {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "Reminder scan: failed to load settings");
                return;
            }
        };
        if !settings.has_owner() {
            debug!(count = due.len(), "Reminder scan: no owner email configured, skipping");
            summary.reminders_skipped += due.len();
            return;
        }
        let smtp = match SmtpConfig::from_settings(&settings, &self.crypto) {
            Ok(smtp) => smtp,
            Err(e) => {
                error!(error = %e, "Reminder scan: failed to decrypt SMTP settings");
                summary.reminders_skipped += due.len();
                return;
            }
        };

        let link = templates::heartbeat_link(&self.public_base_url, &settings.heartbeat_token);
        for switch in &due {
            let email = templates::reminder_email(&settings.owner_email, switch, switch.remaining(now), &link);
            match send_or_simulate(self.pipeline.mailer(), smtp.as_ref(), &email).await {
                Ok(_) => match self.store.mark_reminder_sent(&switch.id, switch.last_seen) {
                    Ok(true) => {
                        info!(switch_id = %switch.id, "Reminder sent");
                        summary.reminders_sent += 1;
                    }
                    Ok(false) => {
                        info!(switch_id = %switch.id, "Reminder sent, heartbeat arrived meanwhile");
                        summary.reminders_sent += 1;
                    }
                    Err(e) => {
                        error!(switch_id = %switch.id, error = %e, "Reminder sent but flag not saved");
                        summary.failed += 1;
                    }
                },
                Err(e) => {
                    warn!(switch_id = %switch.id, error = %e, "Reminder email failed, will retry");
                    summary.failed += 1;
                }
            }
        }
    }

    async fn trigger_scan(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let due = match self.store.due_triggers(now) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Trigger scan: failed to query switches");
                return;
            }
        };

        for candidate in due {
            // A heartbeat may have landed since the scan
            let switch = match self.store.get_switch(&candidate.id) {
                Ok(Some(switch)) if switch.is_due(now) => switch,
                Ok(_) => continue,
                Err(e) => {
                    error!(switch_id = %candidate.id, error = %e, "Trigger scan: failed to reload switch");
                    summary.failed += 1;
                    continue;
                }
            };

            info!(switch_id = %switch.id, deadline = %switch.deadline(), "Switch deadline reached");
            if let Err(e) = self.pipeline.deliver(&switch).await {
                error!(switch_id = %switch.id, error = %e, "Delivery aborted, switch left active");
                summary.failed += 1;
                continue;
            }

            match self.store.mark_triggered(&switch.id) {
                Ok(()) => summary.triggered += 1,
                Err(e) => {
                    error!(switch_id = %switch.id, error = %e, "Failed to mark switch triggered");
                    summary.failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use chrono::TimeZone;

    use super::*;
    use crate::crypto::KEY_LEN;
    use crate::delivery::email::testing::RecordingMailer;
    use crate::delivery::email::{EmailError, Mailer, OutgoingEmail};
    use crate::delivery::webhook::testing::spawn_receiver;
    use crate::delivery::webhook::{sign, SIGNATURE_HEADER};
    use crate::delivery::WebhookSender;
    use crate::models::fixtures::switch_at;
    use crate::models::{Settings, Switch, SwitchStatus, Webhook};
    use crate::storage::memory::testing::UnreadableWebhooks;
    use crate::storage::{AttachmentStore, InMemoryStore, StoragePaths};

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<dyn SwitchStore>,
        crypto: Arc<CryptoService>,
        attachments: Arc<AttachmentStore>,
        mailer: Arc<RecordingMailer>,
        clock: Arc<ManualClock>,
        scheduler: TriggerScheduler,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    /// Heartbeats every switch while the first reminder is in flight.
    struct HeartbeatDuringReminder {
        recorder: Arc<RecordingMailer>,
        store: Arc<dyn SwitchStore>,
        at: DateTime<Utc>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl Mailer for HeartbeatDuringReminder {
        async fn send(&self, smtp: &SmtpConfig, email: &OutgoingEmail) -> Result<(), EmailError> {
            if email.subject.starts_with("Reminder") && !self.fired.swap(true, Ordering::SeqCst) {
                self.store.heartbeat_all(self.at).unwrap();
            }
            self.recorder.send(smtp, email).await
        }
    }

    fn harness() -> Harness {
        let recorder = Arc::new(RecordingMailer::default());
        harness_with(Arc::new(InMemoryStore::new()), recorder.clone(), recorder)
    }

    fn harness_with(
        store: Arc<dyn SwitchStore>,
        recorder: Arc<RecordingMailer>,
        mailer: Arc<dyn Mailer>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Arc::new(CryptoService::from_key_bytes(&[7u8; KEY_LEN]));
        let attachments = Arc::new(AttachmentStore::new(
            StoragePaths::new(dir.path()),
            crypto.clone(),
            store.clone(),
        ));
        let pipeline = Arc::new(DeliveryPipeline::new(
            store.clone(),
            crypto.clone(),
            attachments.clone(),
            mailer,
            WebhookSender::new().unwrap(),
        ));
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = TriggerScheduler::new(
            store.clone(),
            crypto.clone(),
            pipeline,
            "https://dms.example.com",
        )
        .with_clock(clock.clone());

        store
            .save_settings(&Settings {
                smtp_host: "smtp.example.com".into(),
                smtp_port: 465,
                smtp_from: "noreply@example.com".into(),
                owner_email: "owner@example.com".into(),
                heartbeat_token: "quick-token".into(),
                ..Settings::default()
            })
            .unwrap();

        Harness {
            _dir: dir,
            store,
            crypto,
            attachments,
            mailer: recorder,
            clock,
            scheduler,
        }
    }

    impl Harness {
        fn switch(&self, id: &str, minutes: u32) -> Switch {
            let mut switch = switch_at(id, t0(), minutes);
            switch.encrypted_content = self.crypto.encrypt("final words").unwrap();
            self.store.insert_switch(&switch).unwrap();
            switch
        }

        fn status(&self, id: &str) -> SwitchStatus {
            self.store.get_switch(id).unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn one_minute_switch_fires_exactly_once() {
        let h = harness();
        let (url, captured) = spawn_receiver(StatusCode::OK).await;
        h.store
            .insert_webhook(&Webhook {
                id: "wh".into(),
                url: url.clone(),
                secret: Some(h.crypto.encrypt_if_needed("hook-secret").unwrap()),
                enabled: true,
                created_at: t0(),
            })
            .unwrap();
        let switch = h.switch("one-minute", 1);
        h.attachments.upload(&switch, "letter.pdf", b"%PDF-1.4 body").unwrap();
        let upload_dir = h.attachments.paths().switch_uploads_dir("one-minute");
        assert!(upload_dir.exists());

        h.clock.advance(chrono::Duration::seconds(59));
        let early = h.scheduler.tick().await;
        assert_eq!(early.triggered, 0);
        assert_eq!(h.status("one-minute"), SwitchStatus::Active);

        h.clock.advance(chrono::Duration::seconds(1));
        let summary = h.scheduler.tick().await;
        assert_eq!(summary.triggered, 1);
        assert_eq!(h.status("one-minute"), SwitchStatus::Triggered);

        // Nothing fires again on later ticks
        h.clock.advance(chrono::Duration::minutes(5));
        assert_eq!(h.scheduler.tick().await.triggered, 0);

        let to_recipient = h.mailer.sent_to("recipient@example.com");
        assert_eq!(to_recipient.len(), 1);
        assert_eq!(to_recipient[0].attachments.len(), 1);

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(
            captured[0].header(SIGNATURE_HEADER),
            Some(sign("hook-secret", &captured[0].body).unwrap())
        );

        assert!(!upload_dir.exists());
    }

    #[tokio::test]
    async fn reminder_at_half_window_then_again_after_heartbeat() {
        let h = harness();
        h.switch("r", 100);

        h.clock.set(t0() + chrono::Duration::minutes(49));
        assert_eq!(h.scheduler.tick().await.reminders_sent, 0);

        h.clock.set(t0() + chrono::Duration::minutes(50));
        assert_eq!(h.scheduler.tick().await.reminders_sent, 1);
        assert_eq!(h.scheduler.tick().await.reminders_sent, 0);

        let reminders = h.mailer.sent_to("owner@example.com");
        assert_eq!(reminders.len(), 1);
        assert_eq!(
            reminders[0].subject,
            "Reminder: your switch will trigger in 50 minutes"
        );
        assert!(reminders[0]
            .body
            .contains("https://dms.example.com/heartbeat/quick-token"));

        let beat = t0() + chrono::Duration::minutes(60);
        h.store.heartbeat_all(beat).unwrap();
        h.clock.set(beat + chrono::Duration::minutes(50));
        assert_eq!(h.scheduler.tick().await.reminders_sent, 1);
    }

    #[tokio::test]
    async fn reminder_waits_for_owner_email() {
        let h = harness();
        h.store
            .save_settings(&Settings {
                smtp_host: "smtp.example.com".into(),
                smtp_from: "noreply@example.com".into(),
                ..Settings::default()
            })
            .unwrap();
        h.switch("r", 10);

        h.clock.set(t0() + chrono::Duration::minutes(6));
        let summary = h.scheduler.tick().await;
        assert_eq!(summary.reminders_skipped, 1);
        assert!(!h.store.get_switch("r").unwrap().unwrap().reminder_sent);
    }

    #[tokio::test]
    async fn broken_switch_does_not_block_others() {
        let h = harness();
        let mut broken = switch_at("broken", t0(), 1);
        broken.encrypted_content = "enc:v1:not-base64!".into();
        h.store.insert_switch(&broken).unwrap();
        h.switch("healthy", 1);

        h.clock.advance(chrono::Duration::minutes(2));
        let summary = h.scheduler.tick().await;
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(h.status("healthy"), SwitchStatus::Triggered);
        assert_eq!(h.status("broken"), SwitchStatus::Active);
    }

    #[tokio::test]
    async fn heartbeat_before_deadline_prevents_trigger() {
        let h = harness();
        h.switch("kept", 10);

        h.clock.set(t0() + chrono::Duration::minutes(9));
        h.store.heartbeat_switch("kept", h.clock.now()).unwrap();
        h.clock.set(t0() + chrono::Duration::minutes(11));

        assert_eq!(h.scheduler.tick().await.triggered, 0);
        assert_eq!(h.status("kept"), SwitchStatus::Active);
    }

    #[tokio::test]
    async fn heartbeat_during_reminder_send_opens_a_fresh_window() {
        let store: Arc<dyn SwitchStore> = Arc::new(InMemoryStore::new());
        let recorder = Arc::new(RecordingMailer::default());
        let beat = t0() + chrono::Duration::minutes(50);
        let mailer = Arc::new(HeartbeatDuringReminder {
            recorder: recorder.clone(),
            store: store.clone(),
            at: beat,
            fired: AtomicBool::new(false),
        });
        let h = harness_with(store, recorder, mailer);
        h.switch("r", 100);

        h.clock.set(beat);
        assert_eq!(h.scheduler.tick().await.reminders_sent, 1);
        let stored = h.store.get_switch("r").unwrap().unwrap();
        assert_eq!(stored.last_seen, beat);
        assert!(!stored.reminder_sent);

        // Half of the new window
        h.clock.set(beat + chrono::Duration::minutes(50));
        assert_eq!(h.scheduler.tick().await.reminders_sent, 1);
        assert_eq!(h.mailer.sent_to("owner@example.com").len(), 2);
        assert!(h.store.get_switch("r").unwrap().unwrap().reminder_sent);
    }

    #[tokio::test]
    async fn overdue_switch_triggers_without_a_reminder() {
        let h = harness();
        h.switch("late", 10);

        h.clock.set(t0() + chrono::Duration::minutes(11));
        let summary = h.scheduler.tick().await;
        assert_eq!(summary.reminders_sent, 0);
        assert_eq!(summary.triggered, 1);

        let to_owner = h.mailer.sent_to("owner@example.com");
        assert_eq!(to_owner.len(), 1);
        assert!(!to_owner[0].subject.starts_with("Reminder"));
    }

    #[tokio::test]
    async fn unreadable_webhooks_still_trigger_once() {
        let recorder = Arc::new(RecordingMailer::default());
        let h = harness_with(Arc::new(UnreadableWebhooks::default()), recorder.clone(), recorder);
        h.switch("one-minute", 1);

        h.clock.advance(chrono::Duration::minutes(1));
        let summary = h.scheduler.tick().await;
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(h.status("one-minute"), SwitchStatus::Triggered);

        h.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(h.scheduler.tick().await.triggered, 0);
        assert_eq!(h.mailer.sent_to("recipient@example.com").len(), 1);
    }

    #[tokio::test]
    async fn rejected_webhook_still_marks_triggered() {
        let h = harness();
        let (url, captured) = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
        h.store
            .insert_webhook(&Webhook {
                id: "wh".into(),
                url,
                secret: None,
                enabled: true,
                created_at: t0(),
            })
            .unwrap();
        h.switch("one-minute", 1);

        h.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(h.scheduler.tick().await.triggered, 1);
        assert_eq!(h.status("one-minute"), SwitchStatus::Triggered);
        assert_eq!(captured.lock().unwrap().len(), 1);

        h.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(h.scheduler.tick().await.triggered, 0);
        assert_eq!(h.mailer.sent_to("recipient@example.com").len(), 1);
    }

    #[tokio::test]
    async fn run_exits_on_cancel() {
        let h = harness();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            h.scheduler
                .with_interval(Duration::from_secs(3600))
                .run(shutdown.clone()),
        );

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
