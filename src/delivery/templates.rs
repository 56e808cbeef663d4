// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Text of every email the service sends.

use chrono::Duration;

use super::email::{EmailAttachment, OutgoingEmail};
use crate::models::Switch;

/// Coarse human rendering of a remaining time. Negative values read as zero.
pub fn human_duration(remaining: Duration) -> String {
    let total_minutes = remaining.num_minutes().max(0);
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes / 60) % 24;
    let minutes = total_minutes % 60;

    if days >= 1 {
        join_units(days, "day", hours, "hour")
    } else if hours >= 1 {
        join_units(hours, "hour", minutes, "minute")
    } else {
        plural(minutes, "minute")
    }
}

fn join_units(major: i64, major_unit: &str, minor: i64, minor_unit: &str) -> String {
    if minor == 0 {
        plural(major, major_unit)
    } else {
        format!("{}, {}", plural(major, major_unit), plural(minor, minor_unit))
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// Quick-heartbeat link embedded in reminders.
pub fn heartbeat_link(public_base_url: &str, token: &str) -> String {
    format!("{}/heartbeat/{token}", public_base_url.trim_end_matches('/'))
}

/// The message itself, addressed to the switch recipient.
pub fn delivery_email(switch: &Switch, content: &str, attachments: Vec<EmailAttachment>) -> OutgoingEmail {
    let body = format!(
        "{content}\n\n--\nThis message was delivered automatically because its author \
         did not check in for {}.\n",
        human_duration(switch.duration())
    );
    OutgoingEmail {
        to: switch.recipient_email.clone(),
        subject: "A message has been left for you".to_string(),
        body,
        attachments,
    }
}

/// Owner reminder with the quick-heartbeat link.
pub fn reminder_email(owner_email: &str, switch: &Switch, remaining: Duration, link: &str) -> OutgoingEmail {
    let remaining = human_duration(remaining);
    let body = format!(
        "Your switch for {} will trigger in {remaining} unless you check in.\n\n\
         Check in now: {link}\n\n\
         Opening this link resets every active switch.\n",
        switch.recipient_email
    );
    OutgoingEmail::text(
        owner_email,
        format!("Reminder: your switch will trigger in {remaining}"),
        body,
    )
}

/// Owner notice that a switch fired, listing webhook URLs that accepted it.
pub fn confirmation_email(owner_email: &str, switch: &Switch, fired_webhooks: &[String]) -> OutgoingEmail {
    let webhooks = if fired_webhooks.is_empty() {
        "none".to_string()
    } else {
        fired_webhooks.join(", ")
    };
    let body = format!(
        "Your switch {} was triggered and its message was sent to {}.\n\n\
         Webhooks fired: {webhooks}\n\n\
         Its attachments have been deleted from the server.\n",
        switch.id, switch.recipient_email
    );
    OutgoingEmail::text(owner_email, "Your switch was triggered", body)
}
