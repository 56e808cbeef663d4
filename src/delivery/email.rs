// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! SMTP delivery.
//!
//! Transport follows the port convention: 465 dials implicit TLS, any
//! other port dials plaintext and upgrades with STARTTLS when the server
//! offers it. Authentication offers PLAIN, then LOGIN.
//!
//! Every header-derived value passes through [`sanitize_header`] before it
//! reaches the message builder.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use crate::crypto::{CryptoError, CryptoService};
use crate::models::Settings;
use crate::storage::DecryptedAttachment;

/// Implicit-TLS submission port.
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Used when settings carry no port.
pub const DEFAULT_SMTP_PORT: u16 = 587;

pub const SEND_ATTEMPTS: u32 = 3;
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

const SMTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, thiserror::Error)]
pub enum EmailError {
    #[error("invalid email address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("SMTP transport error: {0}")]
    Transport(String),
}

/// Decrypted SMTP settings, ready to dial.
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub from_name: String,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("from_address", &self.from_address)
            .field("from_name", &self.from_name)
            .finish()
    }
}

impl SmtpConfig {
    /// Resolve stored settings. `None` when host or sender is missing.
    pub fn from_settings(settings: &Settings, crypto: &CryptoService) -> Result<Option<Self>, CryptoError> {
        if !settings.has_smtp() {
            return Ok(None);
        }
        let password = if settings.smtp_password.is_empty() {
            String::new()
        } else {
            crypto.decrypt_if_needed(&settings.smtp_password)?
        };
        let port = if settings.smtp_port == 0 {
            DEFAULT_SMTP_PORT
        } else {
            settings.smtp_port
        };

        Ok(Some(Self {
            host: settings.smtp_host.trim().to_string(),
            port,
            username: settings.smtp_user.trim().to_string(),
            password,
            from_address: settings.smtp_from.trim().to_string(),
            from_name: settings.smtp_from_name.trim().to_string(),
        }))
    }

    pub fn uses_implicit_tls(&self) -> bool {
        self.port == IMPLICIT_TLS_PORT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    ImplicitTls,
    /// Plaintext dial, upgraded when the server offers STARTTLS.
    OpportunisticStarttls,
}

/// Connection choices derived from an [`SmtpConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPlan {
    pub security: TransportSecurity,
    pub port: u16,
    /// Empty when no username is configured.
    pub mechanisms: Vec<Mechanism>,
}

impl TransportPlan {
    pub fn for_config(smtp: &SmtpConfig) -> Self {
        let security = if smtp.uses_implicit_tls() {
            TransportSecurity::ImplicitTls
        } else {
            TransportSecurity::OpportunisticStarttls
        };
        let mechanisms = if smtp.username.is_empty() {
            Vec::new()
        } else {
            vec![Mechanism::Plain, Mechanism::Login]
        };
        Self {
            security,
            port: smtp.port,
            mechanisms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl From<DecryptedAttachment> for EmailAttachment {
    fn from(attachment: DecryptedAttachment) -> Self {
        Self {
            filename: attachment.filename,
            mime_type: attachment.mime_type,
            data: attachment.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<EmailAttachment>,
}

impl OutgoingEmail {
    pub fn text(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
        }
    }
}

/// Seam between delivery logic and the network.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, smtp: &SmtpConfig, email: &OutgoingEmail) -> Result<(), EmailError>;
}

/// Whether a message actually left the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Simulated,
}

/// Send through `mailer`, or log a simulated send when SMTP is not configured.
pub async fn send_or_simulate(
    mailer: &dyn Mailer,
    smtp: Option<&SmtpConfig>,
    email: &OutgoingEmail,
) -> Result<SendOutcome, EmailError> {
    match smtp {
        Some(smtp) => {
            mailer.send(smtp, email).await?;
            Ok(SendOutcome::Sent)
        }
        None => {
            info!(
                to = %email.to,
                subject = %email.subject,
                attachments = email.attachments.len(),
                "SMTP not configured, simulated email send"
            );
            Ok(SendOutcome::Simulated)
        }
    }
}

// =============================================================================
// SMTP implementation
// =============================================================================

#[derive(Debug, Clone)]
pub struct SmtpMailer {
    attempts: u32,
    backoff_base: Duration,
}

impl Default for SmtpMailer {
    fn default() -> Self {
        Self {
            attempts: SEND_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
        }
    }
}

impl SmtpMailer {
    pub fn new() -> Self {
        Self::default()
    }

    fn transport(smtp: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, EmailError> {
        let transport_err = |e: lettre::transport::smtp::Error| EmailError::Transport(e.to_string());
        let plan = TransportPlan::for_config(smtp);

        let builder = match plan.security {
            TransportSecurity::ImplicitTls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host).map_err(transport_err)?
            }
            TransportSecurity::OpportunisticStarttls => {
                let tls = TlsParameters::new(smtp.host.clone()).map_err(transport_err)?;
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
                    .tls(Tls::Opportunistic(tls))
            }
        };

        let mut builder = builder.port(plan.port).timeout(Some(SMTP_TIMEOUT));
        if !plan.mechanisms.is_empty() {
            builder = builder
                .credentials(Credentials::new(smtp.username.clone(), smtp.password.clone()))
                .authentication(plan.mechanisms);
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, smtp: &SmtpConfig, email: &OutgoingEmail) -> Result<(), EmailError> {
        let message = build_message(smtp, email)?;
        let transport = Self::transport(smtp)?;

        retry_with_backoff(self.attempts, self.backoff_base, |attempt| {
            let transport = &transport;
            let message = message.clone();
            async move {
                transport.send(message).await.map(|_| ()).map_err(|e| {
                    warn!(attempt, host = %smtp.host, error = %e, "SMTP send attempt failed");
                    EmailError::Transport(e.to_string())
                })
            }
        })
        .await?;

        info!(
            to = %email.to,
            host = %smtp.host,
            attachments = email.attachments.len(),
            "Email sent"
        );
        Ok(())
    }
}

/// Run `op` up to `attempts` times, sleeping `base`, `2 * base`, ... between
/// failures. Returns the last error when every attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(attempts: u32, base: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut delay = base;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(_) => {
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// Remove CR and LF so a value cannot start a new header line.
pub fn sanitize_header(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

fn parse_address(raw: &str) -> Result<Address, EmailError> {
    let cleaned = sanitize_header(raw);
    cleaned
        .trim()
        .parse::<Address>()
        .map_err(|e| EmailError::InvalidAddress {
            address: cleaned.clone(),
            reason: e.to_string(),
        })
}

/// Assemble the MIME message. Attachments become `multipart/mixed` parts.
pub fn build_message(smtp: &SmtpConfig, email: &OutgoingEmail) -> Result<Message, EmailError> {
    let from_name = sanitize_header(&smtp.from_name);
    let from = Mailbox::new(
        (!from_name.trim().is_empty()).then(|| from_name.trim().to_string()),
        parse_address(&smtp.from_address)?,
    );
    let to = Mailbox::new(None, parse_address(&email.to)?);

    let builder = Message::builder()
        .from(from)
        .to(to)
        .subject(sanitize_header(&email.subject));

    let message = if email.attachments.is_empty() {
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())
    } else {
        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(email.body.clone()));
        for attachment in &email.attachments {
            let content_type = match ContentType::parse(&sanitize_header(&attachment.mime_type)) {
                Ok(content_type) => content_type,
                Err(_) => ContentType::parse("application/octet-stream")
                    .map_err(|e| EmailError::Build(e.to_string()))?,
            };
            parts = parts.singlepart(
                Attachment::new(sanitize_header(&attachment.filename))
                    .body(attachment.data.clone(), content_type),
            );
        }
        builder.multipart(parts)
    };

    message.map_err(|e| EmailError::Build(e.to_string()))
}

// =============================================================================
// Test double
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every message instead of sending it.
    #[derive(Default)]
    pub struct RecordingMailer {
        sent: Mutex<Vec<OutgoingEmail>>,
        fail: bool,
    }

    impl RecordingMailer {
        pub fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn sent(&self) -> Vec<OutgoingEmail> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_to(&self, to: &str) -> Vec<OutgoingEmail> {
            self.sent().into_iter().filter(|email| email.to == to).collect()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, _smtp: &SmtpConfig, email: &OutgoingEmail) -> Result<(), EmailError> {
            if self.fail {
                return Err(EmailError::Transport("connection refused".into()));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    pub fn smtp() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "mailer".into(),
            password: "hunter2".into(),
            from_address: "noreply@example.com".into(),
            from_name: "Deadswitch".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::testing::{smtp, RecordingMailer};
    use super::*;
    use crate::crypto::KEY_LEN;

    fn formatted(message: &Message) -> String {
        String::from_utf8_lossy(&message.formatted()).into_owned()
    }

    #[test]
    fn strips_header_line_breaks() {
        assert_eq!(sanitize_header("Hello\r\nBcc: x@y.z"), "HelloBcc: x@y.z");
        assert_eq!(sanitize_header("plain"), "plain");
    }

    #[test]
    fn injected_subject_does_not_add_headers() {
        let email = OutgoingEmail::text(
            "recipient@example.com",
            "Hello\r\nX-Injected: yes",
            "body",
        );
        let raw = formatted(&build_message(&smtp(), &email).unwrap());
        assert!(!raw.contains("\r\nX-Injected"));
        assert!(raw.contains("HelloX-Injected"));
    }

    #[test]
    fn attachments_become_mime_parts() {
        let mut email = OutgoingEmail::text("recipient@example.com", "Files", "see attached");
        email.attachments.push(EmailAttachment {
            filename: "notes.txt".into(),
            mime_type: "text/plain".into(),
            data: b"attached words".to_vec(),
        });
        let raw = formatted(&build_message(&smtp(), &email).unwrap());
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("Content-Disposition: attachment"));
        assert!(raw.contains("notes.txt"));
    }

    #[test]
    fn rejects_bad_recipient() {
        let email = OutgoingEmail::text("not-an-address", "s", "b");
        assert!(matches!(
            build_message(&smtp(), &email),
            Err(EmailError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn config_from_settings_decrypts_password() {
        let crypto = CryptoService::from_key_bytes(&[9u8; KEY_LEN]);
        let mut settings = Settings::default();
        assert!(SmtpConfig::from_settings(&settings, &crypto).unwrap().is_none());

        settings.smtp_host = "smtp.example.com".into();
        settings.smtp_from = "noreply@example.com".into();
        settings.smtp_user = "mailer".into();
        settings.smtp_password = crypto.encrypt_if_needed("s3cret").unwrap();

        let config = SmtpConfig::from_settings(&settings, &crypto).unwrap().unwrap();
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.port, DEFAULT_SMTP_PORT);
        assert!(!config.uses_implicit_tls());
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn port_465_dials_implicit_tls() {
        let config = SmtpConfig {
            port: IMPLICIT_TLS_PORT,
            ..smtp()
        };
        let plan = TransportPlan::for_config(&config);
        assert_eq!(plan.security, TransportSecurity::ImplicitTls);
        assert_eq!(plan.port, 465);
        assert_eq!(plan.mechanisms, vec![Mechanism::Plain, Mechanism::Login]);
    }

    #[test]
    fn other_ports_upgrade_with_starttls() {
        for port in [25, 587, 2525] {
            let plan = TransportPlan::for_config(&SmtpConfig { port, ..smtp() });
            assert_eq!(plan.security, TransportSecurity::OpportunisticStarttls);
            assert_eq!(plan.port, port);
        }
    }

    #[test]
    fn no_username_means_no_auth() {
        let config = SmtpConfig {
            username: String::new(),
            ..smtp()
        };
        assert!(TransportPlan::for_config(&config).mechanisms.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), String> = retry_with_backoff(SEND_ATTEMPTS, BACKOFF_BASE, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {attempt} failed")) }
        })
        .await;

        assert_eq!(result, Err("attempt 3 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 500ms + 1000ms of backoff between the three attempts
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(3, BACKOFF_BASE, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn simulated_send_without_smtp() {
        let mailer = RecordingMailer::default();
        let email = OutgoingEmail::text("a@example.com", "s", "b");
        assert_eq!(
            send_or_simulate(&mailer, None, &email).await.unwrap(),
            SendOutcome::Simulated
        );
        assert!(mailer.sent().is_empty());

        assert_eq!(
            send_or_simulate(&mailer, Some(&smtp()), &email).await.unwrap(),
            SendOutcome::Sent
        );
        assert_eq!(mailer.sent().len(), 1);
    }
}
