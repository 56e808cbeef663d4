// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded once from the environment at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `DATA_DIR` | Root directory for the database | `./data` |
//! | `UPLOADS_DIR` | Root directory for attachment ciphertext | `$DATA_DIR/uploads` |
//! | `ENCRYPTION_KEY_SECRET_PATH` | Mounted orchestrator secret holding the key | `/run/secrets/encryption_key` |
//! | `ENCRYPTION_KEY_FILE` | Local key file, must be mode `0600` | `$DATA_DIR/encryption.key` |
//! | `WEBHOOK_ALLOWED_HOSTS` | Comma-separated webhook host allow-list | empty (any public host) |
//! | `SCHEDULER_INTERVAL_SECS` | Seconds between scheduler ticks | `60` |
//! | `PUBLIC_BASE_URL` | Base of quick-heartbeat links in reminders | `http://localhost:8080` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::crypto::KeySource;
use crate::delivery::HostAllowList;
use crate::storage::StoragePaths;

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";

/// Environment variable name for the data directory path.
///
/// # Default
/// `./data`
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const UPLOADS_DIR_ENV: &str = "UPLOADS_DIR";
pub const KEY_SECRET_PATH_ENV: &str = "ENCRYPTION_KEY_SECRET_PATH";
pub const KEY_FILE_ENV: &str = "ENCRYPTION_KEY_FILE";
pub const WEBHOOK_ALLOWED_HOSTS_ENV: &str = "WEBHOOK_ALLOWED_HOSTS";
pub const SCHEDULER_INTERVAL_ENV: &str = "SCHEDULER_INTERVAL_SECS";
pub const PUBLIC_BASE_URL_ENV: &str = "PUBLIC_BASE_URL";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_KEY_SECRET_PATH: &str = "/run/secrets/encryption_key";
const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 60;
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub paths: StoragePaths,
    /// Key sources in priority order.
    pub key_sources: Vec<KeySource>,
    pub webhook_allow_list: HostAllowList,
    pub scheduler_interval: Duration,
    pub public_base_url: String,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = var(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match var(PORT_ENV) {
            Some(raw) => parse_value(PORT_ENV, &raw)?,
            None => DEFAULT_PORT,
        };
        let bind_addr: SocketAddr = parse_value(HOST_ENV, &format!("{host}:{port}"))?;

        let mut paths = StoragePaths::new(var(DATA_DIR_ENV).unwrap_or_else(|| crate::storage::paths::DATA_ROOT.to_string()));
        if let Some(uploads) = var(UPLOADS_DIR_ENV) {
            paths = paths.with_uploads_dir(uploads);
        }

        let secret_path = var(KEY_SECRET_PATH_ENV).unwrap_or_else(|| DEFAULT_KEY_SECRET_PATH.to_string());
        let key_file = var(KEY_FILE_ENV).map(PathBuf::from).unwrap_or_else(|| paths.key_file());
        let key_sources = vec![
            KeySource::SecretFile(PathBuf::from(secret_path)),
            KeySource::LocalFile(key_file),
        ];

        let webhook_allow_list = HostAllowList::parse(&var(WEBHOOK_ALLOWED_HOSTS_ENV).unwrap_or_default());

        let interval_secs: u64 = match var(SCHEDULER_INTERVAL_ENV) {
            Some(raw) => parse_value(SCHEDULER_INTERVAL_ENV, &raw)?,
            None => DEFAULT_SCHEDULER_INTERVAL_SECS,
        };
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: SCHEDULER_INTERVAL_ENV,
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let public_base_url = var(PUBLIC_BASE_URL_ENV).unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());
        url::Url::parse(&public_base_url).map_err(|e| ConfigError::InvalidValue {
            name: PUBLIC_BASE_URL_ENV,
            value: public_base_url.clone(),
            reason: e.to_string(),
        })?;

        let log_format = match var(LOG_FORMAT_ENV).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            bind_addr,
            paths,
            key_sources,
            webhook_allow_list,
            scheduler_interval: Duration::from_secs(interval_secs),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            log_format,
        })
    }
}

fn parse_value<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// default filter.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
