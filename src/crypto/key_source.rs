// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Encryption key discovery.
//!
//! The at-rest key is a base64 string that decodes to exactly 32 bytes. It
//! can come from two places, tried in priority order:
//!
//! 1. A mounted orchestrator secret (e.g. `/run/secrets/encryption_key`).
//!    Its permissions are managed by the orchestrator and are not checked.
//! 2. A local key file. This file must be mode `0600` exactly; anything
//!    looser is rejected rather than silently accepted.
//!
//! A missing source is skipped. A present but unusable source is an error,
//! so a typo in a key file is reported instead of falling through to the
//! next source.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64ct::{Base64, Encoding};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Errors raised while locating the encryption key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("no encryption key source available (checked: {checked})")]
    NoKeySourceAvailable { checked: String },

    #[error("invalid key format in {source_name}: {reason}")]
    InvalidKeyFormat { source_name: String, reason: String },

    #[error("key file {path} has insecure permissions {mode:o} (expected 600)")]
    InsecurePermissions { path: PathBuf, mode: u32 },

    #[error("failed to read key source {source_name}: {error}")]
    Io {
        source_name: String,
        #[source]
        error: io::Error,
    },
}

/// A candidate location for the encryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Read-only secret mounted by the orchestrator.
    SecretFile(PathBuf),
    /// Operator-managed file whose permission bits must be `0600`.
    LocalFile(PathBuf),
}

impl KeySource {
    /// Short label used in logs and diagnostics.
    pub fn name(&self) -> String {
        match self {
            KeySource::SecretFile(path) => format!("secret:{}", path.display()),
            KeySource::LocalFile(path) => format!("file:{}", path.display()),
        }
    }

    fn path(&self) -> &Path {
        match self {
            KeySource::SecretFile(path) | KeySource::LocalFile(path) => path,
        }
    }

    /// Try to load a key from this source.
    ///
    /// Returns `Ok(None)` when the source is simply absent.
    fn load(&self) -> Result<Option<[u8; KEY_LEN]>, KeyError> {
        let path = self.path();
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(KeyError::Io {
                    source_name: self.name(),
                    error,
                })
            }
        };

        if let KeySource::LocalFile(path) = self {
            check_owner_only(path, &metadata)?;
        }

        let contents = fs::read_to_string(path).map_err(|error| KeyError::Io {
            source_name: self.name(),
            error,
        })?;

        decode_key(contents.trim()).map(Some).map_err(|reason| {
            KeyError::InvalidKeyFormat {
                source_name: self.name(),
                reason,
            }
        })
    }
}

#[cfg(unix)]
fn check_owner_only(path: &Path, metadata: &fs::Metadata) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode() & 0o777;
    if mode != 0o600 {
        return Err(KeyError::InsecurePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_path: &Path, _metadata: &fs::Metadata) -> Result<(), KeyError> {
    Ok(())
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], String> {
    if encoded.is_empty() {
        return Err("key is empty".to_string());
    }
    let bytes = Base64::decode_vec(encoded).map_err(|e| format!("not valid base64: {e}"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("expected {KEY_LEN} bytes, got {}", bytes.len()))
}

/// A successfully resolved key and the source it came from.
#[derive(Clone)]
pub struct ResolvedKey {
    bytes: [u8; KEY_LEN],
    source: String,
}

impl ResolvedKey {
    pub fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("bytes", &"***")
            .field("source", &self.source)
            .finish()
    }
}

/// Return the first usable key among `sources`, in order.
pub fn resolve_key(sources: &[KeySource]) -> Result<ResolvedKey, KeyError> {
    for source in sources {
        match source.load()? {
            Some(bytes) => {
                info!(source = %source.name(), "Encryption key resolved");
                return Ok(ResolvedKey {
                    bytes,
                    source: source.name(),
                });
            }
            None => debug!(source = %source.name(), "Key source absent, trying next"),
        }
    }

    let checked = if sources.is_empty() {
        "none configured".to_string()
    } else {
        sources
            .iter()
            .map(KeySource::name)
            .collect::<Vec<_>>()
            .join(", ")
    };
    Err(KeyError::NoKeySourceAvailable { checked })
}

/// Resolves the key once and caches it for the lifetime of the process.
#[derive(Debug)]
pub struct KeyResolver {
    sources: Vec<KeySource>,
    resolved: OnceLock<ResolvedKey>,
}

impl KeyResolver {
    pub fn new(sources: Vec<KeySource>) -> Self {
        Self {
            sources,
            resolved: OnceLock::new(),
        }
    }

    /// Resolve the key, or return the cached one.
    ///
    /// Failures are not cached; a later call retries all sources.
    pub fn resolve(&self) -> Result<&ResolvedKey, KeyError> {
        if let Some(key) = self.resolved.get() {
            return Ok(key);
        }
        let key = resolve_key(&self.sources)?;
        Ok(self.resolved.get_or_init(|| key))
    }

    pub fn sources(&self) -> &[KeySource] {
        &self.sources
    }
}

/// Generate a fresh random key, base64-encoded, for provisioning.
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    Base64::encode_string(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[cfg(unix)]
    fn write_key_file(dir: &Path, name: &str, contents: &str, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn generated_key_decodes_to_32_bytes() {
        let key = generate_key();
        assert_eq!(decode_key(&key).unwrap().len(), KEY_LEN);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn no_sources_is_reported() {
        let err = resolve_key(&[]).unwrap_err();
        assert!(matches!(err, KeyError::NoKeySourceAvailable { .. }));
    }

    #[test]
    fn absent_sources_fall_through_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![
            KeySource::SecretFile(dir.path().join("missing-secret")),
            KeySource::LocalFile(dir.path().join("missing.key")),
        ];
        let err = resolve_key(&sources).unwrap_err();
        match err {
            KeyError::NoKeySourceAvailable { checked } => {
                assert!(checked.contains("missing-secret"));
                assert!(checked.contains("missing.key"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn secret_file_takes_priority() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write_key_file(dir.path(), "secret", &generate_key(), 0o444);
        let local = write_key_file(dir.path(), "local.key", &generate_key(), 0o600);

        let key = resolve_key(&[
            KeySource::SecretFile(secret.clone()),
            KeySource::LocalFile(local),
        ])
        .unwrap();
        assert!(key.source().starts_with("secret:"));
    }

    #[cfg(unix)]
    #[test]
    fn local_file_with_loose_permissions_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let local = write_key_file(dir.path(), "local.key", &generate_key(), 0o644);

        let err = resolve_key(&[KeySource::LocalFile(local)]).unwrap_err();
        assert!(matches!(
            err,
            KeyError::InsecurePermissions { mode: 0o644, .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn malformed_key_is_distinguished_from_absent() {
        let dir = tempfile::tempdir().unwrap();
        let short = Base64::encode_string(&[7u8; 16]);
        let local = write_key_file(dir.path(), "local.key", &short, 0o600);

        let err = resolve_key(&[KeySource::LocalFile(local)]).unwrap_err();
        match err {
            KeyError::InvalidKeyFormat { reason, .. } => assert!(reason.contains("16")),
            other => panic!("unexpected error: {other}"),
        }

        let garbage = write_key_file(dir.path(), "garbage.key", "not base64 !!", 0o600);
        let err = resolve_key(&[KeySource::LocalFile(garbage)]).unwrap_err();
        assert!(matches!(err, KeyError::InvalidKeyFormat { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn resolver_caches_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let local = write_key_file(dir.path(), "local.key", &generate_key(), 0o600);
        let resolver = KeyResolver::new(vec![KeySource::LocalFile(local.clone())]);

        let first = *resolver.resolve().unwrap().bytes();
        fs::remove_file(&local).unwrap();
        let second = *resolver.resolve().unwrap().bytes();
        assert_eq!(first, second);
    }

    #[test]
    fn debug_output_redacts_key() {
        let key = ResolvedKey {
            bytes: [9u8; KEY_LEN],
            source: "file:test".to_string(),
        };
        let rendered = format!("{key:?}");
        assert!(rendered.contains("***"));
        assert!(!rendered.contains('9'));
    }
}
