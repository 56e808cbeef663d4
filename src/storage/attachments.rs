// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Encrypted attachment files.
//!
//! ## Security Note
//!
//! Plaintext never touches the disk. Uploaded bytes are sealed with
//! `CryptoService::encrypt_bytes` before being written, under a random
//! storage name inside a per-switch directory. Files are created `0600`
//! and directories `0700`.
//!
//! Deletion order is file, then record, then (best effort) the directory,
//! so a crash never leaves a record pointing at plaintext.
//!
//! Uploads, deletions, and purges are serialized by one lock. An upload
//! re-reads its switch inside that lock, so quota checks and the trigger
//! purge never interleave with a write.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::content::{
    extension_of, is_allowed_extension, mime_matches_extension, sanitize_filename, sniff_mime,
};
use super::{StoragePaths, StoreError, SwitchStore};
use crate::crypto::{CryptoError, CryptoService};
use crate::models::{Attachment, Switch};

/// Per-file limit: 10 MB.
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Cumulative per-switch limit: 25 MB.
pub const MAX_TOTAL_BYTES: u64 = 25 * 1024 * 1024;

/// Attachments allowed on one switch.
pub const MAX_FILES_PER_SWITCH: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("switch {0} has already been triggered")]
    SwitchTriggered(String),

    #[error("file is empty")]
    Empty,

    #[error("file is {size} bytes, limit is {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("switch already has {limit} attachments")]
    TooManyFiles { limit: usize },

    #[error("attachments would total {total} bytes, limit is {limit}")]
    QuotaExceeded { total: u64, limit: u64 },

    #[error("file extension not allowed: {0}")]
    ExtensionNotAllowed(String),

    #[error("file type not allowed: {0}")]
    TypeNotAllowed(String),

    #[error("attachment not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

/// Size and count limits applied on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentLimits {
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
    pub max_files: usize,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: MAX_FILE_BYTES,
            max_total_bytes: MAX_TOTAL_BYTES,
            max_files: MAX_FILES_PER_SWITCH,
        }
    }
}

/// An attachment opened for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedAttachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

pub struct AttachmentStore {
    paths: StoragePaths,
    crypto: Arc<CryptoService>,
    store: Arc<dyn SwitchStore>,
    limits: AttachmentLimits,
    write_lock: Mutex<()>,
}

impl AttachmentStore {
    pub fn new(paths: StoragePaths, crypto: Arc<CryptoService>, store: Arc<dyn SwitchStore>) -> Self {
        Self {
            paths,
            crypto,
            store,
            limits: AttachmentLimits::default(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_limits(mut self, limits: AttachmentLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Create the uploads root. Safe to call multiple times.
    pub fn initialize(&self) -> AttachmentResult<()> {
        create_private_dir(self.paths.uploads_dir())?;
        Ok(())
    }

    /// Validate, encrypt, and persist an uploaded file.
    pub fn upload(&self, switch: &Switch, filename: &str, data: &[u8]) -> AttachmentResult<Attachment> {
        if !switch.is_active() {
            return Err(AttachmentError::SwitchTriggered(switch.id.clone()));
        }

        let filename = sanitize_filename(filename);
        let extension = extension_of(&filename).unwrap_or_default();
        if !is_allowed_extension(&extension) {
            return Err(AttachmentError::ExtensionNotAllowed(extension));
        }

        let size = data.len() as u64;
        if size == 0 {
            return Err(AttachmentError::Empty);
        }
        if size > self.limits.max_file_bytes {
            return Err(AttachmentError::FileTooLarge {
                size,
                limit: self.limits.max_file_bytes,
            });
        }

        let mime_type = sniff_mime(data);
        if !mime_matches_extension(&extension, mime_type) {
            return Err(AttachmentError::TypeNotAllowed(mime_type.to_string()));
        }

        let _guard = self.lock_writes();
        let current = self
            .store
            .get_switch(&switch.id)?
            .ok_or_else(|| StoreError::NotFound(format!("Switch {}", switch.id)))?;
        if !current.is_active() {
            return Err(AttachmentError::SwitchTriggered(switch.id.clone()));
        }

        let existing = self.store.list_attachments(&switch.id)?;
        if existing.len() >= self.limits.max_files {
            return Err(AttachmentError::TooManyFiles {
                limit: self.limits.max_files,
            });
        }
        let total = existing.iter().map(|a| a.size).sum::<u64>() + size;
        if total > self.limits.max_total_bytes {
            return Err(AttachmentError::QuotaExceeded {
                total,
                limit: self.limits.max_total_bytes,
            });
        }

        let sealed = self.crypto.encrypt_bytes(data)?;
        let storage_name = format!("{}.bin", Uuid::new_v4().simple());
        create_private_dir(&self.paths.switch_uploads_dir(&switch.id))?;
        let storage_path = self.paths.attachment_file(&switch.id, &storage_name);
        write_private_file(&storage_path, &sealed)?;

        let attachment = Attachment {
            id: Uuid::new_v4().to_string(),
            switch_id: switch.id.clone(),
            filename,
            storage_path,
            size,
            mime_type: mime_type.to_string(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert_attachment(&attachment) {
            let _ = fs::remove_file(&attachment.storage_path);
            return Err(e.into());
        }

        info!(
            switch_id = %switch.id,
            attachment_id = %attachment.id,
            size,
            mime_type = %attachment.mime_type,
            "Attachment stored"
        );
        Ok(attachment)
    }

    /// Read and decrypt one attachment.
    pub fn read_decrypted(&self, attachment: &Attachment) -> AttachmentResult<DecryptedAttachment> {
        let sealed = fs::read(&attachment.storage_path)?;
        let data = self.crypto.decrypt_bytes(&sealed)?;
        Ok(DecryptedAttachment {
            filename: attachment.filename.clone(),
            mime_type: attachment.mime_type.clone(),
            data,
        })
    }

    /// Decrypt every attachment of a switch, in upload order.
    pub fn read_all_decrypted(&self, switch_id: &str) -> AttachmentResult<Vec<DecryptedAttachment>> {
        self.store
            .list_attachments(switch_id)?
            .iter()
            .map(|attachment| self.read_decrypted(attachment))
            .collect()
    }

    /// Delete one attachment of `switch`. Refused once the switch has triggered.
    pub fn delete(&self, switch: &Switch, attachment_id: &str) -> AttachmentResult<()> {
        if !switch.is_active() {
            return Err(AttachmentError::SwitchTriggered(switch.id.clone()));
        }
        let _guard = self.lock_writes();
        let attachment = self
            .store
            .get_attachment(attachment_id)?
            .filter(|attachment| attachment.switch_id == switch.id)
            .ok_or_else(|| AttachmentError::NotFound(attachment_id.to_string()))?;

        self.remove_one(&attachment)?;
        self.remove_switch_dir_if_empty(&switch.id);
        Ok(())
    }

    /// Delete every attachment file and record for a switch, then its
    /// directory. Returns how many attachments were removed.
    pub fn purge_switch(&self, switch_id: &str) -> AttachmentResult<usize> {
        let _guard = self.lock_writes();
        let attachments = self.store.list_attachments(switch_id)?;
        for attachment in &attachments {
            self.remove_one(attachment)?;
        }

        let dir = self.paths.switch_uploads_dir(switch_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(switch_id = %switch_id, count = attachments.len(), "Attachments purged");
        Ok(attachments.len())
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_one(&self, attachment: &Attachment) -> AttachmentResult<()> {
        match fs::remove_file(&attachment.storage_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    attachment_id = %attachment.id,
                    "Attachment file already missing, removing record"
                );
            }
            Err(e) => return Err(e.into()),
        }
        match self.store.delete_attachment(&attachment.id) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_switch_dir_if_empty(&self, switch_id: &str) {
        let dir = self.paths.switch_uploads_dir(switch_id);
        if let Err(e) = fs::remove_dir(&dir) {
            debug!(dir = %dir.display(), error = %e, "Upload directory kept");
        }
    }
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn write_private_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}
