// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path constants and utilities for the on-disk layout.
//!
//! ```text
//! {data_root}/
//!   deadswitch.redb          # switch store
//!   encryption.key           # optional local key file (0600)
//! {uploads_root}/            # defaults to {data_root}/uploads
//!   {switch_id}/
//!     {random}.bin           # attachment ciphertext
//! ```

use std::path::{Path, PathBuf};

/// Default data directory when `DATA_DIR` is unset.
pub const DATA_ROOT: &str = "./data";

#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
    uploads: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DATA_ROOT)
    }
}

impl StoragePaths {
    /// Layout rooted at `root`, with uploads under `root/uploads`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let uploads = root.join("uploads");
        Self { root, uploads }
    }

    /// Override the attachment root.
    pub fn with_uploads_dir(mut self, uploads: impl AsRef<Path>) -> Self {
        self.uploads = uploads.as_ref().to_path_buf();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Embedded database file.
    pub fn database_file(&self) -> PathBuf {
        self.root.join("deadswitch.redb")
    }

    /// Default location of the local key file.
    pub fn key_file(&self) -> PathBuf {
        self.root.join("encryption.key")
    }

    // ========== Attachment Paths ==========

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads
    }

    /// Directory holding one switch's attachment ciphertexts.
    pub fn switch_uploads_dir(&self, switch_id: &str) -> PathBuf {
        self.uploads.join(switch_id)
    }

    /// Ciphertext file for an attachment with the given storage name.
    pub fn attachment_file(&self, switch_id: &str, storage_name: &str) -> PathBuf {
        self.switch_uploads_dir(switch_id).join(storage_name)
    }
}
