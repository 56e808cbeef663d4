// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Crypto
//!
//! Key discovery and authenticated encryption for everything the service
//! stores: message bodies, SMTP/webhook secrets, attachment files, and
//! session tokens.
//!
//! - `key_source` - locate and cache the 32-byte key
//! - `cipher` - AES-256-GCM string/byte APIs and marker helpers
//! - `session` - bearer tokens sealed with the same key

pub mod cipher;
pub mod key_source;
pub mod session;

pub use cipher::{generate_token, is_encrypted, CryptoError, CryptoResult, CryptoService};
pub use key_source::{generate_key, resolve_key, KeyError, KeyResolver, KeySource, ResolvedKey, KEY_LEN};
pub use session::SessionToken;
