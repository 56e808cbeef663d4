// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deadswitch - Encrypted Dead Man's Switch Service
//!
//! Holds encrypted messages and attachments, and delivers them by email
//! and signed webhook once their owner stops checking in.
//!
//! ## Modules
//!
//! - `crypto` - key resolution, AES-256-GCM, session tokens
//! - `storage` - switch store (redb) and encrypted attachment files
//! - `delivery` - SMTP, webhooks, SSRF rules, delivery pipeline
//! - `scheduler` - periodic reminder and trigger scans
//! - `service` - operations behind the management API
//! - `api` - public HTTP surface (Axum)

pub mod api;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod storage;
