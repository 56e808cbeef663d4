// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! AES-256-GCM encryption of message content, secrets, and attachments.
//!
//! ## Wire Layout
//!
//! ```text
//! string API:  base64( nonce[12] || ciphertext || tag[16] )
//! bytes API:           nonce[12] || ciphertext || tag[16]
//! marked:      "enc:v1:" + string API output
//! ```
//!
//! Every call draws a fresh random nonce, so encrypting the same plaintext
//! twice yields different output. Any tampering makes decryption fail.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use rand::rngs::OsRng;
use rand::RngCore;

use super::key_source::{ResolvedKey, KEY_LEN};

/// GCM nonce size in bytes.
pub const NONCE_LEN: usize = 12;

/// Marker placed in front of values sealed by [`CryptoService::encrypt_if_needed`].
pub const ENCRYPTED_PREFIX: &str = "enc:v1:";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Authenticated encryption keyed by the process-wide key.
///
/// Construct once at startup and share behind an `Arc`.
pub struct CryptoService {
    cipher: Aes256Gcm,
}

impl CryptoService {
    pub fn new(key: &ResolvedKey) -> Self {
        Self::from_key_bytes(key.bytes())
    }

    pub fn from_key_bytes(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Seal raw bytes, returning `nonce || ciphertext`.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a blob produced by [`encrypt_bytes`](Self::encrypt_bytes).
    pub fn decrypt_bytes(&self, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::InvalidCiphertext(format!(
                "blob is {} bytes, shorter than the nonce",
                sealed.len()
            )));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Seal a string and base64-encode the result.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let sealed = self.encrypt_bytes(plaintext.as_bytes())?;
        Ok(Base64::encode_string(&sealed))
    }

    /// Inverse of [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, ciphertext: &str) -> CryptoResult<String> {
        let sealed = Base64::decode_vec(ciphertext)
            .map_err(|e| CryptoError::InvalidCiphertext(format!("bad base64: {e}")))?;
        let plaintext = self.decrypt_bytes(&sealed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Encrypt and mark `value` unless it already carries the marker.
    ///
    /// Empty input stays empty so "no secret" is representable.
    pub fn encrypt_if_needed(&self, value: &str) -> CryptoResult<String> {
        if value.is_empty() || is_encrypted(value) {
            return Ok(value.to_string());
        }
        Ok(format!("{ENCRYPTED_PREFIX}{}", self.encrypt(value)?))
    }

    /// Decrypt a marked value; unmarked values pass through unchanged.
    pub fn decrypt_if_needed(&self, value: &str) -> CryptoResult<String> {
        match value.strip_prefix(ENCRYPTED_PREFIX) {
            Some(ciphertext) => self.decrypt(ciphertext),
            None => Ok(value.to_string()),
        }
    }
}

/// Whether `value` carries the encryption marker.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// `n` random bytes, URL-safe base64 without padding.
pub fn generate_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}
