// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Opaque session tokens sealed with the at-rest key.
//!
//! A token is the `encrypt` output of a compact `{exp, iat}` JSON body.
//! The AEAD tag doubles as the signature: a modified token fails to decrypt.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::cipher::{CryptoError, CryptoResult, CryptoService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SessionBody {
    exp: i64,
    iat: i64,
}

/// A verified session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionToken {
    /// Issue a bearer token valid for `ttl` from `now`.
    pub fn issue(crypto: &CryptoService, ttl: Duration, now: DateTime<Utc>) -> CryptoResult<String> {
        let body = SessionBody {
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        let json = serde_json::to_string(&body).map_err(|_| CryptoError::EncryptionFailed)?;
        crypto.encrypt(&json)
    }

    /// Open and validate a bearer token.
    pub fn verify(crypto: &CryptoService, token: &str, now: DateTime<Utc>) -> CryptoResult<Self> {
        let json = crypto.decrypt(token)?;
        let body: SessionBody =
            serde_json::from_str(&json).map_err(|_| CryptoError::InvalidToken)?;

        let issued_at = Utc
            .timestamp_opt(body.iat, 0)
            .single()
            .ok_or(CryptoError::InvalidToken)?;
        let expires_at = Utc
            .timestamp_opt(body.exp, 0)
            .single()
            .ok_or(CryptoError::InvalidToken)?;

        if expires_at <= now {
            return Err(CryptoError::TokenExpired);
        }
        Ok(Self {
            issued_at,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;

    fn crypto() -> CryptoService {
        CryptoService::from_key_bytes(&[3u8; KEY_LEN])
    }

    #[test]
    fn issued_token_verifies_until_expiry() {
        let crypto = crypto();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let token = SessionToken::issue(&crypto, Duration::hours(1), now).unwrap();

        let session = SessionToken::verify(&crypto, &token, now + Duration::minutes(59)).unwrap();
        assert_eq!(session.issued_at, now);
        assert_eq!(session.expires_at, now + Duration::hours(1));

        assert!(matches!(
            SessionToken::verify(&crypto, &token, now + Duration::hours(1)),
            Err(CryptoError::TokenExpired)
        ));
    }

    #[test]
    fn token_from_another_key_is_rejected() {
        let now = Utc::now();
        let token = SessionToken::issue(&crypto(), Duration::hours(1), now).unwrap();
        let other = CryptoService::from_key_bytes(&[4u8; KEY_LEN]);
        assert!(SessionToken::verify(&other, &token, now).is_err());
    }

    #[test]
    fn sealed_non_session_payload_is_invalid() {
        let crypto = crypto();
        let token = crypto.encrypt("not json").unwrap();
        assert!(matches!(
            SessionToken::verify(&crypto, &token, Utc::now()),
            Err(CryptoError::InvalidToken)
        ));
    }
}
