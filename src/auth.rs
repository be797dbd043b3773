//! Per-room passphrase authentication.
//!
//! A room has no pre-provisioned credentials: the first peer to present a
//! passphrase sets it, and every later admission must present the same one.
//! Only a salted SHA-256 digest is retained, compared in constant time.
//!
//! Passphrases arrive either as `Authorization: Bearer <passphrase>` or as a
//! `?passphrase=` query parameter (browsers can't set headers on WebSocket
//! upgrades, so the query form is the one the WS endpoints use in practice).
//!
//! # Error responses
//!
//! - `401 Unauthorized` — passphrase absent
//! - `403 Forbidden` — passphrase present but does not match the room's digest

use std::time::SystemTime;

use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

/// The digest stored for a room after its first successful admission.
#[derive(Debug, Clone)]
pub struct AuthRecord {
    /// SHA-256 over `roomId \0 passphrase`.
    pub digest: [u8; 32],
    /// When the passphrase was first set.
    pub created_at: SystemTime,
}

/// Admission failure, mapped to an HTTP status by [`AuthError::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing passphrase")]
    Missing,
    #[error("Invalid passphrase")]
    Mismatch,
}

impl AuthError {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Missing => StatusCode::UNAUTHORIZED,
            Self::Mismatch => StatusCode::FORBIDDEN,
        }
    }
}

/// First-writer-wins passphrase store for one room.
#[derive(Debug, Default)]
pub struct RoomAuth {
    record: Mutex<Option<AuthRecord>>,
}

impl RoomAuth {
    /// Validate a passphrase against the room's record.
    ///
    /// The first call on a fresh room computes and stores the digest, then
    /// admits. Every later call compares digests in constant time. The record
    /// is immutable once set.
    pub async fn validate(&self, room_id: &str, passphrase: &str) -> Result<(), AuthError> {
        let digest = digest_passphrase(room_id, passphrase);
        let mut record = self.record.lock().await;
        match record.as_ref() {
            Some(existing) => {
                if constant_time_eq(&existing.digest, &digest) {
                    Ok(())
                } else {
                    Err(AuthError::Mismatch)
                }
            }
            None => {
                *record = Some(AuthRecord {
                    digest,
                    created_at: SystemTime::now(),
                });
                Ok(())
            }
        }
    }

    /// Whether a passphrase has been set for this room.
    pub async fn is_set(&self) -> bool {
        self.record.lock().await.is_some()
    }
}

/// SHA-256 over `roomId \0 passphrase`. The room id acts as the salt, so the
/// same passphrase yields distinct digests across rooms.
pub fn digest_passphrase(room_id: &str, passphrase: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(room_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(passphrase.as_bytes());
    hasher.finalize().into()
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Query parameters shared by every room-scoped endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Extract the passphrase from an `Authorization: Bearer` header or the
/// `?passphrase=` query parameter. The header wins when both are present.
pub fn extract_passphrase(headers: &HeaderMap, query: &AuthQuery) -> Option<String> {
    let from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(ToString::to_string);
    from_header.or_else(|| query.passphrase.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_passphrase_sets_the_record() {
        let auth = RoomAuth::default();
        assert!(!auth.is_set().await);
        auth.validate("r1", "p").await.unwrap();
        assert!(auth.is_set().await);
    }

    #[tokio::test]
    async fn repeat_passphrase_admits_and_mismatch_rejects() {
        let auth = RoomAuth::default();
        auth.validate("r1", "p").await.unwrap();
        assert_eq!(auth.validate("r1", "q").await, Err(AuthError::Mismatch));
        auth.validate("r1", "p").await.unwrap();
    }

    #[tokio::test]
    async fn rejected_passphrase_does_not_overwrite_the_record() {
        let auth = RoomAuth::default();
        auth.validate("r1", "p").await.unwrap();
        let _ = auth.validate("r1", "q").await;
        // "q" must not have become the stored passphrase.
        assert_eq!(auth.validate("r1", "q").await, Err(AuthError::Mismatch));
        auth.validate("r1", "p").await.unwrap();
    }

    #[test]
    fn digest_is_salted_by_room_id() {
        assert_ne!(digest_passphrase("r1", "p"), digest_passphrase("r2", "p"));
        assert_eq!(digest_passphrase("r1", "p"), digest_passphrase("r1", "p"));
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer from-header".parse().unwrap());
        let query = AuthQuery {
            passphrase: Some("from-query".to_string()),
        };
        assert_eq!(
            extract_passphrase(&headers, &query).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            extract_passphrase(&HeaderMap::new(), &query).as_deref(),
            Some("from-query")
        );
        assert_eq!(
            extract_passphrase(&HeaderMap::new(), &AuthQuery::default()),
            None
        );
    }
}
