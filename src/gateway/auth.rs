//! Bearer token authentication and one-shot nonce enforcement (spec.md §4.10
//! "Authentication", §6 "Authentication").
//!
//! Tokens carry `{subject, call_id, issued_at, expires_at, nonce}` and are
//! signed with a process-wide symmetric secret (spec.md leaves the exact
//! signature scheme open; this core uses HMAC-SHA256, consistent with the
//! `sha2` dependency already pulled in for the Feedback Store's id hashing).
//! The wire form is `base64url(payload_json).base64url(hmac)`, the same
//! compact two-part shape as a JWS with detached header.

use crate::error::{CoreError, Result};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant};

type HmacSha256 = Hmac<Sha256>;

/// A parsed, signature-verified bearer token (spec.md §4.10).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub subject: String,
    pub call_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub nonce: String,
}

impl AuthToken {
    #[must_use]
    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.expires_at
    }

    #[must_use]
    pub fn remaining_lifetime(&self, now_unix: i64) -> Duration {
        Duration::from_secs((self.expires_at - now_unix).max(0) as u64)
    }
}

/// Sign `token` with `secret`, producing the compact wire form.
///
/// # Panics
///
/// Never: `HmacSha256::new_from_slice` accepts any key length.
#[must_use]
pub fn sign_token(secret: &[u8], token: &AuthToken) -> String {
    let payload = serde_json::to_vec(token).expect("AuthToken always serializes");
    let payload_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&payload);
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload_b64.as_bytes());
    let sig_b64 =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{payload_b64}.{sig_b64}")
}

/// Parse and verify the signature on a compact token, without checking
/// expiry/nonce/call-id binding — those are [`NonceStore::admit`]'s job.
fn parse_and_verify(secret: &[u8], encoded: &str) -> Result<AuthToken> {
    let (payload_b64, sig_b64) = encoded
        .split_once('.')
        .ok_or_else(|| CoreError::Auth("malformed token: missing signature separator".to_owned()))?;

    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| CoreError::Auth("malformed token: bad payload encoding".to_owned()))?;
    let signature = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| CoreError::Auth("malformed token: bad signature encoding".to_owned()))?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| CoreError::Auth("token signature verification failed".to_owned()))?;

    serde_json::from_slice(&payload)
        .map_err(|e| CoreError::Auth(format!("malformed token payload: {e}")))
}

/// Short-lived, nonce-keyed replay guard (spec.md §4.10 "Nonce MUST be
/// one-shot"). TTL is the token's own remaining lifetime, capped by
/// `ttl_ceiling`.
pub struct NonceStore {
    seen: Mutex<HashMap<String, Instant>>,
    ttl_ceiling: Duration,
}

impl NonceStore {
    #[must_use]
    pub fn new(ttl_ceiling: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl_ceiling,
        }
    }

    fn prune(&self, guard: &mut HashMap<String, Instant>, now: Instant) {
        guard.retain(|_, expires_at| *expires_at > now);
    }

    /// Verify `encoded`'s signature, expiry, and call-id binding, then
    /// atomically claim its nonce. Returns `Err(Auth)` on any failure,
    /// including replay — a second `hello` with the same nonce within the
    /// TTL window is rejected even though the signature and expiry are
    /// still valid (spec.md S5).
    pub fn admit(
        &self,
        secret: &[u8],
        encoded: &str,
        now_unix: i64,
        expected_call_id: &str,
    ) -> Result<AuthToken> {
        let token = parse_and_verify(secret, encoded)?;

        if token.is_expired(now_unix) {
            return Err(CoreError::Auth("token expired".to_owned()));
        }
        if token.call_id != expected_call_id {
            return Err(CoreError::Auth(
                "token call_id does not match request target".to_owned(),
            ));
        }

        let ttl = token.remaining_lifetime(now_unix).min(self.ttl_ceiling);
        let now = Instant::now();
        let mut guard = self.seen.lock();
        self.prune(&mut guard, now);
        if guard.contains_key(&token.nonce) {
            return Err(CoreError::Auth("nonce already used".to_owned()));
        }
        guard.insert(token.nonce.clone(), now + ttl);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(call_id: &str, nonce: &str, issued_at: i64, expires_at: i64) -> AuthToken {
        AuthToken {
            subject: "caller".to_owned(),
            call_id: call_id.to_owned(),
            issued_at,
            expires_at,
            nonce: nonce.to_owned(),
        }
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let secret = b"top-secret";
        let t = token("call-1", "n1", 1_000, 2_000);
        let encoded = sign_token(secret, &t);
        let parsed = parse_and_verify(secret, &encoded).expect("verify");
        assert_eq!(parsed, t);
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let secret = b"top-secret";
        let t = token("call-1", "n1", 1_000, 2_000);
        let mut encoded = sign_token(secret, &t);
        encoded.push('x');
        assert!(parse_and_verify(secret, &encoded).is_err());
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let t = token("call-1", "n1", 1_000, 2_000);
        let encoded = sign_token(b"secret-a", &t);
        assert!(parse_and_verify(b"secret-b", &encoded).is_err());
    }

    #[test]
    fn scenario_s5_nonce_replay_within_ttl_is_rejected() {
        let secret = b"top-secret";
        let store = NonceStore::new(Duration::from_secs(3600));
        let t = token("call-1", "n1", 0, 10_000);
        let encoded = sign_token(secret, &t);

        assert!(store.admit(secret, &encoded, 1, "call-1").is_ok());
        let replay = store.admit(secret, &encoded, 1, "call-1");
        assert!(replay.is_err());
        assert_eq!(replay.unwrap_err().code(), "auth");
    }

    #[test]
    fn expired_token_is_rejected_even_with_fresh_nonce() {
        let secret = b"top-secret";
        let store = NonceStore::new(Duration::from_secs(3600));
        let t = token("call-1", "n2", 0, 100);
        let encoded = sign_token(secret, &t);
        assert!(store.admit(secret, &encoded, 200, "call-1").is_err());
    }

    #[test]
    fn call_id_mismatch_is_rejected() {
        let secret = b"top-secret";
        let store = NonceStore::new(Duration::from_secs(3600));
        let t = token("call-1", "n3", 0, 10_000);
        let encoded = sign_token(secret, &t);
        assert!(store.admit(secret, &encoded, 1, "call-2").is_err());
    }
}
