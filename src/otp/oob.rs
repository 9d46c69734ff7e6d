//! Out-of-band delivery codes.
//!
//! Codes delivered over a side channel are bounded by a delivery window from
//! issuance and are single-use: the consumption marker lives here, outside
//! the pure code comparison. Only a hash of the code is kept at rest; the
//! plaintext goes to the transport adapter once and is forgotten.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, Rng};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::error::MfaError;

/// Transport adapter for delivered codes (mail/SMS/vendor push). External
/// collaborator; implementations live in the host.
#[async_trait::async_trait]
pub trait OobDispatcher: Send + Sync {
    /// Deliver a code. `destination` is set during enrollment, before the
    /// collected address is committed to the registration; `None` means the
    /// address on record.
    async fn dispatch(&self, upn: &str, destination: Option<&str>, code: &str)
        -> anyhow::Result<()>;
    /// Administrative notifications (key requests, admin requests) reuse the
    /// same channel with no code payload.
    async fn notify_admin(&self, upn: &str, reason: &str) -> anyhow::Result<()>;
}

struct PendingCode {
    code_hash: Vec<u8>,
    issued_at: DateTime<Utc>,
    consumed: bool,
}

/// Issues delivery-window codes and enforces single use.
#[derive(Clone)]
pub struct OobCodeIssuer {
    window: Duration,
    digits: u32,
    pending: Arc<RwLock<HashMap<String, PendingCode>>>,
}

impl OobCodeIssuer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            digits: 6,
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Issue a fresh code for the identity, replacing any pending one.
    /// Returns the plaintext exactly once, for the transport adapter.
    pub fn issue(&self, upn: &str, now: DateTime<Utc>) -> Result<String, MfaError> {
        let bound = 10u32.pow(self.digits);
        let value = OsRng.gen_range(0..bound);
        let code = format!("{value:0width$}", width = self.digits as usize);
        let entry = PendingCode {
            code_hash: hash_code(upn, &code),
            issued_at: now,
            consumed: false,
        };
        let mut pending = self
            .pending
            .write()
            .map_err(|_| MfaError::repository("MFA0401", anyhow!("poisoned lock")))?;
        pending.insert(upn.to_string(), entry);
        Ok(code)
    }

    /// Accept the code at most once inside the delivery window. A replay of
    /// an already accepted code is rejected even while the window is open.
    #[must_use]
    pub fn verify_consume(&self, upn: &str, code: &str, now: DateTime<Utc>) -> bool {
        let Ok(mut pending) = self.pending.write() else {
            return false;
        };
        let Some(entry) = pending.get_mut(upn) else {
            return false;
        };
        if entry.consumed || !within_window(entry.issued_at, now, self.window) {
            return false;
        }
        if entry.code_hash != hash_code(upn, code.trim()) {
            return false;
        }
        entry.consumed = true;
        true
    }

    /// Whether an unconsumed code is pending for the identity.
    #[must_use]
    pub fn has_pending(&self, upn: &str, now: DateTime<Utc>) -> bool {
        self.pending.read().is_ok_and(|pending| {
            pending
                .get(upn)
                .is_some_and(|entry| !entry.consumed && within_window(entry.issued_at, now, self.window))
        })
    }
}

fn within_window(issued_at: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(issued_at)
        .to_std()
        .is_ok_and(|elapsed| elapsed <= window)
}

fn hash_code(upn: &str, code: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(upn.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn code_is_accepted_exactly_once() {
        let issuer = OobCodeIssuer::new(Duration::from_secs(300));
        let code = issuer.issue("alice@example.com", now()).unwrap();
        assert!(issuer.verify_consume("alice@example.com", &code, now()));
        // Replay inside the window is rejected.
        assert!(!issuer.verify_consume("alice@example.com", &code, now()));
    }

    #[test]
    fn window_expiry_rejects() {
        let issuer = OobCodeIssuer::new(Duration::from_secs(300));
        let code = issuer.issue("alice@example.com", now()).unwrap();
        let late = now() + chrono::Duration::seconds(301);
        assert!(!issuer.verify_consume("alice@example.com", &code, late));
    }

    #[test]
    fn reissue_invalidates_previous_code() {
        let issuer = OobCodeIssuer::new(Duration::from_secs(300));
        let first = issuer.issue("alice@example.com", now()).unwrap();
        let second = issuer.issue("alice@example.com", now()).unwrap();
        if first != second {
            assert!(!issuer.verify_consume("alice@example.com", &first, now()));
        }
        assert!(issuer.verify_consume("alice@example.com", &second, now()));
    }

    #[test]
    fn codes_are_scoped_to_the_identity() {
        let issuer = OobCodeIssuer::new(Duration::from_secs(300));
        let code = issuer.issue("alice@example.com", now()).unwrap();
        assert!(!issuer.verify_consume("bob@example.com", &code, now()));
    }
}
