//! Pure RFC 6238 accept/reject decisions.
//!
//! Time is always an explicit argument; the engine never reads the wall
//! clock, which keeps the shadow-window boundary exactly testable.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use totp_rs::{Secret, TOTP};

use crate::config::{MfaConfig, OtpAlgorithm};
use crate::error::MfaError;

/// Time-step code engine configured once per session.
#[derive(Clone)]
pub struct TotpEngine {
    algorithm: OtpAlgorithm,
    digits: usize,
    step_seconds: u64,
    shadow_window: u8,
    issuer: String,
}

impl TotpEngine {
    #[must_use]
    pub fn new(config: &MfaConfig) -> Self {
        Self {
            algorithm: config.hash_algorithm(),
            digits: config.totp_digits(),
            step_seconds: config.totp_step_seconds(),
            shadow_window: config.totp_shadow_window(),
            issuer: config.issuer().to_string(),
        }
    }

    fn instance(&self, seed: &SecretString, account: &str) -> Result<TOTP, MfaError> {
        let secret_bytes = Secret::Encoded(seed.expose_secret().to_string())
            .to_bytes()
            .map_err(|_| MfaError::MalformedKey)?;
        TOTP::new(
            self.algorithm.as_totp(),
            self.digits,
            self.shadow_window,
            self.step_seconds,
            secret_bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|_| MfaError::MalformedKey)
    }

    /// Check a submitted code against the seed at the given instant,
    /// accepting the first match within the shadow window of adjacent steps.
    pub fn verify(
        &self,
        seed: &SecretString,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, MfaError> {
        let totp = self.instance(seed, "account")?;
        Ok(totp.check(code.trim(), unix_seconds(now)))
    }

    /// Compute the code for the step containing `now`. Test and provisioning
    /// helper; verification goes through [`Self::verify`].
    pub fn generate_at(&self, seed: &SecretString, now: DateTime<Utc>) -> Result<String, MfaError> {
        let totp = self.instance(seed, "account")?;
        Ok(totp.generate(unix_seconds(now)))
    }

    /// otpauth:// provisioning URL for the ShowQrCode state.
    pub fn provisioning_url(&self, seed: &SecretString, upn: &str) -> Result<String, MfaError> {
        let totp = self.instance(seed, upn)?;
        Ok(totp.get_url())
    }
}

fn unix_seconds(now: DateTime<Utc>) -> u64 {
    u64::try_from(now.timestamp()).unwrap_or(0)
}
