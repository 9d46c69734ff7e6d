//! Second-factor configuration.
//!
//! The configuration is an explicit immutable value handed to
//! [`crate::flow::AuthenticationFlow`] and the key managers at construction
//! time; nothing in the crate reads ambient process-wide state after startup.

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_KEY_SIZE_BYTES: usize = 20;
const DEFAULT_CERTIFICATE_VALIDITY_YEARS: u32 = 5;
const DEFAULT_SHADOW_WINDOW: u8 = 1;
const DEFAULT_TOTP_STEP_SECONDS: u64 = 30;
const DEFAULT_TOTP_DIGITS: usize = 6;
const DEFAULT_DELIVERY_WINDOW_SECONDS: u64 = 300;
const DEFAULT_REPOSITORY_TIMEOUT_SECONDS: u64 = 5;
const ENV_KEY_FORMAT: &str = "FAKTORO_KEY_FORMAT";
const ENV_SHADOW_WINDOW: &str = "FAKTORO_TOTP_SHADOW_WINDOW";

/// Storage format for the per-user OTP seed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    Rng,
    Rsa,
    Custom,
}

impl KeyFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rng => "rng",
            Self::Rsa => "rsa",
            Self::Custom => "custom",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "rng" => Some(Self::Rng),
            "rsa" => Some(Self::Rsa),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Hash algorithm for time-step code derivation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl OtpAlgorithm {
    pub(crate) fn as_totp(self) -> totp_rs::Algorithm {
        match self {
            Self::Sha1 => totp_rs::Algorithm::SHA1,
            Self::Sha256 => totp_rs::Algorithm::SHA256,
            Self::Sha512 => totp_rs::Algorithm::SHA512,
        }
    }
}

/// How the RSA certificate bundle passphrase is obtained.
///
/// `DerivedFromUpn` keeps bundles written by legacy deployments readable: the
/// passphrase is computable from public identity data, so it is supported only
/// as an opt-in compatibility mode. New deployments keep the default: a
/// separately stored random key-encryption key via `StoredKek`.
#[derive(Clone)]
pub enum PassphraseMode {
    DerivedFromUpn,
    StoredKek(SecretString),
}

impl PassphraseMode {
    /// Fresh random key-encryption key. The host must persist the value it
    /// hands back out of `MfaConfig`, or stored bundles become unreadable
    /// after a restart.
    #[must_use]
    pub fn generated() -> Self {
        let mut kek = [0u8; 32];
        OsRng.fill_bytes(&mut kek);
        Self::StoredKek(SecretString::from(Base64::encode_string(&kek)))
    }
}

/// Immutable second-factor configuration.
#[derive(Clone)]
pub struct MfaConfig {
    key_format: KeyFormat,
    key_size: usize,
    certificate_validity_years: u32,
    totp_shadow_window: u8,
    totp_step_seconds: u64,
    totp_digits: usize,
    hash_algorithm: OtpAlgorithm,
    delivery_window: Duration,
    default_country_code: String,
    default_pin: String,
    repository_timeout: Duration,
    custom_manager: Option<String>,
    passphrase_mode: PassphraseMode,
    issuer: String,
    promotion_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl MfaConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            key_format: KeyFormat::Rng,
            key_size: DEFAULT_KEY_SIZE_BYTES,
            certificate_validity_years: DEFAULT_CERTIFICATE_VALIDITY_YEARS,
            totp_shadow_window: DEFAULT_SHADOW_WINDOW,
            totp_step_seconds: DEFAULT_TOTP_STEP_SECONDS,
            totp_digits: DEFAULT_TOTP_DIGITS,
            hash_algorithm: OtpAlgorithm::Sha1,
            delivery_window: Duration::from_secs(DEFAULT_DELIVERY_WINDOW_SECONDS),
            default_country_code: "+1".to_string(),
            default_pin: "0000".to_string(),
            repository_timeout: Duration::from_secs(DEFAULT_REPOSITORY_TIMEOUT_SECONDS),
            custom_manager: None,
            passphrase_mode: PassphraseMode::generated(),
            issuer: "Faktoro".to_string(),
            promotion_window: None,
        }
    }

    #[must_use]
    pub fn with_key_format(mut self, key_format: KeyFormat) -> Self {
        self.key_format = key_format;
        self
    }

    #[must_use]
    pub fn with_key_size(mut self, key_size: usize) -> Self {
        self.key_size = key_size;
        self
    }

    #[must_use]
    pub fn with_certificate_validity_years(mut self, years: u32) -> Self {
        self.certificate_validity_years = years;
        self
    }

    #[must_use]
    pub fn with_shadow_window(mut self, shadow_window: u8) -> Self {
        self.totp_shadow_window = shadow_window;
        self
    }

    #[must_use]
    pub fn with_hash_algorithm(mut self, algorithm: OtpAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn with_delivery_window(mut self, window: Duration) -> Self {
        self.delivery_window = window;
        self
    }

    #[must_use]
    pub fn with_default_country_code(mut self, code: impl Into<String>) -> Self {
        self.default_country_code = code.into();
        self
    }

    #[must_use]
    pub fn with_default_pin(mut self, pin: impl Into<String>) -> Self {
        self.default_pin = pin.into();
        self
    }

    #[must_use]
    pub fn with_repository_timeout(mut self, timeout: Duration) -> Self {
        self.repository_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_custom_manager(mut self, name: impl Into<String>) -> Self {
        self.custom_manager = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_passphrase_mode(mut self, mode: PassphraseMode) -> Self {
        self.passphrase_mode = mode;
        self
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_promotion_window(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.promotion_window = Some((from, until));
        self
    }

    /// Load overrides from environment variables on top of the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(format) = std::env::var(ENV_KEY_FORMAT)
            .ok()
            .and_then(|value| KeyFormat::from_str(&value))
        {
            config.key_format = format;
        }
        if let Some(window) = std::env::var(ENV_SHADOW_WINDOW)
            .ok()
            .and_then(|value| value.trim().parse::<u8>().ok())
        {
            config.totp_shadow_window = window;
        }
        config
    }

    #[must_use]
    pub fn key_format(&self) -> KeyFormat {
        self.key_format
    }

    #[must_use]
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    #[must_use]
    pub fn certificate_validity_years(&self) -> u32 {
        self.certificate_validity_years
    }

    #[must_use]
    pub fn totp_shadow_window(&self) -> u8 {
        self.totp_shadow_window
    }

    #[must_use]
    pub fn totp_step_seconds(&self) -> u64 {
        self.totp_step_seconds
    }

    #[must_use]
    pub fn totp_digits(&self) -> usize {
        self.totp_digits
    }

    #[must_use]
    pub fn hash_algorithm(&self) -> OtpAlgorithm {
        self.hash_algorithm
    }

    #[must_use]
    pub fn delivery_window(&self) -> Duration {
        self.delivery_window
    }

    #[must_use]
    pub fn default_country_code(&self) -> &str {
        &self.default_country_code
    }

    #[must_use]
    pub fn default_pin(&self) -> &str {
        &self.default_pin
    }

    #[must_use]
    pub fn repository_timeout(&self) -> Duration {
        self.repository_timeout
    }

    #[must_use]
    pub fn custom_manager(&self) -> Option<&str> {
        self.custom_manager.as_deref()
    }

    #[must_use]
    pub fn passphrase_mode(&self) -> &PassphraseMode {
        &self.passphrase_mode
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// True when `now` falls inside the configured enrollment promotion window.
    #[must_use]
    pub fn in_promotion_window(&self, now: DateTime<Utc>) -> bool {
        self.promotion_window
            .is_some_and(|(from, until)| now >= from && now <= until)
    }
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self::new()
    }
}
