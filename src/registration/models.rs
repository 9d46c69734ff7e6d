//! The persisted per-user registration record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{postgres::PgRow, FromRow, Row};
use uuid::Uuid;

use crate::methods::AuthMethod;
use crate::validate::normalize_upn;

/// Enrollment state of one identity. Created on first enrollment; mutated by
/// the admin surface or a completed wizard; deleted only explicitly, which
/// cascades to the stored secret key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Registration {
    pub id: Uuid,
    pub upn: String,
    pub mail_address: Option<String>,
    pub phone_number: Option<String>,
    pub enabled: bool,
    pub is_registered: bool,
    pub creation_date: DateTime<Utc>,
    pub preferred_method: AuthMethod,
    /// Hash of the user PIN; raw PINs are never stored.
    pub pin_hash: Option<Vec<u8>>,
}

impl Registration {
    #[must_use]
    pub fn new(upn: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            upn: normalize_upn(upn),
            mail_address: None,
            phone_number: None,
            enabled: true,
            is_registered: false,
            creation_date: Utc::now(),
            preferred_method: AuthMethod::Choose,
            pin_hash: None,
        }
    }

    pub fn set_pin(&mut self, pin: &str) {
        self.pin_hash = Some(hash_pin(&self.upn, pin));
    }

    /// Check a submitted PIN against the stored hash. `fallback_pin` covers
    /// users who never set one (deployment default).
    #[must_use]
    pub fn verify_pin(&self, pin: &str, fallback_pin: &str) -> bool {
        match &self.pin_hash {
            Some(hash) => *hash == hash_pin(&self.upn, pin.trim()),
            None => pin.trim() == fallback_pin,
        }
    }
}

fn hash_pin(upn: &str, pin: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(upn.as_bytes());
    hasher.update(b":");
    hasher.update(pin.as_bytes());
    hasher.finalize().to_vec()
}

impl<'r> FromRow<'r, PgRow> for Registration {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let preferred: String = row.try_get("preferred_method")?;
        let preferred_method = AuthMethod::from_str(&preferred).ok_or_else(|| {
            sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid mfa_registrations.preferred_method value: {preferred}"),
            )))
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            upn: row.try_get("upn")?,
            mail_address: row.try_get("mail_address")?,
            phone_number: row.try_get("phone_number")?,
            enabled: row.try_get("enabled")?,
            is_registered: row.try_get("is_registered")?,
            creation_date: row.try_get("created_at")?,
            preferred_method,
            pin_hash: row.try_get("pin_hash")?,
        })
    }
}
