//! RNG key format: CSPRNG seed bytes, stored base32-encoded.

use async_trait::async_trait;
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use totp_rs::Secret;
use tracing::info;

use crate::config::{KeyFormat, MfaConfig};
use crate::error::MfaError;
use crate::keys::store::{KeyRecord, KeyStore};
use crate::keys::SecretKeyManager;
use crate::repo::bounded;
use crate::validate::normalize_upn;

#[derive(Clone)]
pub struct RngKeyManager {
    key_size: usize,
    timeout: Duration,
    store: Arc<dyn KeyStore>,
}

impl RngKeyManager {
    #[must_use]
    pub fn new(config: &MfaConfig, store: Arc<dyn KeyStore>) -> Self {
        Self {
            key_size: config.key_size(),
            timeout: config.repository_timeout(),
            store,
        }
    }
}

#[async_trait]
impl SecretKeyManager for RngKeyManager {
    async fn new_key(&self, upn: &str) -> Result<SecretString, MfaError> {
        let upn = normalize_upn(upn);
        let mut bytes = vec![0u8; self.key_size];
        OsRng.fill_bytes(&mut bytes);
        let seed = Secret::Raw(bytes).to_encoded().to_string();

        let record = KeyRecord {
            upn: upn.clone(),
            format: KeyFormat::Rng,
            seed: seed.clone(),
            certificate: None,
            creation_date: Utc::now(),
        };
        bounded(self.timeout, self.store.upsert(record))
            .await
            .map_err(|err| MfaError::repository("MFA0301", err))?;
        info!(upn = %upn, "issued new rng secret key");
        Ok(SecretString::from(seed))
    }

    async fn get_user_key(&self, upn: &str) -> Result<Option<SecretString>, MfaError> {
        let upn = normalize_upn(upn);
        let record = bounded(self.timeout, self.store.fetch(&upn))
            .await
            .map_err(|err| MfaError::repository("MFA0302", err))?;
        Ok(record.map(|record| SecretString::from(record.seed)))
    }

    async fn has_stored_key(&self, upn: &str) -> Result<bool, MfaError> {
        let upn = normalize_upn(upn);
        let record = bounded(self.timeout, self.store.fetch(&upn))
            .await
            .map_err(|err| MfaError::repository("MFA0303", err))?;
        Ok(record.is_some())
    }

    async fn remove_user_key(&self, upn: &str) -> Result<bool, MfaError> {
        let upn = normalize_upn(upn);
        let removed = bounded(self.timeout, self.store.delete(&upn))
            .await
            .map_err(|err| MfaError::repository("MFA0304", err))?;
        if removed {
            info!(upn = %upn, "removed secret key");
        }
        Ok(removed)
    }
}
