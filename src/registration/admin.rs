//! Thin administrative surface over registrations and keys.
//!
//! A CRUD wrapper for the host's management tooling. Deleting a registration
//! cascades to the stored secret key; resetting a key is an overwrite, so any
//! code computed from the previous seed stops verifying immediately.

use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::config::MfaConfig;
use crate::error::MfaError;
use crate::keys::SecretKeyManager;
use crate::registration::models::Registration;
use crate::registration::store::RegistrationStore;
use crate::repo::bounded;
use crate::validate::normalize_upn;

#[derive(Clone)]
pub struct AdminService {
    registrations: Arc<dyn RegistrationStore>,
    keys: Arc<dyn SecretKeyManager>,
    timeout: Duration,
}

impl AdminService {
    #[must_use]
    pub fn new(
        config: &MfaConfig,
        registrations: Arc<dyn RegistrationStore>,
        keys: Arc<dyn SecretKeyManager>,
    ) -> Self {
        Self {
            registrations,
            keys,
            timeout: config.repository_timeout(),
        }
    }

    pub async fn get_registration(&self, upn: &str) -> Result<Option<Registration>, MfaError> {
        bounded(self.timeout, self.registrations.fetch(upn))
            .await
            .map_err(|err| MfaError::repository("MFA0201", err))
    }

    pub async fn add_registration(&self, registration: &Registration) -> Result<(), MfaError> {
        bounded(self.timeout, self.registrations.upsert(registration))
            .await
            .map_err(|err| MfaError::repository("MFA0202", err))?;
        info!(upn = %normalize_upn(&registration.upn), "registration added");
        Ok(())
    }

    pub async fn set_registration(&self, registration: &Registration) -> Result<(), MfaError> {
        bounded(self.timeout, self.registrations.upsert(registration))
            .await
            .map_err(|err| MfaError::repository("MFA0203", err))
    }

    /// Delete the registration and cascade to its secret key.
    pub async fn delete_registration(&self, upn: &str) -> Result<bool, MfaError> {
        let removed = bounded(self.timeout, self.registrations.delete(upn))
            .await
            .map_err(|err| MfaError::repository("MFA0204", err))?;
        if removed {
            self.keys.remove_user_key(upn).await?;
            info!(upn = %normalize_upn(upn), "registration deleted");
        }
        Ok(removed)
    }

    pub async fn enable_registration(&self, upn: &str) -> Result<bool, MfaError> {
        bounded(self.timeout, self.registrations.set_enabled(upn, true))
            .await
            .map_err(|err| MfaError::repository("MFA0205", err))
    }

    pub async fn disable_registration(&self, upn: &str) -> Result<bool, MfaError> {
        bounded(self.timeout, self.registrations.set_enabled(upn, false))
            .await
            .map_err(|err| MfaError::repository("MFA0206", err))
    }

    pub async fn list_registrations(&self) -> Result<Vec<Registration>, MfaError> {
        bounded(self.timeout, self.registrations.list())
            .await
            .map_err(|err| MfaError::repository("MFA0207", err))
    }

    /// Replace the user's seed. The previous seed is invalid the moment this
    /// returns; the new seed is handed back once for delivery to the user.
    pub async fn reset_key(&self, upn: &str) -> Result<SecretString, MfaError> {
        let seed = self.keys.new_key(upn).await?;
        info!(upn = %normalize_upn(upn), "secret key reset");
        Ok(seed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::keys::{MemoryKeyStore, RngKeyManager};
    use crate::registration::store::MemoryRegistrationStore;

    fn service() -> AdminService {
        let config = MfaConfig::new();
        let keys = Arc::new(RngKeyManager::new(&config, Arc::new(MemoryKeyStore::new())));
        AdminService::new(&config, Arc::new(MemoryRegistrationStore::new()), keys)
    }

    #[tokio::test]
    async fn delete_cascades_to_secret_key() {
        let service = service();
        let registration = Registration::new("alice@example.com");
        service.add_registration(&registration).await.unwrap();
        service.reset_key("alice@example.com").await.unwrap();
        assert!(service.keys.has_stored_key("alice@example.com").await.unwrap());

        assert!(service.delete_registration("alice@example.com").await.unwrap());
        assert!(!service.keys.has_stored_key("alice@example.com").await.unwrap());
        assert!(service
            .get_registration("alice@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn enable_disable_round_trip() {
        let service = service();
        service
            .add_registration(&Registration::new("alice@example.com"))
            .await
            .unwrap();
        assert!(service.disable_registration("alice@example.com").await.unwrap());
        let fetched = service
            .get_registration("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(!fetched.enabled);
        assert!(service.enable_registration("alice@example.com").await.unwrap());
    }
}
