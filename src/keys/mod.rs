//! Secret-credential lifecycle.
//!
//! One active seed per UPN, produced in the configured format. Replacing a
//! key invalidates all previously valid codes immediately; no key history is
//! retained.

pub mod custom;
pub mod rng;
pub mod rsa_sealed;
pub mod store;

use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;

pub use custom::CustomKeyManagers;
pub use rng::RngKeyManager;
pub use rsa_sealed::{RsaKeyManager, UserCertificate};
pub use store::{KeyRecord, KeyStore, MemoryKeyStore, SqlKeyStore};

use crate::config::{KeyFormat, MfaConfig};
use crate::error::MfaError;

/// Lifecycle contract for per-user seed material.
///
/// `new_key` overwrites: two calls return two different seeds and the first
/// becomes invalid the moment the second is stored.
#[async_trait]
pub trait SecretKeyManager: Send + Sync {
    async fn new_key(&self, upn: &str) -> Result<SecretString, MfaError>;
    async fn get_user_key(&self, upn: &str) -> Result<Option<SecretString>, MfaError>;
    async fn has_stored_key(&self, upn: &str) -> Result<bool, MfaError>;
    async fn remove_user_key(&self, upn: &str) -> Result<bool, MfaError>;
}

/// Select the key manager for the configured format.
///
/// CUSTOM resolves a named strategy from the registry; an unknown or missing
/// name is a configuration error, not a fallback.
pub fn build_key_manager(
    config: &MfaConfig,
    store: Arc<dyn KeyStore>,
    custom: &CustomKeyManagers,
) -> Result<Arc<dyn SecretKeyManager>, MfaError> {
    match config.key_format() {
        KeyFormat::Rng => Ok(Arc::new(RngKeyManager::new(config, store))),
        KeyFormat::Rsa => Ok(Arc::new(RsaKeyManager::new(config, store))),
        KeyFormat::Custom => {
            let name = config.custom_manager().ok_or(MfaError::NoCustomManager)?;
            custom.get(name)
        }
    }
}
