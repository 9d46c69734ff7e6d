//! Named strategy registry for CUSTOM key managers.
//!
//! The CUSTOM format delegates the whole lifecycle contract to an externally
//! supplied implementation selected by configuration key. Registration is
//! explicit at startup; there is no dynamic type loading.

use std::{collections::HashMap, sync::Arc};

use crate::error::MfaError;
use crate::keys::SecretKeyManager;

#[derive(Clone, Default)]
pub struct CustomKeyManagers {
    managers: HashMap<String, Arc<dyn SecretKeyManager>>,
}

impl CustomKeyManagers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy under a configuration key, replacing any previous
    /// holder of the name.
    pub fn register(&mut self, name: impl Into<String>, manager: Arc<dyn SecretKeyManager>) {
        self.managers.insert(name.into(), manager);
    }

    /// Resolve a strategy by its configuration key.
    pub fn get(&self, name: &str) -> Result<Arc<dyn SecretKeyManager>, MfaError> {
        self.managers
            .get(name)
            .cloned()
            .ok_or_else(|| MfaError::UnknownKeyManager(name.to_string()))
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.managers.keys().map(String::as_str).collect()
    }
}
