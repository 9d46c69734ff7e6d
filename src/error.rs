//! Error taxonomy for the second-factor core.
//!
//! Validation errors are recoverable and leave session state untouched.
//! Configuration errors are fatal for the session and route to a terminal
//! state. Repository errors carry a stable identifier that is logged once at
//! the point of translation; the raw source never crosses the rendering
//! boundary, only a message key does.

use thiserror::Error;
use tracing::error;

use crate::methods::AuthMethod;

#[derive(Debug, Error)]
pub enum MfaError {
    #[error("invalid mail address")]
    InvalidEmail,
    #[error("invalid phone number")]
    InvalidPhone,
    #[error("invalid pin")]
    InvalidPin,
    #[error("method {0} is not enabled")]
    MethodNotEnabled(AuthMethod),
    #[error("no second-factor method is available")]
    NoMethodAvailable,
    #[error("unknown custom key manager: {0}")]
    UnknownKeyManager(String),
    #[error("no custom key manager configured")]
    NoCustomManager,
    #[error("no certificate on record")]
    MissingCertificate,
    #[error("stored key material is malformed")]
    MalformedKey,
    #[error("cryptographic failure")]
    Crypto(#[source] anyhow::Error),
    #[error("{id}: repository failure")]
    Repository {
        id: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl MfaError {
    /// Wrap a repository failure, logging it once with its stable identifier.
    pub fn repository(id: &'static str, source: anyhow::Error) -> Self {
        error!(id, error = ?source, "repository failure");
        Self::Repository { id, source }
    }

    /// True for locally recoverable input-format errors.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidEmail | Self::InvalidPhone | Self::InvalidPin
        )
    }

    /// True for fatal configuration errors that end the session.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MethodNotEnabled(_)
                | Self::NoMethodAvailable
                | Self::UnknownKeyManager(_)
                | Self::NoCustomManager
                | Self::MissingCertificate
                | Self::MalformedKey
        )
    }

    /// Message key surfaced to the rendering collaborator in place of the error.
    #[must_use]
    pub fn message_key(&self) -> &'static str {
        match self {
            Self::InvalidEmail => "error_invalid_email",
            Self::InvalidPhone => "error_invalid_phone",
            Self::InvalidPin => "error_invalid_pin",
            Self::MethodNotEnabled(_) => "error_method_not_enabled",
            Self::NoMethodAvailable => "error_no_method_available",
            Self::UnknownKeyManager(_) | Self::NoCustomManager => "error_key_manager_config",
            Self::MissingCertificate => "error_missing_certificate",
            Self::MalformedKey => "error_malformed_key",
            Self::Crypto(_) => "error_crypto_failure",
            Self::Repository { .. } => "error_provider_unavailable",
        }
    }
}
