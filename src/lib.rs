//! # Faktoro (Second-Factor Authentication Engine)
//!
//! `faktoro` is the second-factor layer a federation host bolts onto its
//! primary-credential login flow. Per login attempt it decides whether a
//! second factor is required, which method applies, how to enroll users who
//! lack one, and whether a submitted code is accepted.
//!
//! ## Session Model
//!
//! Each authentication exchange gets one [`flow::AuthenticationSession`],
//! driven by [`flow::AuthenticationFlow::advance`] with small opaque input
//! signals. The host renders [`flow::UiMode`] / [`flow::WizardPage`] and
//! writes submitted fields back through session setters; no raw error ever
//! crosses that boundary, only message keys.
//!
//! - **Identification** verifies a code against the active method.
//! - **Registration/Invitation** capture contact data and a preferred method.
//! - **Enroll wizards** run collect → provision → verify → success/failure,
//!   provisioning the seed exactly once per run.
//! - **Locking/DefinitiveError** are terminal refusals.
//!
//! ## Secret Keys
//!
//! [`keys::SecretKeyManager`] owns the one seed per UPN, in RNG (base32
//! CSPRNG bytes), RSA (certificate-sealed bundle) or CUSTOM (named strategy)
//! format, over a pluggable [`keys::KeyStore`]. Replacing a key invalidates
//! all previously valid codes; writes are atomic upserts keyed by UPN.
//!
//! ## Boundaries
//!
//! Markup rendering, directory/mail/SMS transports, attempt-count lockout
//! and token issuance after second-factor success belong to the host.

pub mod config;
pub mod error;
pub mod flow;
pub mod keys;
pub mod methods;
pub mod otp;
pub mod policy;
pub mod registration;
pub mod validate;

mod repo;

pub use config::{KeyFormat, MfaConfig, OtpAlgorithm, PassphraseMode};
pub use error::MfaError;
pub use flow::{AuthenticationFlow, AuthenticationSession, FlowOutcome, UiMode, WizardPage};
pub use methods::{AuthMethod, MethodProvider, MethodRegistry};
pub use policy::UserFeatures;
