//! Typed session states and outcomes.
//!
//! The top state and the wizard sub-state are separate enums matched as a
//! pair by the controller; enroll targets ride inside the `Enroll` variant so
//! an enroll state always names a valid target.

/// Common opaque input signals. Each state documents its own meanings for
/// the remaining small integers.
pub const SIGNAL_SUBMIT: u8 = 1;
pub const SIGNAL_CANCEL: u8 = 2;
pub const SIGNAL_BACK: u8 = 3;

/// What an enroll wizard is enrolling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnrollTarget {
    Otp,
    Email,
    Phone,
    Biometrics,
    Pin,
}

impl EnrollTarget {
    /// The second-factor method this target enrolls, if any. PIN enrollment
    /// decorates the current method rather than selecting one.
    #[must_use]
    pub fn method(self) -> Option<crate::methods::AuthMethod> {
        use crate::methods::AuthMethod;
        match self {
            Self::Otp => Some(AuthMethod::Code),
            Self::Email => Some(AuthMethod::Email),
            Self::Phone => Some(AuthMethod::External),
            Self::Biometrics => Some(AuthMethod::Biometrics),
            Self::Pin => None,
        }
    }
}

/// Top-level session state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UiMode {
    Identification,
    Registration,
    Invitation,
    SelectOptions,
    ChooseMethod,
    ChangePassword,
    Bypass,
    Locking,
    ShowQrCode,
    SendAuthRequest,
    SendAdministrativeRequest,
    SendKeyRequest,
    Enroll { target: EnrollTarget, and_save: bool },
    DefinitiveError,
}

/// Wizard sub-state. Positions advance 0→1→2→{3|4}; 4 may loop back to 0 or
/// 2 but never skips forward without a successful verification. The PIN
/// position is the method-specific extra used by PIN-mandatory methods.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WizardPage {
    #[default]
    Collect,
    Provision,
    Verify,
    Success,
    Failure,
    Pin,
}

impl WizardPage {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Collect => 0,
            Self::Provision => 1,
            Self::Verify => 2,
            Self::Success => 3,
            Self::Failure => 4,
            Self::Pin => 5,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Collect),
            1 => Some(Self::Provision),
            2 => Some(Self::Verify),
            3 => Some(Self::Success),
            4 => Some(Self::Failure),
            5 => Some(Self::Pin),
            _ => None,
        }
    }
}

/// Result of one `advance` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowOutcome {
    /// Session continues; render the current state.
    Continue,
    /// Second factor satisfied; the host proceeds to token issuance.
    Authenticated,
    /// Session is refused in a terminal state.
    Denied,
}
