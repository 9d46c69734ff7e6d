//! Per-user feature policy.
//!
//! A read-only set of flags loaded once per session from host configuration.
//! The state machine consults these predicates to gate transitions; it never
//! mutates them.

/// Feature gates for a user's second-factor session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UserFeatures {
    mfa_required: bool,
    registration_required: bool,
    registration_allowed: bool,
    can_manage_options: bool,
    can_enroll_devices: bool,
    can_manage_password: bool,
    can_access_options: bool,
}

impl UserFeatures {
    /// All gates closed; callers opt in explicitly.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mfa_required: false,
            registration_required: false,
            registration_allowed: false,
            can_manage_options: false,
            can_enroll_devices: false,
            can_manage_password: false,
            can_access_options: false,
        }
    }

    #[must_use]
    pub fn with_mfa_required(mut self, required: bool) -> Self {
        self.mfa_required = required;
        self
    }

    #[must_use]
    pub fn with_registration_required(mut self, required: bool) -> Self {
        self.registration_required = required;
        self
    }

    #[must_use]
    pub fn with_registration_allowed(mut self, allowed: bool) -> Self {
        self.registration_allowed = allowed;
        self
    }

    #[must_use]
    pub fn with_manage_options(mut self, allowed: bool) -> Self {
        self.can_manage_options = allowed;
        self
    }

    #[must_use]
    pub fn with_enroll_devices(mut self, allowed: bool) -> Self {
        self.can_enroll_devices = allowed;
        self
    }

    #[must_use]
    pub fn with_manage_password(mut self, allowed: bool) -> Self {
        self.can_manage_password = allowed;
        self
    }

    #[must_use]
    pub fn with_access_options(mut self, allowed: bool) -> Self {
        self.can_access_options = allowed;
        self
    }

    #[must_use]
    pub fn is_mfa_required(&self) -> bool {
        self.mfa_required
    }

    #[must_use]
    pub fn is_registration_required(&self) -> bool {
        self.registration_required
    }

    #[must_use]
    pub fn is_registration_allowed(&self) -> bool {
        self.registration_allowed
    }

    #[must_use]
    pub fn can_manage_options(&self) -> bool {
        self.can_manage_options
    }

    #[must_use]
    pub fn can_enroll_devices(&self) -> bool {
        self.can_enroll_devices
    }

    #[must_use]
    pub fn can_manage_password(&self) -> bool {
        self.can_manage_password
    }

    #[must_use]
    pub fn can_access_options(&self) -> bool {
        self.can_access_options
    }
}

impl Default for UserFeatures {
    fn default() -> Self {
        Self::new()
    }
}
