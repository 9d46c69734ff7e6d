//! Second-factor method catalogue.
//!
//! Each method exposes its capabilities through [`MethodProvider`]; the
//! registry is a capability-keyed map resolved once at construction, so the
//! state machine never does per-call dynamic lookup by enum tag.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::flow::session::AuthenticationSession;

/// A second-factor channel, also used as the persisted preferred method.
///
/// `Choose` and `None` are preference placeholders only; they never appear in
/// the registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Choose,
    Code,
    Email,
    External,
    Azure,
    Biometrics,
    None,
}

impl AuthMethod {
    /// Fixed rotation order used by the ChooseMethod state.
    pub const ROTATION: [Self; 5] = [
        Self::Code,
        Self::Email,
        Self::External,
        Self::Azure,
        Self::Biometrics,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Choose => "choose",
            Self::Code => "code",
            Self::Email => "email",
            Self::External => "external",
            Self::Azure => "azure",
            Self::Biometrics => "biometrics",
            Self::None => "none",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "choose" => Some(Self::Choose),
            "code" => Some(Self::Code),
            "email" => Some(Self::Email),
            "external" => Some(Self::External),
            "azure" => Some(Self::Azure),
            "biometrics" => Some(Self::Biometrics),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// True for the placeholder values that carry no provider.
    #[must_use]
    pub fn is_placeholder(self) -> bool {
        matches!(self, Self::Choose | Self::None)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UI building blocks a method may require the renderer to show.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UiElement {
    CodeInput,
    PinInput,
    QrCode,
    DeliveryAddress,
}

/// Capability surface of one second-factor method.
pub trait MethodProvider: Send + Sync {
    fn method(&self) -> AuthMethod;
    fn enabled(&self) -> bool;
    fn pin_required(&self) -> bool;
    fn allow_override(&self) -> bool;
    fn two_way(&self) -> bool;
    /// Strict forced enrollment: the wizard must expose no cancel transition.
    fn force_enrollment(&self) -> bool;
    /// Whether the Identification state may fall back to an out-of-band send.
    fn supports_oob_fallback(&self) -> bool;
    fn is_available(&self, ctx: &AuthenticationSession) -> bool;
    fn is_ui_element_required(&self, ctx: &AuthenticationSession, element: UiElement) -> bool;
}

/// Host-tunable settings for one configured method.
#[derive(Clone, Copy, Debug)]
pub struct MethodSettings {
    pub enabled: bool,
    pub pin_required: bool,
    pub allow_override: bool,
    pub two_way: bool,
    pub force_enrollment: bool,
}

impl Default for MethodSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pin_required: false,
            allow_override: true,
            two_way: false,
            force_enrollment: false,
        }
    }
}

/// Default provider backed by static settings.
///
/// Availability couples the settings with the session data the channel needs:
/// email delivery needs a mail address on record, phone delivery a number.
pub struct ConfiguredMethod {
    method: AuthMethod,
    settings: MethodSettings,
}

impl ConfiguredMethod {
    #[must_use]
    pub fn new(method: AuthMethod, settings: MethodSettings) -> Self {
        Self { method, settings }
    }
}

impl MethodProvider for ConfiguredMethod {
    fn method(&self) -> AuthMethod {
        self.method
    }

    fn enabled(&self) -> bool {
        self.settings.enabled
    }

    fn pin_required(&self) -> bool {
        self.settings.pin_required
    }

    fn allow_override(&self) -> bool {
        self.settings.allow_override
    }

    fn two_way(&self) -> bool {
        self.settings.two_way
    }

    fn force_enrollment(&self) -> bool {
        self.settings.force_enrollment
    }

    fn supports_oob_fallback(&self) -> bool {
        matches!(
            self.method,
            AuthMethod::Email | AuthMethod::External | AuthMethod::Azure
        )
    }

    fn is_available(&self, ctx: &AuthenticationSession) -> bool {
        if !self.settings.enabled {
            return false;
        }
        match self.method {
            AuthMethod::Code | AuthMethod::Azure | AuthMethod::Biometrics => true,
            AuthMethod::Email => ctx.mail_address().is_some(),
            AuthMethod::External => ctx.phone_number().is_some(),
            AuthMethod::Choose | AuthMethod::None => false,
        }
    }

    fn is_ui_element_required(&self, _ctx: &AuthenticationSession, element: UiElement) -> bool {
        match element {
            UiElement::CodeInput => !matches!(self.method, AuthMethod::Biometrics),
            UiElement::PinInput => self.settings.pin_required,
            UiElement::QrCode => matches!(self.method, AuthMethod::Code),
            UiElement::DeliveryAddress => {
                matches!(self.method, AuthMethod::Email | AuthMethod::External)
            }
        }
    }
}

/// Capability-keyed catalogue of the configured methods.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    providers: HashMap<AuthMethod, Arc<dyn MethodProvider>>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry with every rotation method registered using its default settings.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for method in AuthMethod::ROTATION {
            registry.register(Arc::new(ConfiguredMethod::new(
                method,
                MethodSettings::default(),
            )));
        }
        registry
    }

    /// Register a provider under its method tag, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn MethodProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    #[must_use]
    pub fn get(&self, method: AuthMethod) -> Option<&Arc<dyn MethodProvider>> {
        self.providers.get(&method)
    }

    /// Registered, enabled, and available for this session.
    #[must_use]
    pub fn is_capable(&self, method: AuthMethod, ctx: &AuthenticationSession) -> bool {
        self.get(method)
            .is_some_and(|provider| provider.enabled() && provider.is_available(ctx))
    }

    /// Available methods for this session, in rotation order.
    #[must_use]
    pub fn list_available(&self, ctx: &AuthenticationSession) -> Vec<AuthMethod> {
        AuthMethod::ROTATION
            .into_iter()
            .filter(|method| self.is_capable(*method, ctx))
            .collect()
    }

    /// Next available method after `current` in rotation order, wrapping at
    /// most once. Bounded by the rotation length, so the cycle provably
    /// terminates; `None` means no method is available at all.
    #[must_use]
    pub fn next_available(
        &self,
        current: AuthMethod,
        ctx: &AuthenticationSession,
    ) -> Option<AuthMethod> {
        let start = AuthMethod::ROTATION
            .iter()
            .position(|method| *method == current)
            .map_or(0, |index| index + 1);
        (0..AuthMethod::ROTATION.len())
            .map(|offset| AuthMethod::ROTATION[(start + offset) % AuthMethod::ROTATION.len()])
            .find(|method| self.is_capable(*method, ctx))
    }
}
