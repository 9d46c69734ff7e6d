//! The mutable per-attempt session record.
//!
//! Created at the start of one federation authentication exchange and
//! destroyed at its end; never persisted. The rendering collaborator reads
//! the current state and message key and writes submitted fields through the
//! setters; everything else is controller-internal.

use crate::methods::AuthMethod;
use crate::registration::models::Registration;

use super::state::{UiMode, WizardPage};

#[derive(Clone, Debug)]
pub struct AuthenticationSession {
    registration: Registration,
    ui_mode: UiMode,
    wizard_page: WizardPage,
    target_ui_mode: Option<UiMode>,
    /// Preferred method snapshot taken at session start.
    preferred_method: AuthMethod,
    /// Method the Identification state verifies against.
    active_method: AuthMethod,
    /// Candidate while cycling in ChooseMethod.
    cycle_method: Option<AuthMethod>,
    show_options: bool,
    is_remote: bool,
    is_two_way: bool,
    message_key: Option<&'static str>,
    provisioning_url: Option<String>,
    // Submitted fields, written by the renderer before each advance.
    email_input: Option<String>,
    phone_input: Option<String>,
    pin_input: Option<String>,
    code_input: Option<String>,
    selected_method: Option<AuthMethod>,
    page_selector: u8,
    // Wizard scratch state.
    pub(crate) collected_pin: Option<String>,
    pub(crate) oob_retry_used: bool,
}

impl AuthenticationSession {
    pub(crate) fn new(registration: Registration) -> Self {
        let preferred_method = registration.preferred_method;
        Self {
            registration,
            ui_mode: UiMode::Identification,
            wizard_page: WizardPage::default(),
            target_ui_mode: None,
            preferred_method,
            active_method: preferred_method,
            cycle_method: None,
            show_options: false,
            is_remote: false,
            is_two_way: false,
            message_key: None,
            provisioning_url: None,
            email_input: None,
            phone_input: None,
            pin_input: None,
            code_input: None,
            selected_method: None,
            page_selector: 0,
            collected_pin: None,
            oob_retry_used: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(registration: Registration) -> Self {
        Self::new(registration)
    }

    // Rendering interface: state.

    #[must_use]
    pub fn ui_mode(&self) -> UiMode {
        self.ui_mode
    }

    #[must_use]
    pub fn wizard_page(&self) -> WizardPage {
        self.wizard_page
    }

    #[must_use]
    pub fn message_key(&self) -> Option<&'static str> {
        self.message_key
    }

    #[must_use]
    pub fn provisioning_url(&self) -> Option<&str> {
        self.provisioning_url.as_deref()
    }

    #[must_use]
    pub fn upn(&self) -> &str {
        &self.registration.upn
    }

    #[must_use]
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    #[must_use]
    pub fn preferred_method(&self) -> AuthMethod {
        self.preferred_method
    }

    #[must_use]
    pub fn active_method(&self) -> AuthMethod {
        self.active_method
    }

    #[must_use]
    pub fn cycle_method(&self) -> Option<AuthMethod> {
        self.cycle_method
    }

    #[must_use]
    pub fn mail_address(&self) -> Option<&str> {
        self.registration.mail_address.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.registration.phone_number.as_deref()
    }

    #[must_use]
    pub fn show_options(&self) -> bool {
        self.show_options
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    #[must_use]
    pub fn is_two_way(&self) -> bool {
        self.is_two_way
    }

    #[must_use]
    pub fn page_selector(&self) -> u8 {
        self.page_selector
    }

    // Rendering interface: submitted fields.

    pub fn set_email(&mut self, email: impl Into<String>) {
        self.email_input = Some(email.into());
    }

    pub fn set_phone(&mut self, phone: impl Into<String>) {
        self.phone_input = Some(phone.into());
    }

    pub fn set_pin(&mut self, pin: impl Into<String>) {
        self.pin_input = Some(pin.into());
    }

    pub fn set_code(&mut self, code: impl Into<String>) {
        self.code_input = Some(code.into());
    }

    pub fn set_selected_method(&mut self, method: AuthMethod) {
        self.selected_method = Some(method);
    }

    pub fn set_page_selector(&mut self, page: u8) {
        self.page_selector = page.min(5);
    }

    pub fn set_show_options(&mut self, show: bool) {
        self.show_options = show;
    }

    pub fn set_remote(&mut self, remote: bool) {
        self.is_remote = remote;
    }

    // Controller-internal mutation.

    pub(crate) fn registration_mut(&mut self) -> &mut Registration {
        &mut self.registration
    }

    pub(crate) fn email_input(&self) -> Option<&str> {
        self.email_input.as_deref()
    }

    pub(crate) fn phone_input(&self) -> Option<&str> {
        self.phone_input.as_deref()
    }

    pub(crate) fn pin_input(&self) -> Option<&str> {
        self.pin_input.as_deref()
    }

    pub(crate) fn code_input(&self) -> Option<&str> {
        self.code_input.as_deref()
    }

    pub(crate) fn selected_method(&self) -> Option<AuthMethod> {
        self.selected_method
    }

    pub(crate) fn set_ui_mode(&mut self, ui_mode: UiMode) {
        self.ui_mode = ui_mode;
    }

    pub(crate) fn set_wizard_page(&mut self, page: WizardPage) {
        self.wizard_page = page;
    }

    pub(crate) fn set_target_ui_mode(&mut self, target: Option<UiMode>) {
        self.target_ui_mode = target;
    }

    pub(crate) fn take_target_ui_mode(&mut self) -> Option<UiMode> {
        self.target_ui_mode.take()
    }

    pub(crate) fn set_active_method(&mut self, method: AuthMethod) {
        self.active_method = method;
    }

    pub(crate) fn set_cycle_method(&mut self, method: Option<AuthMethod>) {
        self.cycle_method = method;
    }

    pub(crate) fn set_two_way(&mut self, two_way: bool) {
        self.is_two_way = two_way;
    }

    pub(crate) fn set_message(&mut self, key: &'static str) {
        self.message_key = Some(key);
    }

    pub(crate) fn clear_message(&mut self) {
        self.message_key = None;
    }

    pub(crate) fn set_provisioning_url(&mut self, url: Option<String>) {
        self.provisioning_url = url;
    }

    /// Drop submitted fields and wizard scratch state.
    pub(crate) fn clear_inputs(&mut self) {
        self.email_input = None;
        self.phone_input = None;
        self.pin_input = None;
        self.code_input = None;
        self.selected_method = None;
        self.collected_pin = None;
        self.provisioning_url = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_starts_in_identification_at_wizard_zero() {
        let session = AuthenticationSession::new(Registration::new("alice@example.com"));
        assert_eq!(session.ui_mode(), UiMode::Identification);
        assert_eq!(session.wizard_page(), WizardPage::Collect);
        assert!(session.message_key().is_none());
    }

    #[test]
    fn page_selector_is_clamped() {
        let mut session = AuthenticationSession::new(Registration::new("alice@example.com"));
        session.set_page_selector(9);
        assert_eq!(session.page_selector(), 5);
    }
}
