//! Per-session authentication and enrollment state machine.
//!
//! One flow value serves many concurrent sessions; each session is advanced
//! by a single logical worker and all shared state lives in the stores. The
//! controller consumes the method registry, policy and key manager, and
//! translates every repository failure into a state transition plus a
//! message key — raw errors never reach the rendering collaborator.

pub mod session;
pub mod state;
mod wizard;

pub use session::AuthenticationSession;
pub use state::{
    EnrollTarget, FlowOutcome, UiMode, WizardPage, SIGNAL_BACK, SIGNAL_CANCEL, SIGNAL_SUBMIT,
};

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use crate::config::MfaConfig;
use crate::error::MfaError;
use crate::keys::SecretKeyManager;
use crate::methods::{AuthMethod, MethodRegistry};
use crate::otp::{OobCodeIssuer, OobDispatcher, TotpEngine};
use crate::policy::UserFeatures;
use crate::registration::models::Registration;
use crate::registration::store::RegistrationStore;
use crate::repo::bounded;
use crate::validate::{normalize_phone, valid_email};

use wizard::EnrollmentWizard;

/// Fire-and-forget dispatch with one automatic retry. Repeated failure is
/// surfaced to the caller; there is no unbounded retry loop.
pub(crate) async fn dispatch_with_retry(
    dispatcher: &Arc<dyn OobDispatcher>,
    upn: &str,
    destination: Option<&str>,
    code: &str,
) -> bool {
    match dispatcher.dispatch(upn, destination, code).await {
        Ok(()) => true,
        Err(err) => {
            warn!(upn = %upn, error = ?err, "oob dispatch failed, retrying once");
            match dispatcher.dispatch(upn, destination, code).await {
                Ok(()) => true,
                Err(err) => {
                    error!(upn = %upn, error = ?err, "oob dispatch failed after retry");
                    false
                }
            }
        }
    }
}

async fn notify_admin_with_retry(
    dispatcher: &Arc<dyn OobDispatcher>,
    upn: &str,
    reason: &str,
) -> bool {
    match dispatcher.notify_admin(upn, reason).await {
        Ok(()) => true,
        Err(err) => {
            warn!(upn = %upn, error = ?err, "admin notification failed, retrying once");
            dispatcher.notify_admin(upn, reason).await.is_ok()
        }
    }
}

/// Top-level controller for one deployment's second-factor sessions.
pub struct AuthenticationFlow {
    config: MfaConfig,
    policy: UserFeatures,
    registry: MethodRegistry,
    keys: Arc<dyn SecretKeyManager>,
    registrations: Arc<dyn RegistrationStore>,
    engine: TotpEngine,
    oob: OobCodeIssuer,
    dispatcher: Arc<dyn OobDispatcher>,
    wizard: EnrollmentWizard,
    timeout: Duration,
}

impl AuthenticationFlow {
    #[must_use]
    pub fn new(
        config: MfaConfig,
        policy: UserFeatures,
        registry: MethodRegistry,
        keys: Arc<dyn SecretKeyManager>,
        registrations: Arc<dyn RegistrationStore>,
        dispatcher: Arc<dyn OobDispatcher>,
    ) -> Self {
        let engine = TotpEngine::new(&config);
        let oob = OobCodeIssuer::new(config.delivery_window());
        let wizard = EnrollmentWizard::new(
            &config,
            registry.clone(),
            Arc::clone(&keys),
            Arc::clone(&registrations),
            engine.clone(),
            oob.clone(),
            Arc::clone(&dispatcher),
        );
        let timeout = config.repository_timeout();
        Self {
            config,
            policy,
            registry,
            keys,
            registrations,
            engine,
            oob,
            dispatcher,
            wizard,
            timeout,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &TotpEngine {
        &self.engine
    }

    /// Begin a session for one federation authentication exchange.
    pub async fn initialize(&self, upn: &str, options_requested: bool) -> AuthenticationSession {
        self.initialize_at(upn, options_requested, Utc::now()).await
    }

    pub async fn initialize_at(
        &self,
        upn: &str,
        options_requested: bool,
        now: DateTime<Utc>,
    ) -> AuthenticationSession {
        let registration = match bounded(self.timeout, self.registrations.fetch(upn)).await {
            Ok(Some(registration)) => registration,
            Ok(None) => Registration::new(upn),
            Err(err) => {
                let err = MfaError::repository("MFA0101", err);
                let mut session = AuthenticationSession::new(Registration::new(upn));
                session.set_ui_mode(UiMode::Locking);
                session.set_message(err.message_key());
                return session;
            }
        };
        let mut session = AuthenticationSession::new(registration);
        self.select_initial_state(&mut session, options_requested, now);
        session
    }

    /// Advance the session with an opaque input signal.
    pub async fn advance(&self, session: &mut AuthenticationSession, signal: u8) -> FlowOutcome {
        self.advance_at(session, signal, Utc::now()).await
    }

    pub async fn advance_at(
        &self,
        session: &mut AuthenticationSession,
        signal: u8,
        now: DateTime<Utc>,
    ) -> FlowOutcome {
        let result = match session.ui_mode() {
            UiMode::Identification => self.handle_identification(session, signal, now).await,
            UiMode::Registration | UiMode::Invitation => {
                self.handle_registration(session, signal).await
            }
            UiMode::SelectOptions => Ok(self.handle_select_options(session, signal)),
            UiMode::ChooseMethod => self.handle_choose_method(session, signal).await,
            UiMode::ChangePassword => Ok(handle_change_password(session, signal)),
            UiMode::Bypass => Ok(self.handle_bypass(session, signal)),
            UiMode::ShowQrCode => {
                if signal == SIGNAL_SUBMIT {
                    session.set_provisioning_url(None);
                    session.set_ui_mode(UiMode::Identification);
                }
                Ok(FlowOutcome::Continue)
            }
            UiMode::SendAuthRequest => self.handle_send_auth_request(session, signal, now).await,
            UiMode::SendKeyRequest => self.handle_send_key_request(session, signal).await,
            UiMode::SendAdministrativeRequest => {
                self.handle_send_admin_request(session, signal).await
            }
            UiMode::Enroll { target, and_save } => {
                self.wizard
                    .advance(session, target, and_save, signal, now)
                    .await
            }
            UiMode::Locking | UiMode::DefinitiveError => Ok(FlowOutcome::Denied),
        };
        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                session.set_message(err.message_key());
                if err.is_configuration() {
                    session.set_ui_mode(UiMode::DefinitiveError);
                }
                FlowOutcome::Continue
            }
        }
    }

    fn select_initial_state(
        &self,
        session: &mut AuthenticationSession,
        options_requested: bool,
        now: DateTime<Utc>,
    ) {
        if !session.registration().is_registered {
            if self.policy.is_registration_required() {
                if self.policy.is_registration_allowed() {
                    session.set_ui_mode(UiMode::Registration);
                } else {
                    error!(upn = %session.upn(), "registration required but not allowed by policy");
                    session.set_ui_mode(UiMode::Locking);
                    session.set_message("error_registration_disabled");
                }
            } else if self.config.in_promotion_window(now) && self.policy.is_registration_allowed()
            {
                session.set_ui_mode(UiMode::Invitation);
            } else {
                session.set_ui_mode(UiMode::Locking);
                session.set_message("error_registration_closed");
            }
            return;
        }
        if !session.registration().enabled && self.policy.is_mfa_required() {
            session.set_ui_mode(UiMode::Locking);
            session.set_message("error_account_not_enabled");
            return;
        }
        if options_requested && self.policy.can_access_options() {
            session.set_show_options(true);
            session.set_ui_mode(UiMode::SelectOptions);
            return;
        }
        self.enter_identification(session);
    }

    fn enter_identification(&self, session: &mut AuthenticationSession) {
        let preferred = session.registration().preferred_method;
        if preferred.is_placeholder() {
            self.enter_choose_method(session);
            return;
        }
        match self.registry.get(preferred).cloned() {
            Some(provider) if provider.enabled() => {
                if provider.is_available(session) {
                    session.set_active_method(preferred);
                    session.set_two_way(provider.two_way());
                    session.set_ui_mode(UiMode::Identification);
                } else {
                    // Preferred channel lacks its delivery data; re-choose.
                    self.enter_choose_method(session);
                }
            }
            _ => {
                error!(upn = %session.upn(), method = %preferred, "preferred method missing or disabled");
                session.set_ui_mode(UiMode::DefinitiveError);
                session.set_message("error_method_not_enabled");
            }
        }
    }

    fn enter_choose_method(&self, session: &mut AuthenticationSession) {
        let available = self.registry.list_available(session);
        match available.first() {
            Some(first) => {
                session.set_cycle_method(Some(*first));
                session.set_ui_mode(UiMode::ChooseMethod);
            }
            None => {
                error!(upn = %session.upn(), "no second-factor method available");
                session.set_ui_mode(UiMode::DefinitiveError);
                session.set_message("error_no_method_available");
            }
        }
    }

    // Identification signals: 1 submit code, 2 no code available, 3 open
    // options, 4 re-display QR, 5 request a key resend.
    async fn handle_identification(
        &self,
        session: &mut AuthenticationSession,
        signal: u8,
        now: DateTime<Utc>,
    ) -> Result<FlowOutcome, MfaError> {
        session.clear_message();
        match signal {
            SIGNAL_SUBMIT => {
                let accepted = if self.oob.has_pending(session.upn(), now) {
                    session
                        .code_input()
                        .is_some_and(|code| self.oob.verify_consume(session.upn(), code, now))
                } else {
                    let Some(seed) = self.keys.get_user_key(session.upn()).await? else {
                        error!(upn = %session.upn(), "registered user has no stored key");
                        session.set_ui_mode(UiMode::DefinitiveError);
                        session.set_message("error_no_key");
                        return Ok(FlowOutcome::Continue);
                    };
                    match session.code_input() {
                        Some(code) => self.engine.verify(&seed, code, now)?,
                        None => false,
                    }
                };
                if accepted {
                    Ok(self.complete_second_factor(session))
                } else {
                    session.set_message("error_invalid_code");
                    Ok(FlowOutcome::Continue)
                }
            }
            2 => {
                let fallback = self
                    .registry
                    .get(session.active_method())
                    .is_some_and(|provider| provider.supports_oob_fallback());
                if fallback {
                    self.enter_send_auth_request(session, now).await
                } else {
                    self.enter_choose_method(session);
                    Ok(FlowOutcome::Continue)
                }
            }
            3 => {
                if self.policy.can_access_options() {
                    session.set_ui_mode(UiMode::SelectOptions);
                }
                Ok(FlowOutcome::Continue)
            }
            4 => {
                if session.active_method() == AuthMethod::Code {
                    if let Some(seed) = self.keys.get_user_key(session.upn()).await? {
                        let url = self.engine.provisioning_url(&seed, session.upn())?;
                        session.set_provisioning_url(Some(url));
                        session.set_ui_mode(UiMode::ShowQrCode);
                    }
                }
                Ok(FlowOutcome::Continue)
            }
            5 => {
                session.set_ui_mode(UiMode::SendKeyRequest);
                Ok(FlowOutcome::Continue)
            }
            _ => Ok(FlowOutcome::Continue),
        }
    }

    fn complete_second_factor(&self, session: &mut AuthenticationSession) -> FlowOutcome {
        // An unregistered or disabled identity never reaches the verified
        // terminal state, whatever the submitted code was.
        if !session.registration().is_registered || !session.registration().enabled {
            error!(upn = %session.upn(), "verified code for non-verifiable identity");
            session.set_ui_mode(UiMode::DefinitiveError);
            session.set_message("error_not_registered");
            return FlowOutcome::Continue;
        }
        let pin_gate = self
            .registry
            .get(session.active_method())
            .is_some_and(|provider| provider.two_way() && provider.pin_required());
        if pin_gate {
            session.set_ui_mode(UiMode::Bypass);
            FlowOutcome::Continue
        } else {
            info!(upn = %session.upn(), method = %session.active_method(), "second factor satisfied");
            FlowOutcome::Authenticated
        }
    }

    fn handle_bypass(&self, session: &mut AuthenticationSession, signal: u8) -> FlowOutcome {
        if signal != SIGNAL_SUBMIT {
            return FlowOutcome::Continue;
        }
        session.clear_message();
        let needs_pin = self
            .registry
            .get(session.active_method())
            .is_some_and(|provider| provider.two_way() && provider.pin_required());
        if !needs_pin {
            return FlowOutcome::Authenticated;
        }
        match session.pin_input() {
            Some(pin) if session.registration().verify_pin(pin, self.config.default_pin()) => {
                info!(upn = %session.upn(), "pin confirmed");
                FlowOutcome::Authenticated
            }
            _ => {
                session.set_message("error_invalid_pin");
                FlowOutcome::Continue
            }
        }
    }

    // SelectOptions link codes: 1 change password, 2..=6 enroll wizards,
    // 7 back to sign-in. A link whose capability is absent is suppressed.
    fn handle_select_options(&self, session: &mut AuthenticationSession, signal: u8) -> FlowOutcome {
        session.clear_message();
        match signal {
            1 => {
                if self.policy.can_manage_password() {
                    session.set_ui_mode(UiMode::ChangePassword);
                }
            }
            2..=6 => {
                let target = link_target(signal);
                if self.can_enroll(target) {
                    enter_enroll(session, target, false);
                }
            }
            7 => self.enter_identification(session),
            _ => {}
        }
        FlowOutcome::Continue
    }

    fn can_enroll(&self, target: EnrollTarget) -> bool {
        match target.method() {
            Some(method) => {
                self.policy.can_enroll_devices()
                    && self
                        .registry
                        .get(method)
                        .is_some_and(|provider| provider.enabled())
            }
            // PIN enrollment decorates the session options rather than a device.
            None => self.policy.can_manage_options(),
        }
    }

    // Registration/Invitation buttons: 1 save, 2 cancel, 3..=7 jump to a
    // wizard, 8 ask an administrator. The page selector (0..=5) only drives
    // rendering and is stored by its session setter.
    async fn handle_registration(
        &self,
        session: &mut AuthenticationSession,
        signal: u8,
    ) -> Result<FlowOutcome, MfaError> {
        session.clear_message();
        match signal {
            1 => {
                // Validate everything before mutating anything.
                let email_input = session.email_input().map(|input| input.trim().to_lowercase());
                let phone_input = session.phone_input().map(str::to_string);
                let mut email = None;
                if let Some(input) = email_input {
                    if !input.is_empty() {
                        if !valid_email(&input) {
                            session.set_message("error_invalid_email");
                            return Ok(FlowOutcome::Continue);
                        }
                        email = Some(input);
                    }
                }
                let mut phone = None;
                if let Some(input) = phone_input {
                    if !input.trim().is_empty() {
                        match normalize_phone(&input, self.config.default_country_code()) {
                            Some(normalized) => phone = Some(normalized),
                            None => {
                                session.set_message("error_invalid_phone");
                                return Ok(FlowOutcome::Continue);
                            }
                        }
                    }
                }
                if let Some(method) = session.selected_method() {
                    let known = method.is_placeholder()
                        || self
                            .registry
                            .get(method)
                            .is_some_and(|provider| provider.enabled());
                    if !known {
                        session.set_message("error_method_not_enabled");
                        return Ok(FlowOutcome::Continue);
                    }
                }

                let mut registration = session.registration().clone();
                if email.is_some() {
                    registration.mail_address = email;
                }
                if phone.is_some() {
                    registration.phone_number = phone;
                }
                if let Some(method) = session.selected_method() {
                    registration.preferred_method = method;
                }
                registration.is_registered = true;
                bounded(self.timeout, self.registrations.upsert(&registration))
                    .await
                    .map_err(|err| MfaError::repository("MFA0102", err))?;
                info!(upn = %registration.upn, "registration saved");
                *session.registration_mut() = registration;
                session.clear_inputs();
                self.enter_identification(session);
                Ok(FlowOutcome::Continue)
            }
            2 => {
                // Cancel leaves the stored registration untouched.
                session.clear_inputs();
                if session.ui_mode() == UiMode::Invitation && !self.policy.is_mfa_required() {
                    session.set_ui_mode(UiMode::Bypass);
                } else if session.registration().is_registered {
                    self.enter_identification(session);
                } else {
                    session.set_ui_mode(UiMode::Locking);
                    session.set_message("error_registration_required");
                }
                Ok(FlowOutcome::Continue)
            }
            3..=7 => {
                let target = jump_target(signal);
                if self.can_enroll(target) {
                    enter_enroll(session, target, true);
                }
                Ok(FlowOutcome::Continue)
            }
            8 => {
                session.set_ui_mode(UiMode::SendAdministrativeRequest);
                Ok(FlowOutcome::Continue)
            }
            _ => Ok(FlowOutcome::Continue),
        }
    }

    // ChooseMethod: 1 select the shown method, 2 rotate to the next
    // available one. Rotation is bounded by the method count.
    async fn handle_choose_method(
        &self,
        session: &mut AuthenticationSession,
        signal: u8,
    ) -> Result<FlowOutcome, MfaError> {
        session.clear_message();
        match signal {
            1 => {
                let Some(method) = session.cycle_method() else {
                    return Err(MfaError::NoMethodAvailable);
                };
                let Some(provider) = self.registry.get(method).cloned() else {
                    return Err(MfaError::MethodNotEnabled(method));
                };
                if provider.allow_override() && session.registration().is_registered {
                    let mut registration = session.registration().clone();
                    registration.preferred_method = method;
                    bounded(self.timeout, self.registrations.upsert(&registration))
                        .await
                        .map_err(|err| MfaError::repository("MFA0103", err))?;
                    *session.registration_mut() = registration;
                }
                session.set_active_method(method);
                session.set_two_way(provider.two_way());
                session.set_cycle_method(None);
                session.set_ui_mode(UiMode::Identification);
                Ok(FlowOutcome::Continue)
            }
            2 => {
                let current = session.cycle_method().unwrap_or(AuthMethod::Choose);
                match self.registry.next_available(current, session) {
                    Some(next) => session.set_cycle_method(Some(next)),
                    None => {
                        error!(upn = %session.upn(), "method rotation found nothing available");
                        session.set_ui_mode(UiMode::DefinitiveError);
                        session.set_message("error_no_method_available");
                    }
                }
                Ok(FlowOutcome::Continue)
            }
            _ => Ok(FlowOutcome::Continue),
        }
    }

    async fn enter_send_auth_request(
        &self,
        session: &mut AuthenticationSession,
        now: DateTime<Utc>,
    ) -> Result<FlowOutcome, MfaError> {
        let code = self.oob.issue(session.upn(), now)?;
        if dispatch_with_retry(&self.dispatcher, session.upn(), None, &code).await {
            session.set_ui_mode(UiMode::SendAuthRequest);
            session.set_message("info_code_sent");
        } else {
            // Stay put; the user keeps the "go back" option instead of an
            // unbounded retry loop.
            session.set_message("error_sending_code");
        }
        Ok(FlowOutcome::Continue)
    }

    // SendAuthRequest: 1 submit the delivered code, 2 resend (client-driven
    // refresh, once), 3 back to sign-in.
    async fn handle_send_auth_request(
        &self,
        session: &mut AuthenticationSession,
        signal: u8,
        now: DateTime<Utc>,
    ) -> Result<FlowOutcome, MfaError> {
        session.clear_message();
        match signal {
            SIGNAL_SUBMIT => {
                let accepted = session
                    .code_input()
                    .is_some_and(|code| self.oob.verify_consume(session.upn(), code, now));
                if accepted {
                    Ok(self.complete_second_factor(session))
                } else {
                    session.set_message("error_invalid_code");
                    Ok(FlowOutcome::Continue)
                }
            }
            2 => {
                if session.oob_retry_used {
                    session.set_message("error_resend_exhausted");
                    return Ok(FlowOutcome::Continue);
                }
                session.oob_retry_used = true;
                let code = self.oob.issue(session.upn(), now)?;
                if dispatch_with_retry(&self.dispatcher, session.upn(), None, &code).await {
                    session.set_message("info_code_sent");
                } else {
                    session.set_message("error_sending_code");
                }
                Ok(FlowOutcome::Continue)
            }
            SIGNAL_BACK => {
                session.set_ui_mode(UiMode::Identification);
                Ok(FlowOutcome::Continue)
            }
            _ => Ok(FlowOutcome::Continue),
        }
    }

    async fn handle_send_key_request(
        &self,
        session: &mut AuthenticationSession,
        signal: u8,
    ) -> Result<FlowOutcome, MfaError> {
        if signal != SIGNAL_SUBMIT {
            return Ok(FlowOutcome::Continue);
        }
        session.clear_message();
        if notify_admin_with_retry(&self.dispatcher, session.upn(), "key_request").await {
            session.set_message("info_key_request_sent");
            session.set_ui_mode(UiMode::Identification);
        } else {
            session.set_message("error_sending_request");
        }
        Ok(FlowOutcome::Continue)
    }

    async fn handle_send_admin_request(
        &self,
        session: &mut AuthenticationSession,
        signal: u8,
    ) -> Result<FlowOutcome, MfaError> {
        if signal != SIGNAL_SUBMIT {
            return Ok(FlowOutcome::Continue);
        }
        session.clear_message();
        if notify_admin_with_retry(&self.dispatcher, session.upn(), "registration_help").await {
            session.set_message("info_admin_request_sent");
            session.set_ui_mode(UiMode::Locking);
        } else {
            session.set_message("error_sending_request");
        }
        Ok(FlowOutcome::Continue)
    }
}

// ChangePassword: the actual credential change belongs to the host; this
// state only frames it. 1 done, 2 cancel.
fn handle_change_password(session: &mut AuthenticationSession, signal: u8) -> FlowOutcome {
    match signal {
        SIGNAL_SUBMIT => {
            session.set_message("info_password_changed");
            session.set_ui_mode(UiMode::SelectOptions);
        }
        SIGNAL_CANCEL => {
            session.clear_message();
            session.set_ui_mode(UiMode::SelectOptions);
        }
        _ => {}
    }
    FlowOutcome::Continue
}

fn enter_enroll(session: &mut AuthenticationSession, target: EnrollTarget, and_save: bool) {
    session.set_target_ui_mode(Some(session.ui_mode()));
    session.clear_inputs();
    session.clear_message();
    session.set_wizard_page(WizardPage::Collect);
    session.set_ui_mode(UiMode::Enroll { target, and_save });
}

fn link_target(signal: u8) -> EnrollTarget {
    match signal {
        2 => EnrollTarget::Otp,
        3 => EnrollTarget::Email,
        4 => EnrollTarget::Phone,
        5 => EnrollTarget::Biometrics,
        _ => EnrollTarget::Pin,
    }
}

fn jump_target(signal: u8) -> EnrollTarget {
    match signal {
        3 => EnrollTarget::Otp,
        4 => EnrollTarget::Email,
        5 => EnrollTarget::Phone,
        6 => EnrollTarget::Biometrics,
        _ => EnrollTarget::Pin,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::keys::{MemoryKeyStore, RngKeyManager};
    use crate::methods::{ConfiguredMethod, MethodSettings};
    use crate::registration::store::MemoryRegistrationStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    /// Dispatcher double: records delivered codes, optionally failing the
    /// first N dispatch attempts.
    #[derive(Default)]
    struct RecordingDispatcher {
        codes: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    impl RecordingDispatcher {
        fn failing(times: usize) -> Self {
            Self {
                codes: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(times),
            }
        }

        fn last_code(&self) -> Option<String> {
            self.codes.lock().unwrap().last().cloned()
        }
    }

    #[async_trait::async_trait]
    impl OobDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            _upn: &str,
            _destination: Option<&str>,
            code: &str,
        ) -> anyhow::Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                anyhow::bail!("provider unavailable");
            }
            self.codes.lock().unwrap().push(code.to_string());
            Ok(())
        }

        async fn notify_admin(&self, _upn: &str, _reason: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Key manager double counting `new_key` invocations.
    struct CountingKeys {
        inner: RngKeyManager,
        new_key_calls: AtomicUsize,
    }

    impl CountingKeys {
        fn new(config: &MfaConfig) -> Self {
            Self {
                inner: RngKeyManager::new(config, Arc::new(MemoryKeyStore::new())),
                new_key_calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.new_key_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SecretKeyManager for CountingKeys {
        async fn new_key(&self, upn: &str) -> Result<secrecy::SecretString, MfaError> {
            self.new_key_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.new_key(upn).await
        }

        async fn get_user_key(&self, upn: &str) -> Result<Option<secrecy::SecretString>, MfaError> {
            self.inner.get_user_key(upn).await
        }

        async fn has_stored_key(&self, upn: &str) -> Result<bool, MfaError> {
            self.inner.has_stored_key(upn).await
        }

        async fn remove_user_key(&self, upn: &str) -> Result<bool, MfaError> {
            self.inner.remove_user_key(upn).await
        }
    }

    struct Fixture {
        flow: AuthenticationFlow,
        registrations: Arc<MemoryRegistrationStore>,
        keys: Arc<CountingKeys>,
        dispatcher: Arc<RecordingDispatcher>,
    }

    fn fixture(policy: UserFeatures, registry: MethodRegistry) -> Fixture {
        fixture_with(policy, registry, MfaConfig::new(), RecordingDispatcher::default())
    }

    fn fixture_with(
        policy: UserFeatures,
        registry: MethodRegistry,
        config: MfaConfig,
        dispatcher: RecordingDispatcher,
    ) -> Fixture {
        let registrations = Arc::new(MemoryRegistrationStore::new());
        let keys = Arc::new(CountingKeys::new(&config));
        let dispatcher = Arc::new(dispatcher);
        let flow = AuthenticationFlow::new(
            config,
            policy,
            registry,
            Arc::clone(&keys) as Arc<dyn SecretKeyManager>,
            Arc::clone(&registrations) as Arc<dyn RegistrationStore>,
            Arc::clone(&dispatcher) as Arc<dyn OobDispatcher>,
        );
        Fixture {
            flow,
            registrations,
            keys,
            dispatcher,
        }
    }

    fn self_service_policy() -> UserFeatures {
        UserFeatures::new()
            .with_registration_allowed(true)
            .with_enroll_devices(true)
            .with_access_options(true)
            .with_manage_options(true)
    }

    async fn registered_user(fixture: &Fixture, upn: &str, method: AuthMethod) -> Registration {
        let mut registration = Registration::new(upn);
        registration.mail_address = Some(upn.to_string());
        registration.preferred_method = method;
        registration.is_registered = true;
        fixture.registrations.upsert(&registration).await.unwrap();
        registration
    }

    #[tokio::test]
    async fn unregistered_with_required_registration_starts_in_registration() {
        let fixture = fixture(
            self_service_policy().with_registration_required(true),
            MethodRegistry::with_defaults(),
        );
        let session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::Registration);
    }

    #[tokio::test]
    async fn unregistered_outside_promotion_window_locks() {
        let fixture = fixture(self_service_policy(), MethodRegistry::with_defaults());
        let session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::Locking);
        assert_eq!(
            fixture.flow.advance_at(&mut session.clone(), SIGNAL_SUBMIT, now()).await,
            FlowOutcome::Denied
        );
    }

    #[tokio::test]
    async fn unregistered_inside_promotion_window_is_invited() {
        let config = MfaConfig::new()
            .with_promotion_window(now() - chrono::Duration::days(1), now() + chrono::Duration::days(1));
        let fixture = fixture_with(
            self_service_policy(),
            MethodRegistry::with_defaults(),
            config,
            RecordingDispatcher::default(),
        );
        let session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::Invitation);
    }

    #[tokio::test]
    async fn disabled_registration_with_required_mfa_locks() {
        let fixture = fixture(
            self_service_policy().with_mfa_required(true),
            MethodRegistry::with_defaults(),
        );
        let mut registration = registered_user(&fixture, "alice@example.com", AuthMethod::Code).await;
        registration.enabled = false;
        fixture.registrations.upsert(&registration).await.unwrap();

        let session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::Locking);
        assert_eq!(session.message_key(), Some("error_account_not_enabled"));
    }

    #[tokio::test]
    async fn registered_user_lands_in_identification_or_options() {
        let fixture = fixture(self_service_policy(), MethodRegistry::with_defaults());
        registered_user(&fixture, "alice@example.com", AuthMethod::Code).await;

        let session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::Identification);

        let session = fixture
            .flow
            .initialize_at("alice@example.com", true, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::SelectOptions);
    }

    #[tokio::test]
    async fn zero_available_methods_is_definitive_error_not_a_loop() {
        let fixture = fixture(self_service_policy(), MethodRegistry::new());
        registered_user(&fixture, "alice@example.com", AuthMethod::Choose).await;
        let session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::DefinitiveError);
        assert_eq!(session.message_key(), Some("error_no_method_available"));
    }

    #[tokio::test]
    async fn choose_method_rotation_terminates_within_method_count() {
        let fixture = fixture(self_service_policy(), MethodRegistry::with_defaults());
        let mut registration =
            registered_user(&fixture, "alice@example.com", AuthMethod::Choose).await;
        registration.phone_number = Some("+14255550100".to_string());
        fixture.registrations.upsert(&registration).await.unwrap();
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::ChooseMethod);

        let mut seen = Vec::new();
        for _ in 0..=AuthMethod::ROTATION.len() {
            seen.push(session.cycle_method().unwrap());
            fixture.flow.advance_at(&mut session, 2, now()).await;
        }
        // Wrapped back to the first candidate: the cycle is bounded.
        assert_eq!(seen.first(), seen.last());
        assert_eq!(session.ui_mode(), UiMode::ChooseMethod);
    }

    #[tokio::test]
    async fn invalid_email_keeps_wizard_at_collect_without_new_key() {
        let fixture = fixture(self_service_policy(), MethodRegistry::with_defaults());
        registered_user(&fixture, "alice@example.com", AuthMethod::Code).await;
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", true, now())
            .await;

        fixture.flow.advance_at(&mut session, 3, now()).await;
        assert_eq!(
            session.ui_mode(),
            UiMode::Enroll {
                target: EnrollTarget::Email,
                and_save: false
            }
        );

        session.set_email("not-an-address");
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(session.wizard_page(), WizardPage::Collect);
        assert_eq!(session.message_key(), Some("error_invalid_email"));
        assert_eq!(fixture.keys.calls(), 0);
    }

    #[tokio::test]
    async fn email_enrollment_commits_preferred_method() {
        let fixture = fixture(self_service_policy(), MethodRegistry::with_defaults());
        registered_user(&fixture, "alice@example.com", AuthMethod::Code).await;
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", true, now())
            .await;
        fixture.flow.advance_at(&mut session, 3, now()).await;

        session.set_email("alice@contoso.com");
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(session.wizard_page(), WizardPage::Provision);
        assert_eq!(fixture.keys.calls(), 1);

        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(session.wizard_page(), WizardPage::Verify);

        let code = fixture.dispatcher.last_code().unwrap();
        session.set_code(code);
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(session.wizard_page(), WizardPage::Success);

        let stored = fixture
            .registrations
            .fetch("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.preferred_method, AuthMethod::Email);
        assert_eq!(stored.mail_address.as_deref(), Some("alice@contoso.com"));
        assert!(stored.enabled);
    }

    #[tokio::test]
    async fn wrong_code_routes_to_failure_then_retry() {
        let fixture = fixture(self_service_policy(), MethodRegistry::with_defaults());
        registered_user(&fixture, "alice@example.com", AuthMethod::Code).await;
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", true, now())
            .await;
        fixture.flow.advance_at(&mut session, 3, now()).await;
        session.set_email("alice@contoso.com");
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;

        session.set_code("000000");
        let real_code = fixture.dispatcher.last_code().unwrap();
        if real_code == "000000" {
            return; // astronomically unlucky draw; nothing to assert against
        }
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(session.wizard_page(), WizardPage::Failure);

        // Retry returns to Verify and the original code still works once.
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(session.wizard_page(), WizardPage::Verify);
        session.set_code(real_code);
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(session.wizard_page(), WizardPage::Success);
    }

    #[tokio::test]
    async fn strict_forced_enrollment_has_no_cancel_transition() {
        let mut registry = MethodRegistry::with_defaults();
        registry.register(Arc::new(ConfiguredMethod::new(
            AuthMethod::Email,
            MethodSettings {
                force_enrollment: true,
                ..MethodSettings::default()
            },
        )));
        let fixture = fixture(self_service_policy(), registry);
        registered_user(&fixture, "alice@example.com", AuthMethod::Code).await;
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", true, now())
            .await;
        fixture.flow.advance_at(&mut session, 3, now()).await;
        let enroll_mode = session.ui_mode();

        // Cancel at Collect: no transition exists.
        fixture.flow.advance_at(&mut session, SIGNAL_CANCEL, now()).await;
        assert_eq!(session.ui_mode(), enroll_mode);
        assert_eq!(session.wizard_page(), WizardPage::Collect);

        // Nor at Verify or Failure.
        session.set_email("alice@contoso.com");
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        fixture.flow.advance_at(&mut session, SIGNAL_CANCEL, now()).await;
        assert_eq!(session.ui_mode(), enroll_mode);
        assert_eq!(session.wizard_page(), WizardPage::Verify);

        session.set_code("000000");
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        if session.wizard_page() == WizardPage::Failure {
            fixture.flow.advance_at(&mut session, SIGNAL_CANCEL, now()).await;
            assert_eq!(session.ui_mode(), enroll_mode);
            assert_eq!(session.wizard_page(), WizardPage::Failure);
        }
    }

    #[tokio::test]
    async fn suppressed_option_links_do_not_transition() {
        let fixture = fixture(
            // No password management, no device enrollment.
            UserFeatures::new()
                .with_registration_allowed(true)
                .with_access_options(true),
            MethodRegistry::with_defaults(),
        );
        registered_user(&fixture, "alice@example.com", AuthMethod::Code).await;
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", true, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::SelectOptions);

        fixture.flow.advance_at(&mut session, 1, now()).await;
        assert_eq!(session.ui_mode(), UiMode::SelectOptions);
        fixture.flow.advance_at(&mut session, 3, now()).await;
        assert_eq!(session.ui_mode(), UiMode::SelectOptions);
    }

    #[tokio::test]
    async fn registration_cancel_leaves_store_untouched() {
        let fixture = fixture(
            self_service_policy().with_registration_required(true),
            MethodRegistry::with_defaults(),
        );
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::Registration);

        session.set_email("alice@contoso.com");
        fixture.flow.advance_at(&mut session, SIGNAL_CANCEL, now()).await;
        assert!(fixture
            .registrations
            .fetch("alice@example.com")
            .await
            .unwrap()
            .is_none());
        assert_eq!(session.ui_mode(), UiMode::Locking);
    }

    #[tokio::test]
    async fn registration_save_validates_before_mutating() {
        let fixture = fixture(
            self_service_policy().with_registration_required(true),
            MethodRegistry::with_defaults(),
        );
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;

        session.set_phone("555-FAKE");
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(session.ui_mode(), UiMode::Registration);
        assert_eq!(session.message_key(), Some("error_invalid_phone"));
        assert!(fixture
            .registrations
            .fetch("alice@example.com")
            .await
            .unwrap()
            .is_none());

        session.set_phone("(425) 555-0100");
        session.set_email("alice@contoso.com");
        session.set_selected_method(AuthMethod::External);
        fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        let stored = fixture
            .registrations
            .fetch("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_registered);
        assert_eq!(stored.phone_number.as_deref(), Some("+14255550100"));
        assert_eq!(stored.preferred_method, AuthMethod::External);
        assert_eq!(session.ui_mode(), UiMode::Identification);
    }

    #[tokio::test]
    async fn no_code_available_falls_back_to_send_auth_request() {
        let fixture = fixture(self_service_policy(), MethodRegistry::with_defaults());
        registered_user(&fixture, "alice@example.com", AuthMethod::Email).await;
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        assert_eq!(session.ui_mode(), UiMode::Identification);

        fixture.flow.advance_at(&mut session, 2, now()).await;
        assert_eq!(session.ui_mode(), UiMode::SendAuthRequest);

        let code = fixture.dispatcher.last_code().unwrap();
        session.set_code(code);
        let outcome = fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(outcome, FlowOutcome::Authenticated);
    }

    #[tokio::test]
    async fn no_code_without_fallback_enters_choose_method() {
        let fixture = fixture(self_service_policy(), MethodRegistry::with_defaults());
        registered_user(&fixture, "alice@example.com", AuthMethod::Code).await;
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        fixture.flow.advance_at(&mut session, 2, now()).await;
        assert_eq!(session.ui_mode(), UiMode::ChooseMethod);
    }

    #[tokio::test]
    async fn transient_dispatch_failure_is_retried_once() {
        let fixture = fixture_with(
            self_service_policy(),
            MethodRegistry::with_defaults(),
            MfaConfig::new(),
            RecordingDispatcher::failing(1),
        );
        registered_user(&fixture, "alice@example.com", AuthMethod::Email).await;
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        fixture.flow.advance_at(&mut session, 2, now()).await;
        // First attempt failed, the single automatic retry delivered.
        assert_eq!(session.ui_mode(), UiMode::SendAuthRequest);
        assert!(fixture.dispatcher.last_code().is_some());
    }

    #[tokio::test]
    async fn repeated_dispatch_failure_surfaces_with_go_back() {
        let fixture = fixture_with(
            self_service_policy(),
            MethodRegistry::with_defaults(),
            MfaConfig::new(),
            RecordingDispatcher::failing(2),
        );
        registered_user(&fixture, "alice@example.com", AuthMethod::Email).await;
        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        fixture.flow.advance_at(&mut session, 2, now()).await;
        assert_eq!(session.ui_mode(), UiMode::Identification);
        assert_eq!(session.message_key(), Some("error_sending_code"));
    }

    #[tokio::test]
    async fn two_way_pin_method_requires_bypass_pin() {
        let mut registry = MethodRegistry::with_defaults();
        registry.register(Arc::new(ConfiguredMethod::new(
            AuthMethod::Email,
            MethodSettings {
                two_way: true,
                pin_required: true,
                ..MethodSettings::default()
            },
        )));
        let fixture = fixture(self_service_policy(), registry);
        let mut registration =
            registered_user(&fixture, "alice@example.com", AuthMethod::Email).await;
        registration.set_pin("4321");
        fixture.registrations.upsert(&registration).await.unwrap();

        let mut session = fixture
            .flow
            .initialize_at("alice@example.com", false, now())
            .await;
        fixture.flow.advance_at(&mut session, 2, now()).await;
        let code = fixture.dispatcher.last_code().unwrap();
        session.set_code(code);
        let outcome = fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(outcome, FlowOutcome::Continue);
        assert_eq!(session.ui_mode(), UiMode::Bypass);

        session.set_pin("0000");
        let outcome = fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(outcome, FlowOutcome::Continue);
        assert_eq!(session.message_key(), Some("error_invalid_pin"));

        session.set_pin("4321");
        let outcome = fixture.flow.advance_at(&mut session, SIGNAL_SUBMIT, now()).await;
        assert_eq!(outcome, FlowOutcome::Authenticated);
    }
}
