//! Enrollment wizard sub-machine.
//!
//! One wizard run enrolls one target. `new_key` is invoked in exactly one
//! place, on the Collect→Provision transition; invoking it anywhere else
//! would invalidate a code already shown to the user. In strict forced
//! enrollment the cancel transition is absent from the table, not hidden.

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::config::MfaConfig;
use crate::error::MfaError;
use crate::keys::SecretKeyManager;
use crate::methods::MethodRegistry;
use crate::otp::{OobCodeIssuer, OobDispatcher, TotpEngine};
use crate::registration::store::RegistrationStore;
use crate::repo::bounded;
use crate::validate::{normalize_phone, valid_email, valid_pin};

use super::dispatch_with_retry;
use super::session::AuthenticationSession;
use super::state::{
    EnrollTarget, FlowOutcome, UiMode, WizardPage, SIGNAL_BACK, SIGNAL_CANCEL, SIGNAL_SUBMIT,
};

const SIGNAL_RESTART: u8 = 3;

pub(crate) struct EnrollmentWizard {
    registry: MethodRegistry,
    keys: Arc<dyn SecretKeyManager>,
    registrations: Arc<dyn RegistrationStore>,
    engine: TotpEngine,
    oob: OobCodeIssuer,
    dispatcher: Arc<dyn OobDispatcher>,
    default_country_code: String,
    timeout: Duration,
}

impl EnrollmentWizard {
    pub(crate) fn new(
        config: &MfaConfig,
        registry: MethodRegistry,
        keys: Arc<dyn SecretKeyManager>,
        registrations: Arc<dyn RegistrationStore>,
        engine: TotpEngine,
        oob: OobCodeIssuer,
        dispatcher: Arc<dyn OobDispatcher>,
    ) -> Self {
        Self {
            registry,
            keys,
            registrations,
            engine,
            oob,
            dispatcher,
            default_country_code: config.default_country_code().to_string(),
            timeout: config.repository_timeout(),
        }
    }

    /// Strict forced enrollment for this target's method.
    fn strict(&self, target: EnrollTarget) -> bool {
        target
            .method()
            .and_then(|method| self.registry.get(method).cloned())
            .is_some_and(|provider| provider.force_enrollment())
    }

    fn pin_required(&self, target: EnrollTarget) -> bool {
        target
            .method()
            .and_then(|method| self.registry.get(method).cloned())
            .is_some_and(|provider| provider.pin_required())
    }

    pub(crate) async fn advance(
        &self,
        session: &mut AuthenticationSession,
        target: EnrollTarget,
        and_save: bool,
        signal: u8,
        now: DateTime<Utc>,
    ) -> Result<FlowOutcome, MfaError> {
        session.clear_message();
        let strict = self.strict(target);
        match (session.wizard_page(), signal) {
            (WizardPage::Collect, SIGNAL_SUBMIT) => {
                if self.collect_is_valid(session, target) {
                    self.enter_provision(session, target, now).await?;
                }
                Ok(FlowOutcome::Continue)
            }
            (WizardPage::Provision, SIGNAL_SUBMIT) => {
                session.set_wizard_page(WizardPage::Verify);
                Ok(FlowOutcome::Continue)
            }
            (WizardPage::Provision, SIGNAL_BACK) => {
                session.set_wizard_page(WizardPage::Collect);
                session.set_provisioning_url(None);
                Ok(FlowOutcome::Continue)
            }
            (WizardPage::Verify, SIGNAL_SUBMIT) => {
                if self.verify_submission(session, target, now).await? {
                    if self.pin_required(target)
                        && target != EnrollTarget::Pin
                        && session.registration().pin_hash.is_none()
                    {
                        // Method mandates a PIN the user has not set yet.
                        session.set_wizard_page(WizardPage::Pin);
                    } else {
                        self.commit_enrollment(session, target).await?;
                        session.set_wizard_page(WizardPage::Success);
                    }
                } else {
                    session.set_wizard_page(WizardPage::Failure);
                    session.set_message("error_invalid_code");
                }
                Ok(FlowOutcome::Continue)
            }
            (WizardPage::Pin, SIGNAL_SUBMIT) => {
                let pin = session.pin_input().map(|pin| pin.trim().to_string());
                match pin {
                    Some(pin) if valid_pin(&pin) => {
                        session.collected_pin = Some(pin);
                        self.commit_enrollment(session, target).await?;
                        session.set_wizard_page(WizardPage::Success);
                    }
                    _ => session.set_message("error_invalid_pin"),
                }
                Ok(FlowOutcome::Continue)
            }
            (WizardPage::Success, SIGNAL_SUBMIT) => {
                // AndSave wizards complete the registration exchange and move
                // on to sign-in; plain wizards return to their origin state.
                let next = if and_save {
                    session.set_target_ui_mode(None);
                    UiMode::Identification
                } else {
                    session
                        .take_target_ui_mode()
                        .unwrap_or(UiMode::Identification)
                };
                session.clear_inputs();
                session.set_ui_mode(next);
                session.set_wizard_page(WizardPage::Collect);
                Ok(FlowOutcome::Continue)
            }
            (WizardPage::Failure, SIGNAL_SUBMIT) => {
                // Retry verification with a freshly submitted code.
                session.set_wizard_page(WizardPage::Verify);
                Ok(FlowOutcome::Continue)
            }
            (WizardPage::Failure, SIGNAL_RESTART) => {
                session.clear_inputs();
                session.set_wizard_page(WizardPage::Collect);
                Ok(FlowOutcome::Continue)
            }
            (
                WizardPage::Collect
                | WizardPage::Provision
                | WizardPage::Verify
                | WizardPage::Pin
                | WizardPage::Failure,
                SIGNAL_CANCEL,
            ) if !strict => {
                self.exit_to_origin(session);
                Ok(FlowOutcome::Continue)
            }
            // Unknown signals, and cancel under strict forced enrollment:
            // no such transition.
            _ => Ok(FlowOutcome::Continue),
        }
    }

    fn collect_is_valid(&self, session: &mut AuthenticationSession, target: EnrollTarget) -> bool {
        match target {
            EnrollTarget::Email => {
                let email = session.email_input().map(|email| email.trim().to_lowercase());
                match email {
                    Some(email) if valid_email(&email) => {
                        session.set_email(email);
                        true
                    }
                    _ => {
                        session.set_message("error_invalid_email");
                        false
                    }
                }
            }
            EnrollTarget::Phone => {
                let phone = session
                    .phone_input()
                    .and_then(|phone| normalize_phone(phone, &self.default_country_code));
                match phone {
                    Some(normalized) => {
                        session.set_phone(normalized);
                        true
                    }
                    None => {
                        session.set_message("error_invalid_phone");
                        false
                    }
                }
            }
            EnrollTarget::Pin => {
                let pin = session.pin_input().map(|pin| pin.trim().to_string());
                match pin {
                    Some(pin) if valid_pin(&pin) => {
                        session.collected_pin = Some(pin);
                        true
                    }
                    _ => {
                        session.set_message("error_invalid_pin");
                        false
                    }
                }
            }
            EnrollTarget::Otp | EnrollTarget::Biometrics => true,
        }
    }

    /// Enter the Provision position. The single `new_key` call site.
    async fn enter_provision(
        &self,
        session: &mut AuthenticationSession,
        target: EnrollTarget,
        now: DateTime<Utc>,
    ) -> Result<(), MfaError> {
        let seed = match target {
            EnrollTarget::Pin => None,
            _ => Some(self.keys.new_key(session.upn()).await?),
        };
        session.set_wizard_page(WizardPage::Provision);

        match target {
            EnrollTarget::Otp => {
                let url = match seed.as_ref() {
                    Some(seed) => self.engine.provisioning_url(seed, session.upn())?,
                    None => return Err(MfaError::MalformedKey),
                };
                session.set_provisioning_url(Some(url));
            }
            EnrollTarget::Email | EnrollTarget::Phone | EnrollTarget::Biometrics => {
                let destination = match target {
                    EnrollTarget::Email => session.email_input().map(str::to_string),
                    EnrollTarget::Phone => session.phone_input().map(str::to_string),
                    _ => None,
                };
                let code = self.oob.issue(session.upn(), now)?;
                let sent = dispatch_with_retry(
                    &self.dispatcher,
                    session.upn(),
                    destination.as_deref(),
                    &code,
                )
                .await;
                if sent {
                    session.set_message("info_code_sent");
                } else {
                    session.set_message("error_sending_code");
                }
            }
            EnrollTarget::Pin => {}
        }
        Ok(())
    }

    async fn verify_submission(
        &self,
        session: &mut AuthenticationSession,
        target: EnrollTarget,
        now: DateTime<Utc>,
    ) -> Result<bool, MfaError> {
        let Some(code) = session.code_input().map(str::to_string) else {
            return Ok(false);
        };
        match target {
            EnrollTarget::Otp => {
                let Some(seed) = self.keys.get_user_key(session.upn()).await? else {
                    return Ok(false);
                };
                self.engine.verify(&seed, &code, now)
            }
            EnrollTarget::Email | EnrollTarget::Phone | EnrollTarget::Biometrics => {
                Ok(self.oob.verify_consume(session.upn(), &code, now))
            }
            EnrollTarget::Pin => Ok(session
                .collected_pin
                .as_deref()
                .is_some_and(|pin| pin == code.trim())),
        }
    }

    /// Commit the completed enrollment to the registration record. The
    /// session snapshot is refreshed only after the persist succeeds.
    async fn commit_enrollment(
        &self,
        session: &mut AuthenticationSession,
        target: EnrollTarget,
    ) -> Result<(), MfaError> {
        let mut registration = session.registration().clone();
        match target {
            EnrollTarget::Email => {
                registration.mail_address = session.email_input().map(str::to_string);
            }
            EnrollTarget::Phone => {
                registration.phone_number = session.phone_input().map(str::to_string);
            }
            EnrollTarget::Otp | EnrollTarget::Biometrics | EnrollTarget::Pin => {}
        }
        if let Some(pin) = session.collected_pin.as_deref() {
            registration.set_pin(pin);
        }
        if let Some(method) = target.method() {
            registration.preferred_method = method;
        }
        registration.enabled = true;
        registration.is_registered = true;

        bounded(self.timeout, self.registrations.upsert(&registration))
            .await
            .map_err(|err| MfaError::repository("MFA0104", err))?;

        info!(upn = %registration.upn, method = %registration.preferred_method, "enrollment committed");
        if let Some(method) = target.method() {
            session.set_active_method(method);
            let two_way = self
                .registry
                .get(method)
                .is_some_and(|provider| provider.two_way());
            session.set_two_way(two_way);
        }
        *session.registration_mut() = registration;
        Ok(())
    }

    fn exit_to_origin(&self, session: &mut AuthenticationSession) {
        let origin = session
            .take_target_ui_mode()
            .unwrap_or(UiMode::Identification);
        session.clear_inputs();
        session.set_wizard_page(WizardPage::Collect);
        session.set_ui_mode(origin);
    }
}
