//! Local format validation for wizard inputs.
//!
//! Validation never touches persistent state; callers surface a message key
//! and keep the wizard position unchanged on failure.

use regex::Regex;

/// Normalize a UPN for lookup/uniqueness checks.
#[must_use]
pub fn normalize_upn(upn: &str) -> String {
    upn.trim().to_lowercase()
}

/// Basic mail address shape check on already-normalized input.
#[must_use]
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}

/// Accepts international (`+<country><number>`), bare 10-digit, or NANP
/// (`(123) 456-7890`) phone shapes and returns the number normalized to the
/// international form, using `default_country_code` for the bare shapes.
#[must_use]
pub fn normalize_phone(phone: &str, default_country_code: &str) -> Option<String> {
    let trimmed = phone.trim();
    if Regex::new(r"^\+[1-9]\d{6,14}$").is_ok_and(|re| re.is_match(trimmed)) {
        return Some(trimmed.to_string());
    }
    if Regex::new(r"^\d{10}$").is_ok_and(|re| re.is_match(trimmed)) {
        return Some(format!("{default_country_code}{trimmed}"));
    }
    if Regex::new(r"^\(\d{3}\)\s?\d{3}-\d{4}$").is_ok_and(|re| re.is_match(trimmed)) {
        let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
        return Some(format!("{default_country_code}{digits}"));
    }
    None
}

/// Four-digit PIN shape check.
#[must_use]
pub fn valid_pin(pin: &str) -> bool {
    Regex::new(r"^\d{4}$").is_ok_and(|re| re.is_match(pin.trim()))
}
