//! Registration input rules.

use regex::Regex;

use super::error::ValidationError;

pub const MIN_PASSWORD_CHARS: usize = 9;

/// Normalize an email for lookup and uniqueness checks.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Complexity rules, checked in order; the first violation is returned.
///
/// # Errors
/// Returns the first rule `password` breaks.
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(ValidationError::PasswordTooShort);
    }
    if !password.chars().any(char::is_lowercase) {
        return Err(ValidationError::PasswordMissingLowercase);
    }
    if !password.chars().any(char::is_uppercase) {
        return Err(ValidationError::PasswordMissingUppercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::PasswordMissingDigit);
    }
    Ok(())
}

/// Validate a registration form and return the normalized email.
///
/// # Errors
/// Returns the first failing rule: names, email, password, confirmation.
pub fn validate_registration(
    name: &str,
    surname: &str,
    email: &str,
    password: &str,
    password_confirm: &str,
) -> Result<String, ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if surname.trim().is_empty() {
        return Err(ValidationError::EmptySurname);
    }
    let email = normalize_email(email);
    if !valid_email(&email) {
        return Err(ValidationError::InvalidEmail);
    }
    validate_password(password)?;
    if password != password_confirm {
        return Err(ValidationError::PasswordMismatch);
    }
    Ok(email)
}

/// `@` followed by the local part of the address.
#[must_use]
pub fn username_base(email: &str) -> String {
    let local = email.split_once('@').map_or(email, |(local, _)| local);
    format!("@{local}")
}
