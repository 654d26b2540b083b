//! Input checks for authentication forms.

use regex::Regex;

use super::password::MAX_PASSWORD_BYTES;

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 32;
const IDENTIFIER_MAX: usize = 254;

/// Normalize an email for lookup and uniqueness checks.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    email_normalized.len() <= IDENTIFIER_MAX
        && Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
            .is_ok_and(|regex| regex.is_match(email_normalized))
}

/// # Errors
/// A user-safe message describing the violated rule.
pub fn validate_username(username: &str) -> Result<(), String> {
    let length = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&length) {
        return Err(format!(
            "Username must be between {USERNAME_MIN} and {USERNAME_MAX} characters"
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err("Username may only contain letters, digits and underscores".to_string());
    }
    Ok(())
}

/// # Errors
/// A user-safe message describing the violated rule.
pub fn validate_password(password: &str, min_length: usize) -> Result<(), String> {
    if password.chars().count() < min_length {
        return Err(format!("Password must be at least {min_length} characters"));
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(format!("Password must be at most {MAX_PASSWORD_BYTES} bytes"));
    }
    let has_letter = password.chars().any(char::is_alphabetic);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_letter && has_digit) {
        return Err("Password must contain a letter and a digit".to_string());
    }
    Ok(())
}

/// Login identifiers (username or email) must be present and bounded.
#[must_use]
pub fn valid_identifier(identifier: &str) -> bool {
    let trimmed = identifier.trim();
    !trimmed.is_empty() && trimmed.len() <= IDENTIFIER_MAX
}
