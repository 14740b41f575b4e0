use once_cell::sync::Lazy;
use regex::Regex;

/// Input validation for sign-up and password reset

// Compile regex patterns once at startup
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    // local@domain with at least one dot in the domain, no whitespace
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
        .expect("hardcoded email regex is invalid - fix source code")
});

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MIN_USERNAME_LENGTH: usize = 3;
pub const MAX_USERNAME_LENGTH: usize = 20;

/// Validate email shape
pub fn validate_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

/// Validate password length (at least 8 characters)
pub fn validate_password(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LENGTH
}

/// Validate username: not blank, 3-20 characters
pub fn validate_username(username: &str) -> bool {
    let length = username.chars().count();
    !username.trim().is_empty() && (MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&length)
}
