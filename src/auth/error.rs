//! The single error type crossing the auth subsystem boundary.

use chrono::Duration;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked for another {}s", .remaining.num_seconds())]
    AccountLocked { remaining: Duration },
    #[error("too many attempts")]
    RateLimited { retry_after: Duration },
    #[error("session expired")]
    SessionExpired,
    #[error("session invalid")]
    SessionInvalid,
    #[error("invalid csrf token")]
    CsrfInvalid,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Registration conflict. Deliberately does not say which field collided.
    #[error("registration unavailable")]
    Unavailable,
    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] StoreError),
}

impl AuthError {
    /// Message safe to show to the end user. Never names the failing sub-check.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Invalid username or password",
            Self::AccountLocked { .. } => "Account temporarily locked",
            Self::RateLimited { .. } => "Too many attempts, try again later",
            Self::SessionExpired | Self::SessionInvalid => "Authentication required",
            Self::CsrfInvalid | Self::PermissionDenied => "Forbidden",
            Self::InvalidInput(_) => "Invalid request",
            Self::Unavailable => "Registration unavailable",
            Self::Infrastructure(_) => "Service unavailable",
        }
    }

    /// Whole seconds a client should wait before retrying, rounded up.
    #[must_use]
    pub fn retry_after_seconds(&self) -> Option<i64> {
        let wait = match self {
            Self::AccountLocked { remaining } => *remaining,
            Self::RateLimited { retry_after } => *retry_after,
            _ => return None,
        };
        let seconds = wait.num_seconds();
        let rounded = if wait > Duration::seconds(seconds) {
            seconds + 1
        } else {
            seconds
        };
        Some(rounded.max(1))
    }
}
