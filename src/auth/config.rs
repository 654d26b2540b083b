//! Auth policy configuration.

use chrono::Duration;

const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;
const DEFAULT_LOCKOUT_SECONDS: i64 = 15 * 60;
const DEFAULT_RATE_LIMIT_ATTEMPTS: u32 = 20;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: i64 = 15 * 60;
const DEFAULT_SESSION_TIMEOUT_SECONDS: i64 = 60 * 60;
const DEFAULT_SESSION_ROTATION_SECONDS: i64 = 30 * 60;
const DEFAULT_MIN_PASSWORD_LENGTH: usize = 8;
const DEFAULT_PREAUTH_CSRF_TTL_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid auth configuration: {0}")]
pub struct InvalidConfig(&'static str);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthConfig {
    max_login_attempts: u32,
    lockout_seconds: i64,
    rate_limit_attempts: u32,
    rate_limit_window_seconds: i64,
    session_timeout_seconds: i64,
    session_rotation_seconds: i64,
    min_password_length: usize,
    preauth_csrf_ttl_seconds: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            lockout_seconds: DEFAULT_LOCKOUT_SECONDS,
            rate_limit_attempts: DEFAULT_RATE_LIMIT_ATTEMPTS,
            rate_limit_window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            session_timeout_seconds: DEFAULT_SESSION_TIMEOUT_SECONDS,
            session_rotation_seconds: DEFAULT_SESSION_ROTATION_SECONDS,
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            preauth_csrf_ttl_seconds: DEFAULT_PREAUTH_CSRF_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_max_login_attempts(mut self, attempts: u32) -> Self {
        self.max_login_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_lockout_seconds(mut self, seconds: i64) -> Self {
        self.lockout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_rate_limit_attempts(mut self, attempts: u32) -> Self {
        self.rate_limit_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_rate_limit_window_seconds(mut self, seconds: i64) -> Self {
        self.rate_limit_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_timeout_seconds(mut self, seconds: i64) -> Self {
        self.session_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_rotation_seconds(mut self, seconds: i64) -> Self {
        self.session_rotation_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_min_password_length(mut self, length: usize) -> Self {
        self.min_password_length = length;
        self
    }

    #[must_use]
    pub fn with_preauth_csrf_ttl_seconds(mut self, seconds: i64) -> Self {
        self.preauth_csrf_ttl_seconds = seconds;
        self
    }

    /// Reject settings that would disable a defense outright.
    ///
    /// # Errors
    /// Returns [`InvalidConfig`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.max_login_attempts == 0 {
            return Err(InvalidConfig("max login attempts must be at least 1"));
        }
        if i32::try_from(self.max_login_attempts).is_err() {
            return Err(InvalidConfig("max login attempts is too large"));
        }
        if self.lockout_seconds <= 0 {
            return Err(InvalidConfig("lockout duration must be positive"));
        }
        if self.rate_limit_attempts == 0 {
            return Err(InvalidConfig("rate limit attempts must be at least 1"));
        }
        // The per-IP limiter must leave room for the lockout to trigger.
        if self.rate_limit_attempts <= self.max_login_attempts {
            return Err(InvalidConfig(
                "rate limit attempts must exceed max login attempts",
            ));
        }
        if self.rate_limit_window_seconds <= 0 {
            return Err(InvalidConfig("rate limit window must be positive"));
        }
        if self.session_timeout_seconds <= 0 {
            return Err(InvalidConfig("session timeout must be positive"));
        }
        if self.session_rotation_seconds <= 0 {
            return Err(InvalidConfig("session rotation interval must be positive"));
        }
        if self.min_password_length == 0 {
            return Err(InvalidConfig("minimum password length must be at least 1"));
        }
        if self.preauth_csrf_ttl_seconds <= 0 {
            return Err(InvalidConfig("pre-auth CSRF token lifetime must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub fn max_login_attempts(&self) -> u32 {
        self.max_login_attempts
    }

    #[must_use]
    pub fn lockout_duration(&self) -> Duration {
        Duration::seconds(self.lockout_seconds)
    }

    #[must_use]
    pub fn rate_limit_attempts(&self) -> u32 {
        self.rate_limit_attempts
    }

    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::seconds(self.rate_limit_window_seconds)
    }

    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::seconds(self.session_timeout_seconds)
    }

    #[must_use]
    pub fn session_rotation_interval(&self) -> Duration {
        Duration::seconds(self.session_rotation_seconds)
    }

    #[must_use]
    pub fn min_password_length(&self) -> usize {
        self.min_password_length
    }

    #[must_use]
    pub fn preauth_csrf_ttl(&self) -> Duration {
        Duration::seconds(self.preauth_csrf_ttl_seconds)
    }
}
