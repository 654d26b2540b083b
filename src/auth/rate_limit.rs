//! Rate limiting primitives for auth flows.
//!
//! Counts attempts per `(client key, action)` in a fixed window. The counter
//! lives in the backing store and is updated with one atomic statement, so
//! concurrent requests from the same client are all counted. A limited client
//! waits out the current window; further attempts do not extend it.

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

use super::clock::Clock;
use crate::store::{RateLimitStore, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitAction {
    Login,
    Register,
    PasswordChange,
}

impl RateLimitAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
            Self::PasswordChange => "password_change",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: Duration },
}

/// Build the counter key: the client IP when known, otherwise the normalized
/// identifier being attempted.
#[must_use]
pub fn client_key(ip: Option<&str>, identifier: &str) -> String {
    match ip.map(str::trim).filter(|ip| !ip.is_empty()) {
        Some(ip) => format!("ip:{ip}"),
        None => format!("id:{}", identifier.trim().to_lowercase()),
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        ip: Option<&str>,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision, StoreError>;

    /// Drop windows that have fully elapsed. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

pub struct FixedWindowRateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    window: Duration,
}

impl FixedWindowRateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            max_attempts,
            window,
        }
    }
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn check(
        &self,
        ip: Option<&str>,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision, StoreError> {
        let now = self.clock.now();
        let key = client_key(ip, identifier);
        let window = self
            .store
            .hit_rate_limit(&key, action.as_str(), now, now - self.window)
            .await?;

        if window.attempts > i64::from(self.max_attempts) {
            let retry_after = (window.window_start + self.window - now).max(Duration::zero());
            return Ok(RateLimitDecision::Limited { retry_after });
        }
        Ok(RateLimitDecision::Allowed)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        self.store.purge_rate_limits(now - self.window).await
    }
}
