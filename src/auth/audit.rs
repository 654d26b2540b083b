//! Append-only security event log.
//!
//! Events are written to the backing store for audit and mirrored to
//! `tracing` under the `gatehouse::security` target. Recording never fails
//! the caller: a store outage is logged and the primary decision stands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::clock::Clock;
use crate::store::{SecurityEventStore, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    Login,
    LoginFailed,
    /// Attempt against an account that is currently locked.
    LoginLocked,
    AccountLocked,
    RateLimited,
    Logout,
    SessionHijackAttempt,
    SessionIpChange,
    CsrfTokenInvalid,
    AccessDenied,
    RoleChange,
    PasswordChanged,
    PasswordRehashed,
    Registration,
    AccountDeactivated,
}

impl SecurityEventKind {
    pub const ALL: [Self; 15] = [
        Self::Login,
        Self::LoginFailed,
        Self::LoginLocked,
        Self::AccountLocked,
        Self::RateLimited,
        Self::Logout,
        Self::SessionHijackAttempt,
        Self::SessionIpChange,
        Self::CsrfTokenInvalid,
        Self::AccessDenied,
        Self::RoleChange,
        Self::PasswordChanged,
        Self::PasswordRehashed,
        Self::Registration,
        Self::AccountDeactivated,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::LoginFailed => "login_failed",
            Self::LoginLocked => "login_locked",
            Self::AccountLocked => "account_locked",
            Self::RateLimited => "rate_limited",
            Self::Logout => "logout",
            Self::SessionHijackAttempt => "session_hijack_attempt",
            Self::SessionIpChange => "session_ip_change",
            Self::CsrfTokenInvalid => "csrf_token_invalid",
            Self::AccessDenied => "access_denied",
            Self::RoleChange => "role_change",
            Self::PasswordChanged => "password_changed",
            Self::PasswordRehashed => "password_rehashed",
            Self::Registration => "registration",
            Self::AccountDeactivated => "account_deactivated",
        }
    }

    /// Events that indicate an attack or a blocked request.
    #[must_use]
    pub const fn is_alert(self) -> bool {
        matches!(
            self,
            Self::LoginFailed
                | Self::LoginLocked
                | Self::AccountLocked
                | Self::RateLimited
                | Self::SessionHijackAttempt
                | Self::CsrfTokenInvalid
                | Self::AccessDenied
        )
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown security event kind")]
pub struct UnknownEventKind;

impl FromStr for SecurityEventKind {
    type Err = UnknownEventKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or(UnknownEventKind)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub actor: Option<Uuid>,
    pub context: Value,
    pub occurred_at: DateTime<Utc>,
}

/// Tracing target of every security event line.
pub const SECURITY_TARGET: &str = "gatehouse::security";

#[derive(Clone)]
pub struct SecurityLog {
    store: Arc<dyn SecurityEventStore>,
    clock: Arc<dyn Clock>,
}

impl SecurityLog {
    pub fn new(store: Arc<dyn SecurityEventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn record(&self, kind: SecurityEventKind, actor: Option<Uuid>, context: Value) {
        let event = SecurityEvent {
            kind,
            actor,
            context,
            occurred_at: self.clock.now(),
        };

        let actor_display = event.actor.map(|id| id.to_string());
        if kind.is_alert() {
            warn!(
                target: SECURITY_TARGET,
                event = %kind,
                actor = actor_display.as_deref().unwrap_or("-"),
                context = %event.context,
                "security event"
            );
        } else {
            info!(
                target: SECURITY_TARGET,
                event = %kind,
                actor = actor_display.as_deref().unwrap_or("-"),
                context = %event.context,
                "security event"
            );
        }

        if let Err(err) = self.store.append_event(&event).await {
            error!("Failed to persist security event {kind}: {err}");
        }
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<SecurityEvent>, StoreError> {
        self.store.recent_events(limit).await
    }
}
