//! Account lockout policy.
//!
//! `Unlocked -> Locked -> Unlocked`: failures accumulate until the configured
//! maximum, which sets `locked_until`. The lock is evaluated lazily on every
//! attempt, so an elapsed lock needs no sweep. The counter is not reset when a
//! lock elapses: the next failure re-locks immediately, and only a successful
//! login clears the history.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::store::{CredentialStore, FailedLogin, LockoutState, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    Locked { remaining: Duration },
}

/// Result of recording one failed credential check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Counted { failed_attempts: i32 },
    /// This failure locked the account.
    Locked { remaining: Duration },
    /// A concurrent failure locked the account first; nothing was counted.
    AlreadyLocked { remaining: Duration },
}

pub struct LockoutPolicy {
    store: Arc<dyn CredentialStore>,
    max_attempts: u32,
    duration: Duration,
}

impl LockoutPolicy {
    pub fn new(store: Arc<dyn CredentialStore>, max_attempts: u32, duration: Duration) -> Self {
        Self {
            store,
            max_attempts,
            duration,
        }
    }

    fn threshold(&self) -> i32 {
        i32::try_from(self.max_attempts).unwrap_or(i32::MAX)
    }

    /// Locked iff the counter reached the maximum and the deadline is still
    /// in the future.
    #[must_use]
    pub fn is_locked(&self, state: &LockoutState, now: DateTime<Utc>) -> bool {
        state.failed_attempts >= self.threshold()
            && state.locked_until.is_some_and(|until| until > now)
    }

    #[must_use]
    pub fn status(&self, state: &LockoutState, now: DateTime<Utc>) -> LockStatus {
        match state.locked_until {
            Some(until) if self.is_locked(state, now) => LockStatus::Locked {
                remaining: until - now,
            },
            _ => LockStatus::Unlocked,
        }
    }

    /// Atomically count a failure, locking the account when the new count
    /// reaches the maximum. An account that is already locked keeps its
    /// counter and deadline.
    pub async fn record_failure(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, StoreError> {
        let recorded = self
            .store
            .record_failed_login(user_id, self.threshold(), now, now + self.duration)
            .await?;
        Ok(match recorded {
            FailedLogin::Counted(state) => match self.status(&state, now) {
                LockStatus::Locked { remaining } => FailureOutcome::Locked { remaining },
                LockStatus::Unlocked => FailureOutcome::Counted {
                    failed_attempts: state.failed_attempts,
                },
            },
            FailedLogin::AlreadyLocked(state) => match self.status(&state, now) {
                LockStatus::Locked { remaining } => FailureOutcome::AlreadyLocked { remaining },
                // Reset by a successful login in between.
                LockStatus::Unlocked => FailureOutcome::Counted {
                    failed_attempts: state.failed_attempts,
                },
            },
        })
    }

    /// Clear the failure history, whatever it was.
    pub async fn record_success(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.store.reset_failed_logins(user_id).await
    }
}
