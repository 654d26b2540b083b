//! Session lifecycle: create, validate, touch, rotate, destroy.
//!
//! The registry row is authoritative; the client only ever holds the raw
//! token and the store only ever sees its SHA-256 hash.
//!
//! Integrity markers are hashes of the client IP and user agent. Both are
//! client-supplied, so they are tamper evidence and nothing more, and they are
//! handled asymmetrically:
//!
//! - a user-agent change is a hard failure: the session is destroyed and a
//!   `session_hijack_attempt` event is recorded;
//! - an IP change is expected (mobile networks, NAT) and only updates the
//!   stored hash and records `session_ip_change`.

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    audit::{SecurityEventKind, SecurityLog},
    clock::Clock,
    types::ClientContext,
    utils::{constant_time_eq, fingerprint, generate_token, hash_token},
};
use crate::store::{SessionRecord, SessionStore, StoreError};

/// A session that passed validation for the current request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveSession {
    pub user_id: Uuid,
    /// Token the client must use from now on. Differs from the presented one
    /// when the session was rotated during validation.
    pub token: String,
    pub rotated: bool,
    pub csrf_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCheck {
    Valid(ActiveSession),
    /// Unknown or already destroyed token.
    Missing,
    Expired,
    /// User agent changed; the session has been destroyed.
    IntegrityViolation,
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    audit: SecurityLog,
    timeout: Duration,
    rotation_interval: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        audit: SecurityLog,
        timeout: Duration,
        rotation_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            timeout,
            rotation_interval,
        }
    }

    /// Start a session for `user_id`, evicting any session the user already
    /// holds, and record a `login` event. Always issues a fresh identifier,
    /// so a pre-login identifier can never be fixated.
    pub async fn create(&self, user_id: Uuid, client: &ClientContext) -> Result<String, StoreError> {
        let (token, evicted) = self.establish(user_id, client).await?;
        self.audit
            .record(
                SecurityEventKind::Login,
                Some(user_id),
                json!({ "ip": client.ip, "evicted_sessions": evicted }),
            )
            .await;
        Ok(token)
    }

    /// Replace the user's session with a brand new one (new identifier, no
    /// CSRF token) without recording a login.
    pub async fn regenerate(
        &self,
        user_id: Uuid,
        client: &ClientContext,
    ) -> Result<String, StoreError> {
        let (token, _) = self.establish(user_id, client).await?;
        Ok(token)
    }

    async fn establish(
        &self,
        user_id: Uuid,
        client: &ClientContext,
    ) -> Result<(String, u64), StoreError> {
        let token = generate_token()?;
        let now = self.clock.now();
        let record = SessionRecord {
            session_hash: hash_token(&token),
            user_id,
            ip_hash: fingerprint(client.ip.as_deref()),
            user_agent_hash: fingerprint(client.user_agent.as_deref()),
            csrf_token: None,
            created_at: now,
            rotated_at: now,
            last_activity_at: now,
        };
        let evicted = self.store.replace_user_session(&record).await?;
        if evicted > 0 {
            debug!(%user_id, evicted, "Evicted previous sessions");
        }
        Ok((token, evicted))
    }

    /// Check a presented token against the registry and the current client
    /// fingerprint. A valid session is touched and, once the rotation
    /// interval has passed, moved to a new identifier.
    pub async fn validate(
        &self,
        token: &str,
        client: &ClientContext,
    ) -> Result<SessionCheck, StoreError> {
        let session_hash = hash_token(token);
        let Some(record) = self.store.find_session(&session_hash).await? else {
            return Ok(SessionCheck::Missing);
        };
        let now = self.clock.now();

        if now - record.last_activity_at > self.timeout {
            self.store.delete_session(&session_hash).await?;
            debug!(user_id = %record.user_id, "Session expired");
            return Ok(SessionCheck::Expired);
        }

        let user_agent_hash = fingerprint(client.user_agent.as_deref());
        if !constant_time_eq(&record.user_agent_hash, &user_agent_hash) {
            self.store.delete_session(&session_hash).await?;
            self.audit
                .record(
                    SecurityEventKind::SessionHijackAttempt,
                    Some(record.user_id),
                    json!({ "ip": client.ip, "user_agent": client.user_agent }),
                )
                .await;
            return Ok(SessionCheck::IntegrityViolation);
        }

        let ip_hash = fingerprint(client.ip.as_deref());
        if !constant_time_eq(&record.ip_hash, &ip_hash) {
            self.store.update_session_ip(&session_hash, &ip_hash).await?;
            self.audit
                .record(
                    SecurityEventKind::SessionIpChange,
                    Some(record.user_id),
                    json!({ "ip": client.ip }),
                )
                .await;
        }

        self.store.touch_session(&session_hash, now).await?;

        let mut active = ActiveSession {
            user_id: record.user_id,
            token: token.to_string(),
            rotated: false,
            csrf_token: record.csrf_token,
        };
        if now - record.rotated_at >= self.rotation_interval {
            if let Some(new_token) = self.rotate(token).await? {
                info!(user_id = %record.user_id, "Rotated session identifier");
                active.token = new_token;
                active.rotated = true;
            }
        }
        Ok(SessionCheck::Valid(active))
    }

    /// Refresh the last-activity timestamp.
    pub async fn touch(&self, token: &str) -> Result<(), StoreError> {
        self.store
            .touch_session(&hash_token(token), self.clock.now())
            .await
    }

    /// Move the session to a new identifier. The old identifier stops
    /// validating before the new one is returned. The CSRF token carries over.
    /// Returns `None` when the session no longer exists.
    pub async fn rotate(&self, token: &str) -> Result<Option<String>, StoreError> {
        let new_token = generate_token()?;
        let rotated = self
            .store
            .rotate_session(&hash_token(token), &hash_token(&new_token), self.clock.now())
            .await?;
        Ok(rotated.then_some(new_token))
    }

    /// Remove the session. Destroying an unknown session is not an error.
    pub async fn destroy(&self, token: &str) -> Result<bool, StoreError> {
        self.store.delete_session(&hash_token(token)).await
    }

    /// User holding the session, if it exists. Performs no integrity checks.
    pub async fn owner(&self, token: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .store
            .find_session(&hash_token(token))
            .await?
            .map(|record| record.user_id))
    }

    pub async fn destroy_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        self.store.delete_user_sessions(user_id).await
    }

    /// Delete every session idle for longer than the timeout.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store
            .purge_idle_sessions(self.clock.now() - self.timeout)
            .await
    }
}
