//! In-process implementation of the storage contract.
//!
//! Every operation takes a single lock over the whole state, which gives the
//! same atomicity the Postgres store gets from single statements and
//! transactions. State is lost on restart; use it for tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CredentialRecord, CredentialStore, FailedLogin, InsertUserOutcome, LockoutState, NewUser,
    PreauthCsrfStore, RateLimitStore, RateWindow, RoleRecord, RoleStore, SecurityEventStore,
    SessionRecord, SessionStore, StoreError,
};
use crate::auth::audit::SecurityEvent;
use crate::auth::rbac::default_roles;
use crate::auth::types::User;

#[derive(Clone, Debug)]
struct StoredUser {
    user: User,
    password_hash: String,
    lockout: LockoutState,
}

impl StoredUser {
    fn credentials(&self) -> CredentialRecord {
        CredentialRecord {
            user: self.user.clone(),
            password_hash: self.password_hash.clone(),
            lockout: self.lockout,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<Uuid, StoredUser>,
    sessions: HashMap<Vec<u8>, SessionRecord>,
    preauth_csrf: HashMap<Vec<u8>, DateTime<Utc>>,
    rate_limits: HashMap<(String, String), RateWindow>,
    roles: HashMap<Uuid, RoleRecord>,
    events: Vec<SecurityEvent>,
}

impl State {
    fn user_by_identifier(&self, identifier: &str) -> Option<&StoredUser> {
        let lowered = identifier.trim().to_lowercase();
        self.users.values().find(|stored| {
            stored.user.username.to_lowercase() == lowered || stored.user.email == lowered
        })
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// A store seeded with the built-in `admin`, `editor` and `user` roles.
    #[must_use]
    pub fn new() -> Self {
        let mut state = State::default();
        for (name, permissions) in default_roles() {
            let id = Uuid::new_v4();
            state.roles.insert(
                id,
                RoleRecord {
                    id,
                    name: name.to_string(),
                    permissions,
                },
            );
        }
        Self {
            state: Mutex::new(state),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a backing-store outage: every call fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_credentials(
        &self,
        identifier: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.user_by_identifier(identifier).map(StoredUser::credentials))
    }

    async fn find_credentials_by_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.users.get(&user_id).map(StoredUser::credentials))
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.users.get(&user_id).map(|stored| stored.user.clone()))
    }

    async fn insert_user(
        &self,
        user: NewUser,
        now: DateTime<Utc>,
    ) -> Result<InsertUserOutcome, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let username = user.username.to_lowercase();
        let email = user.email.to_lowercase();
        let taken = state.users.values().any(|stored| {
            stored.user.username.to_lowercase() == username || stored.user.email == email
        });
        if taken {
            return Ok(InsertUserOutcome::Conflict);
        }

        let created = User {
            id: Uuid::new_v4(),
            username: user.username,
            email,
            role_id: user.role_id,
            active: true,
            last_login_at: None,
            created_at: now,
        };
        state.users.insert(
            created.id,
            StoredUser {
                user: created.clone(),
                password_hash: user.password_hash,
                lockout: LockoutState::default(),
            },
        );
        Ok(InsertUserOutcome::Created(created))
    }

    async fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let lowered = username.to_lowercase();
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .any(|stored| stored.user.username.to_lowercase() == lowered))
    }

    async fn email_exists(&self, email: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let lowered = email.to_lowercase();
        let state = self.state.lock().await;
        Ok(state.users.values().any(|stored| stored.user.email == lowered))
    }

    async fn update_password_hash(&self, user_id: Uuid, hash: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(stored) = state.users.get_mut(&user_id) {
            stored.password_hash = hash.to_string();
        }
        Ok(())
    }

    async fn record_failed_login(
        &self,
        user_id: Uuid,
        max_attempts: i32,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<FailedLogin, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(stored) = state.users.get_mut(&user_id) else {
            return Err(StoreError::Database(sqlx::Error::RowNotFound));
        };
        let locked = stored.lockout.failed_attempts >= max_attempts
            && stored.lockout.locked_until.is_some_and(|until| until > now);
        if locked {
            return Ok(FailedLogin::AlreadyLocked(stored.lockout));
        }
        stored.lockout.failed_attempts = stored.lockout.failed_attempts.saturating_add(1);
        if stored.lockout.failed_attempts >= max_attempts {
            stored.lockout.locked_until = Some(lock_until);
        }
        Ok(FailedLogin::Counted(stored.lockout))
    }

    async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(stored) = state.users.get_mut(&user_id) {
            stored.lockout = LockoutState::default();
        }
        Ok(())
    }

    async fn record_login(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(stored) = state.users.get_mut(&user_id) {
            stored.user.last_login_at = Some(now);
        }
        Ok(())
    }

    async fn set_active(&self, user_id: Uuid, active: bool) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state.users.get_mut(&user_id).map_or(false, |stored| {
            stored.user.active = active;
            true
        }))
    }

    async fn set_user_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !state.roles.contains_key(&role_id) {
            return Ok(false);
        }
        Ok(state.users.get_mut(&user_id).map_or(false, |stored| {
            stored.user.role_id = role_id;
            true
        }))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn replace_user_session(&self, session: &SessionRecord) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, existing| existing.user_id != session.user_id);
        let evicted = (before - state.sessions.len()) as u64;
        state
            .sessions
            .insert(session.session_hash.clone(), session.clone());
        Ok(evicted)
    }

    async fn find_session(&self, session_hash: &[u8]) -> Result<Option<SessionRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.sessions.get(session_hash).cloned())
    }

    async fn touch_session(
        &self,
        session_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(session_hash) {
            session.last_activity_at = now;
        }
        Ok(())
    }

    async fn update_session_ip(
        &self,
        session_hash: &[u8],
        ip_hash: &[u8],
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(session_hash) {
            session.ip_hash = ip_hash.to_vec();
        }
        Ok(())
    }

    async fn rotate_session(
        &self,
        old_hash: &[u8],
        new_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(mut session) = state.sessions.remove(old_hash) else {
            return Ok(false);
        };
        session.session_hash = new_hash.to_vec();
        session.rotated_at = now;
        session.last_activity_at = now;
        state.sessions.insert(new_hash.to_vec(), session);
        Ok(true)
    }

    async fn bind_csrf_token(
        &self,
        session_hash: &[u8],
        token: &str,
    ) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state.sessions.get_mut(session_hash).map(|session| {
            session
                .csrf_token
                .get_or_insert_with(|| token.to_string())
                .clone()
        }))
    }

    async fn delete_session(&self, session_hash: &[u8]) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state.sessions.remove(session_hash).is_some())
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, session| session.user_id != user_id);
        Ok((before - state.sessions.len()) as u64)
    }

    async fn count_user_sessions(&self, user_id: Uuid) -> Result<i64, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let count = state
            .sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn purge_idle_sessions(&self, idle_before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, session| session.last_activity_at >= idle_before);
        Ok((before - state.sessions.len()) as u64)
    }
}

#[async_trait]
impl PreauthCsrfStore for MemoryStore {
    async fn insert_preauth_csrf(
        &self,
        token_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.preauth_csrf.insert(token_hash.to_vec(), expires_at);
        Ok(())
    }

    async fn preauth_csrf_valid(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .preauth_csrf
            .get(token_hash)
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn delete_preauth_csrf(&self, token_hash: &[u8]) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state.preauth_csrf.remove(token_hash).is_some())
    }

    async fn purge_preauth_csrf(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let before = state.preauth_csrf.len();
        state.preauth_csrf.retain(|_, expires_at| *expires_at > now);
        Ok((before - state.preauth_csrf.len()) as u64)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn hit_rate_limit(
        &self,
        client_key: &str,
        action: &str,
        now: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> Result<RateWindow, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let window = state
            .rate_limits
            .entry((client_key.to_string(), action.to_string()))
            .or_insert(RateWindow {
                attempts: 0,
                window_start: now,
            });
        if window.window_start <= expired_before {
            window.attempts = 0;
            window.window_start = now;
        }
        window.attempts = window.attempts.saturating_add(1);
        Ok(*window)
    }

    async fn purge_rate_limits(&self, expired_before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let before = state.rate_limits.len();
        state
            .rate_limits
            .retain(|_, window| window.window_start > expired_before);
        Ok((before - state.rate_limits.len()) as u64)
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn role_for_user(&self, user_id: Uuid) -> Result<Option<RoleRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .users
            .get(&user_id)
            .and_then(|stored| state.roles.get(&stored.user.role_id))
            .cloned())
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.roles.values().find(|role| role.name == name).cloned())
    }

    async fn list_roles(&self) -> Result<Vec<RoleRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut roles: Vec<RoleRecord> = state.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn update_role_permissions(
        &self,
        role_id: Uuid,
        permissions: &Value,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state.roles.get_mut(&role_id).map_or(false, |role| {
            role.permissions = permissions.clone();
            true
        }))
    }
}

#[async_trait]
impl SecurityEventStore for MemoryStore {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.events.push(event.clone());
        Ok(())
    }

    async fn recent_events(&self, limit: i64) -> Result<Vec<SecurityEvent>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state.events.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use chrono::Duration;

    fn new_user(username: &str, role_id: Uuid) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password_hash: "hash".to_string(),
            role_id,
        }
    }

    fn session(user_id: Uuid, hash: &[u8], now: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_hash: hash.to_vec(),
            user_id,
            ip_hash: vec![1],
            user_agent_hash: vec![2],
            csrf_token: None,
            created_at: now,
            rotated_at: now,
            last_activity_at: now,
        }
    }

    async fn user_role(store: &MemoryStore) -> Result<Uuid> {
        store
            .find_role_by_name("user")
            .await?
            .map(|role| role.id)
            .ok_or_else(|| anyhow!("default user role missing"))
    }

    #[tokio::test]
    async fn seeds_default_roles() -> Result<()> {
        let store = MemoryStore::new();
        let names: Vec<String> = store
            .list_roles()
            .await?
            .into_iter()
            .map(|role| role.name)
            .collect();
        assert_eq!(names, vec!["admin", "editor", "user"]);
        Ok(())
    }

    #[tokio::test]
    async fn insert_user_rejects_case_insensitive_duplicates() -> Result<()> {
        let store = MemoryStore::new();
        let role_id = user_role(&store).await?;
        let now = Utc::now();

        let first = store.insert_user(new_user("alice", role_id), now).await?;
        assert!(matches!(first, InsertUserOutcome::Created(_)));

        let second = store.insert_user(new_user("ALICE", role_id), now).await?;
        assert!(matches!(second, InsertUserOutcome::Conflict));

        assert!(store.username_exists("Alice").await?);
        assert!(store.email_exists("ALICE@example.com").await?);
        assert!(store.find_credentials("alice@EXAMPLE.com").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn failed_logins_lock_at_threshold() -> Result<()> {
        let store = MemoryStore::new();
        let role_id = user_role(&store).await?;
        let now = Utc::now();
        let InsertUserOutcome::Created(user) =
            store.insert_user(new_user("bob", role_id), now).await?
        else {
            return Err(anyhow!("user not created"));
        };

        let deadline = now + Duration::minutes(15);
        for expected in 1..3 {
            let FailedLogin::Counted(state) =
                store.record_failed_login(user.id, 3, now, deadline).await?
            else {
                return Err(anyhow!("failure {expected} not counted"));
            };
            assert_eq!(state.failed_attempts, expected);
            assert_eq!(state.locked_until, None);
        }
        let locking = store.record_failed_login(user.id, 3, now, deadline).await?;
        let locked_state = LockoutState {
            failed_attempts: 3,
            locked_until: Some(deadline),
        };
        assert_eq!(locking, FailedLogin::Counted(locked_state));

        // Further failures while locked neither count nor move the deadline.
        let later = now + Duration::minutes(5);
        for _ in 0..3 {
            let outcome = store
                .record_failed_login(user.id, 3, later, later + Duration::minutes(15))
                .await?;
            assert_eq!(outcome, FailedLogin::AlreadyLocked(locked_state));
        }

        store.reset_failed_logins(user.id).await?;
        let record = store.find_credentials_by_id(user.id).await?;
        assert_eq!(record.map(|r| r.lockout), Some(LockoutState::default()));
        Ok(())
    }

    #[tokio::test]
    async fn replace_user_session_keeps_one_row() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let other_user = Uuid::new_v4();
        let now = Utc::now();

        assert_eq!(store.replace_user_session(&session(user_id, b"a", now)).await?, 0);
        assert_eq!(store.replace_user_session(&session(other_user, b"x", now)).await?, 0);
        assert_eq!(store.replace_user_session(&session(user_id, b"b", now)).await?, 1);

        assert_eq!(store.count_user_sessions(user_id).await?, 1);
        assert!(store.find_session(b"a").await?.is_none());
        assert!(store.find_session(b"b").await?.is_some());
        assert!(store.find_session(b"x").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn rotate_session_moves_row() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        store.replace_user_session(&session(user_id, b"old", now)).await?;
        store.bind_csrf_token(b"old", "csrf").await?;

        let later = now + Duration::minutes(1);
        assert!(store.rotate_session(b"old", b"new", later).await?);
        assert!(store.find_session(b"old").await?.is_none());
        let rotated = store.find_session(b"new").await?;
        assert_eq!(rotated.as_ref().map(|s| s.rotated_at), Some(later));
        assert_eq!(
            rotated.and_then(|s| s.csrf_token),
            Some("csrf".to_string())
        );

        assert!(!store.rotate_session(b"old", b"newer", later).await?);
        Ok(())
    }

    #[tokio::test]
    async fn bind_csrf_token_keeps_first_token() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .replace_user_session(&session(Uuid::new_v4(), b"s", now))
            .await?;

        assert_eq!(
            store.bind_csrf_token(b"s", "first").await?,
            Some("first".to_string())
        );
        assert_eq!(
            store.bind_csrf_token(b"s", "second").await?,
            Some("first".to_string())
        );
        assert_eq!(store.bind_csrf_token(b"missing", "x").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn rate_window_restarts_after_expiry() -> Result<()> {
        let store = MemoryStore::new();
        let start = Utc::now();
        let window = Duration::minutes(15);

        for expected in 1..=3 {
            let hit = store
                .hit_rate_limit("ip:1.2.3.4", "login", start, start - window)
                .await?;
            assert_eq!(hit.attempts, expected);
            assert_eq!(hit.window_start, start);
        }

        let later = start + window;
        let hit = store
            .hit_rate_limit("ip:1.2.3.4", "login", later, later - window)
            .await?;
        assert_eq!(hit.attempts, 1);
        assert_eq!(hit.window_start, later);
        Ok(())
    }

    #[tokio::test]
    async fn preauth_csrf_tokens_expire() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_preauth_csrf(b"fresh", now + Duration::hours(1))
            .await?;
        store.insert_preauth_csrf(b"stale", now).await?;

        assert!(store.preauth_csrf_valid(b"fresh", now).await?);
        assert!(!store.preauth_csrf_valid(b"stale", now).await?);
        assert!(!store.preauth_csrf_valid(b"missing", now).await?);

        assert_eq!(store.purge_preauth_csrf(now).await?, 1);
        assert!(store.delete_preauth_csrf(b"fresh").await?);
        assert!(!store.preauth_csrf_valid(b"fresh", now).await?);
        Ok(())
    }

    #[tokio::test]
    async fn purge_idle_sessions_removes_stale_rows() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .replace_user_session(&session(Uuid::new_v4(), b"stale", now - Duration::hours(2)))
            .await?;
        store
            .replace_user_session(&session(Uuid::new_v4(), b"fresh", now))
            .await?;

        assert_eq!(store.purge_idle_sessions(now - Duration::hours(1)).await?, 1);
        assert!(store.find_session(b"fresh").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.find_credentials("alice").await.is_err());
        assert!(store.list_roles().await.is_err());
        store.set_unavailable(false);
        assert!(store.list_roles().await.is_ok());
    }
}
