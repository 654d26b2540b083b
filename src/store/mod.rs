//! Storage contract consumed by the auth subsystem.
//!
//! All durable state (credentials, lockout counters, the session registry,
//! pre-auth CSRF tokens, rate-limit windows, roles and the security event
//! log) lives behind these traits. Implementations must provide the atomicity the auth components
//! rely on:
//!
//! - `record_failed_login` and `hit_rate_limit` are single atomic
//!   read-modify-write operations. `record_failed_login` never counts
//!   against an account that is already locked.
//! - `replace_user_session` evicts and inserts inside one transaction, so two
//!   concurrent logins for the same user cannot both keep a session.
//! - `rotate_session` removes the old identifier in the same transaction that
//!   inserts the new one.
//!
//! [`PgStore`] is the production implementation. [`MemoryStore`] keeps the
//! same semantics in process memory for tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::audit::SecurityEvent;
use crate::auth::types::User;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cryptographic primitive failed: {0}")]
    Crypto(String),
    #[error("failed to encode value: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("malformed permissions for role {role}: {reason}")]
    MalformedPermissions { role: String, reason: String },
    #[error("role {0} does not exist")]
    MissingRole(String),
}

/// Credentials and lockout counters for a single account.
#[derive(Clone, Debug)]
pub struct CredentialRecord {
    pub user: User,
    pub password_hash: String,
    pub lockout: LockoutState,
}

/// Persisted failure counter and lock deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockoutState {
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Outcome of [`CredentialStore::record_failed_login`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailedLogin {
    /// The counter was incremented; carries the new state.
    Counted(LockoutState),
    /// The account was already locked; carries the unchanged state.
    AlreadyLocked(LockoutState),
}

#[derive(Clone, Debug)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role_id: Uuid,
}

#[derive(Debug)]
pub enum InsertUserOutcome {
    Created(User),
    Conflict,
}

/// A row of the authoritative session registry. Only the token hash is
/// stored, never the raw token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_hash: Vec<u8>,
    pub user_id: Uuid,
    pub ip_hash: Vec<u8>,
    pub user_agent_hash: Vec<u8>,
    pub csrf_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub rotated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Counter state of a fixed rate-limit window after recording an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateWindow {
    pub attempts: i64,
    pub window_start: DateTime<Utc>,
}

/// Role row with its raw permission document. Parsing and validation happen
/// in the RBAC engine.
#[derive(Clone, Debug, PartialEq)]
pub struct RoleRecord {
    pub id: Uuid,
    pub name: String,
    pub permissions: serde_json::Value,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up an account by username, or by email (case-insensitive).
    async fn find_credentials(&self, identifier: &str)
        -> Result<Option<CredentialRecord>, StoreError>;

    async fn find_credentials_by_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<CredentialRecord>, StoreError>;

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    async fn insert_user(
        &self,
        user: NewUser,
        now: DateTime<Utc>,
    ) -> Result<InsertUserOutcome, StoreError>;

    async fn username_exists(&self, username: &str) -> Result<bool, StoreError>;

    async fn email_exists(&self, email: &str) -> Result<bool, StoreError>;

    async fn update_password_hash(&self, user_id: Uuid, hash: &str) -> Result<(), StoreError>;

    /// Atomically increment the failure counter unless the account is locked
    /// at `now` (count at `max_attempts` and `locked_until` in the future).
    /// When the new count reaches `max_attempts`, `locked_until` is set to
    /// `lock_until`. A locked account is left untouched.
    async fn record_failed_login(
        &self,
        user_id: Uuid,
        max_attempts: i32,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<FailedLogin, StoreError>;

    async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), StoreError>;

    async fn record_login(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn set_active(&self, user_id: Uuid, active: bool) -> Result<bool, StoreError>;

    async fn set_user_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Evict every session of `session.user_id` and insert `session`, in one
    /// transaction. Returns the number of evicted rows.
    async fn replace_user_session(&self, session: &SessionRecord) -> Result<u64, StoreError>;

    async fn find_session(&self, session_hash: &[u8]) -> Result<Option<SessionRecord>, StoreError>;

    async fn touch_session(&self, session_hash: &[u8], now: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn update_session_ip(&self, session_hash: &[u8], ip_hash: &[u8])
        -> Result<(), StoreError>;

    /// Move a session to a new identifier. The old row is gone before the
    /// call returns. Returns `false` if the old session no longer exists.
    async fn rotate_session(
        &self,
        old_hash: &[u8],
        new_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Bind `token` to the session unless one is already bound. Returns the
    /// token now bound, or `None` if the session does not exist.
    async fn bind_csrf_token(
        &self,
        session_hash: &[u8],
        token: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn delete_session(&self, session_hash: &[u8]) -> Result<bool, StoreError>;

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError>;

    async fn count_user_sessions(&self, user_id: Uuid) -> Result<i64, StoreError>;

    /// Remove sessions whose last activity is older than `idle_before`.
    async fn purge_idle_sessions(&self, idle_before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// CSRF tokens issued to callers that have no session yet. Only the token
/// hash is stored.
#[async_trait]
pub trait PreauthCsrfStore: Send + Sync {
    async fn insert_preauth_csrf(
        &self,
        token_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// `true` if the token exists and expires after `now`.
    async fn preauth_csrf_valid(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn delete_preauth_csrf(&self, token_hash: &[u8]) -> Result<bool, StoreError>;

    async fn purge_preauth_csrf(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically record one attempt for `(client_key, action)`. A window that
    /// started at or before `expired_before` restarts at `now` with one attempt.
    async fn hit_rate_limit(
        &self,
        client_key: &str,
        action: &str,
        now: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> Result<RateWindow, StoreError>;

    async fn purge_rate_limits(&self, expired_before: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn role_for_user(&self, user_id: Uuid) -> Result<Option<RoleRecord>, StoreError>;

    async fn find_role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, StoreError>;

    async fn list_roles(&self) -> Result<Vec<RoleRecord>, StoreError>;

    async fn update_role_permissions(
        &self,
        role_id: Uuid,
        permissions: &serde_json::Value,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SecurityEventStore: Send + Sync {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), StoreError>;

    /// Most recent events first.
    async fn recent_events(&self, limit: i64) -> Result<Vec<SecurityEvent>, StoreError>;
}

/// Everything the auth service needs from its backing store.
pub trait AuthStore:
    CredentialStore
    + SessionStore
    + PreauthCsrfStore
    + RateLimitStore
    + RoleStore
    + SecurityEventStore
{
}

impl<T> AuthStore for T where
    T: CredentialStore
        + SessionStore
        + PreauthCsrfStore
        + RateLimitStore
        + RoleStore
        + SecurityEventStore
{
}
