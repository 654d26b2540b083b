//! Authentication, session integrity and authorization.
//!
//! [`AuthService`] is the entry point collaborators use. An authentication
//! attempt flows through the rate limiter, the lockout policy, the credential
//! store and the password hasher, and on success into the session manager.
//! Every outcome is recorded in the security event log. Later requests are
//! resolved through the session manager and, for protected actions, the RBAC
//! engine, with CSRF verification guarding state changes.
//!
//! The service keeps no mutable state of its own. Everything that must be
//! coordinated across requests lives in the backing store.

pub mod audit;
pub mod clock;
pub mod config;
pub mod csrf;
pub mod error;
pub mod lockout;
pub mod password;
pub mod rate_limit;
pub mod rbac;
pub mod session;
pub mod types;
pub(crate) mod utils;
pub mod validation;

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use audit::{SecurityEvent, SecurityEventKind};
pub use config::AuthConfig;
pub use error::AuthError;
pub use session::ActiveSession;
pub use types::{ClientContext, OwnershipContext, User};

use self::{
    audit::SecurityLog,
    clock::{Clock, SystemClock},
    csrf::CsrfManager,
    lockout::{FailureOutcome, LockStatus, LockoutPolicy},
    password::{PasswordError, PasswordHasher},
    rate_limit::{FixedWindowRateLimiter, RateLimitAction, RateLimitDecision, RateLimiter},
    rbac::{PermissionSet, Rbac, DEFAULT_ROLE},
    session::{SessionCheck, SessionManager},
};
use crate::store::{AuthStore, CredentialStore, InsertUserOutcome, NewUser, StoreError};

/// Resource and action guarding role management.
pub const ROLES_RESOURCE: &str = "roles";
/// Resource and action guarding account administration.
pub const USERS_RESOURCE: &str = "users";
pub const MANAGE_ACTION: &str = "manage";

#[derive(Clone, Debug)]
pub struct LoginSuccess {
    pub user: User,
    pub session_token: String,
}

/// The user behind a validated session.
#[derive(Clone, Debug)]
pub struct Authenticated {
    pub user: User,
    pub session: ActiveSession,
}

pub struct AuthService {
    config: AuthConfig,
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    hasher: Arc<PasswordHasher>,
    limiter: Arc<dyn RateLimiter>,
    lockout: LockoutPolicy,
    sessions: SessionManager,
    csrf: CsrfManager,
    rbac: Rbac,
    audit: SecurityLog,
}

impl AuthService {
    pub fn new<S: AuthStore + 'static>(store: Arc<S>, config: AuthConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock<S: AuthStore + 'static>(
        store: Arc<S>,
        config: AuthConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let audit = SecurityLog::new(store.clone(), clock.clone());
        let limiter = Arc::new(FixedWindowRateLimiter::new(
            store.clone(),
            clock.clone(),
            config.rate_limit_attempts(),
            config.rate_limit_window(),
        ));
        let lockout = LockoutPolicy::new(
            store.clone(),
            config.max_login_attempts(),
            config.lockout_duration(),
        );
        let sessions = SessionManager::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            config.session_timeout(),
            config.session_rotation_interval(),
        );
        Self {
            credentials: store.clone(),
            csrf: CsrfManager::new(store.clone(), clock.clone(), config.preauth_csrf_ttl()),
            rbac: Rbac::new(store, audit.clone()),
            hasher: Arc::new(PasswordHasher::default()),
            config,
            clock,
            limiter,
            lockout,
            sessions,
            audit,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    async fn check_rate_limit(
        &self,
        client: &ClientContext,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<(), AuthError> {
        match self
            .limiter
            .check(client.ip.as_deref(), identifier, action)
            .await?
        {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited { retry_after } => {
                self.audit
                    .record(
                        SecurityEventKind::RateLimited,
                        None,
                        json!({ "ip": client.ip, "action": action.as_str() }),
                    )
                    .await;
                Err(AuthError::RateLimited { retry_after })
            }
        }
    }

    /// Argon2 is CPU bound, so it runs on the blocking pool. Without a digest
    /// a dummy verification is performed and `false` returned.
    async fn verify_password(&self, password: &str, digest: Option<String>) -> Result<bool, AuthError> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || match digest {
            Some(digest) => hasher.verify(&password, &digest),
            None => {
                hasher.verify_dummy(&password);
                false
            }
        })
        .await
        .map_err(|err| AuthError::Infrastructure(StoreError::Crypto(err.to_string())))
    }

    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_string();
        let hashed = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|err| AuthError::Infrastructure(StoreError::Crypto(err.to_string())))?;
        hashed.map_err(|err| match err {
            PasswordError::TooLong => AuthError::InvalidInput(err.to_string()),
            PasswordError::Hash(message) => AuthError::Infrastructure(StoreError::Crypto(message)),
        })
    }

    /// Verify credentials and start a session.
    ///
    /// The user-visible error never distinguishes an unknown identifier from
    /// a wrong password; the security log records which one it was.
    ///
    /// # Errors
    /// `RateLimited`, `AccountLocked`, `InvalidCredentials`, or
    /// `Infrastructure` when the store is unreachable.
    pub async fn authenticate(
        &self,
        identifier: &str,
        password: &str,
        client: &ClientContext,
    ) -> Result<LoginSuccess, AuthError> {
        self.check_rate_limit(client, identifier, RateLimitAction::Login)
            .await?;

        let record = if validation::valid_identifier(identifier) {
            self.credentials.find_credentials(identifier).await?
        } else {
            None
        };
        let Some(record) = record else {
            self.verify_password(password, None).await?;
            debug!("Login attempt for unknown identifier");
            self.audit
                .record(
                    SecurityEventKind::LoginFailed,
                    None,
                    json!({ "reason": "unknown_user", "ip": client.ip }),
                )
                .await;
            return Err(AuthError::InvalidCredentials);
        };
        let user_id = record.user.id;
        let now = self.clock.now();

        if let LockStatus::Locked { remaining } = self.lockout.status(&record.lockout, now) {
            self.audit
                .record(
                    SecurityEventKind::LoginLocked,
                    Some(user_id),
                    json!({ "ip": client.ip, "remaining_seconds": remaining.num_seconds() }),
                )
                .await;
            return Err(AuthError::AccountLocked { remaining });
        }

        let verified = self
            .verify_password(password, Some(record.password_hash.clone()))
            .await?;

        if !record.user.active {
            debug!(%user_id, "Login attempt for inactive account");
            self.audit
                .record(
                    SecurityEventKind::LoginFailed,
                    Some(user_id),
                    json!({ "reason": "inactive", "ip": client.ip }),
                )
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        if !verified {
            return match self.lockout.record_failure(user_id, now).await? {
                FailureOutcome::Counted { failed_attempts } => {
                    self.audit
                        .record(
                            SecurityEventKind::LoginFailed,
                            Some(user_id),
                            json!({
                                "reason": "wrong_password",
                                "ip": client.ip,
                                "failed_attempts": failed_attempts,
                            }),
                        )
                        .await;
                    Err(AuthError::InvalidCredentials)
                }
                FailureOutcome::Locked { remaining } => {
                    self.audit
                        .record(
                            SecurityEventKind::AccountLocked,
                            Some(user_id),
                            json!({ "ip": client.ip, "locked_seconds": remaining.num_seconds() }),
                        )
                        .await;
                    Err(AuthError::AccountLocked { remaining })
                }
                FailureOutcome::AlreadyLocked { remaining } => {
                    self.audit
                        .record(
                            SecurityEventKind::LoginLocked,
                            Some(user_id),
                            json!({ "ip": client.ip, "remaining_seconds": remaining.num_seconds() }),
                        )
                        .await;
                    Err(AuthError::AccountLocked { remaining })
                }
            };
        }

        self.lockout.record_success(user_id).await?;
        self.rehash_if_needed(user_id, password, &record.password_hash)
            .await;
        self.credentials.record_login(user_id, now).await?;
        let session_token = self.sessions.create(user_id, client).await?;

        let mut user = record.user;
        user.last_login_at = Some(now);
        info!(%user_id, "User authenticated");
        Ok(LoginSuccess {
            user,
            session_token,
        })
    }

    /// Upgrade a stale digest after a successful login. Failures are logged
    /// and never fail the login.
    async fn rehash_if_needed(&self, user_id: Uuid, password: &str, digest: &str) {
        if !self.hasher.needs_rehash(digest) {
            return;
        }
        let rehashed = match self.hash_password(password).await {
            Ok(rehashed) => rehashed,
            Err(err) => {
                warn!(%user_id, "Failed to rehash password: {err}");
                return;
            }
        };
        match self
            .credentials
            .update_password_hash(user_id, &rehashed)
            .await
        {
            Ok(()) => {
                self.audit
                    .record(SecurityEventKind::PasswordRehashed, Some(user_id), json!({}))
                    .await;
            }
            Err(err) => warn!(%user_id, "Failed to store rehashed password: {err}"),
        }
    }

    /// Resolve a session token into its user.
    ///
    /// # Errors
    /// `SessionExpired` for an idle session, `SessionInvalid` for anything
    /// else that is not a live session of an active user.
    pub async fn require_authenticated(
        &self,
        session_token: Option<&str>,
        client: &ClientContext,
    ) -> Result<Authenticated, AuthError> {
        let Some(token) = session_token else {
            return Err(AuthError::SessionInvalid);
        };
        let session = match self.sessions.validate(token, client).await? {
            SessionCheck::Valid(session) => session,
            SessionCheck::Expired => return Err(AuthError::SessionExpired),
            SessionCheck::Missing | SessionCheck::IntegrityViolation => {
                return Err(AuthError::SessionInvalid)
            }
        };
        match self.credentials.find_user(session.user_id).await? {
            Some(user) if user.active => Ok(Authenticated { user, session }),
            _ => {
                self.sessions.destroy(&session.token).await?;
                Err(AuthError::SessionInvalid)
            }
        }
    }

    /// Like [`AuthService::require_authenticated`], with "no valid session"
    /// as `None`. Store failures are still errors.
    pub async fn current_user(
        &self,
        session_token: Option<&str>,
        client: &ClientContext,
    ) -> Result<Option<Authenticated>, AuthError> {
        match self.require_authenticated(session_token, client).await {
            Ok(authenticated) => Ok(Some(authenticated)),
            Err(AuthError::Infrastructure(err)) => Err(AuthError::Infrastructure(err)),
            Err(_) => Ok(None),
        }
    }

    pub async fn has_permission(
        &self,
        user_id: Uuid,
        resource: &str,
        action: &str,
        context: Option<&OwnershipContext>,
    ) -> Result<bool, AuthError> {
        Ok(self
            .rbac
            .has_permission(user_id, resource, action, context)
            .await?)
    }

    /// # Errors
    /// `PermissionDenied` (recorded as `access_denied`), or `Infrastructure`.
    pub async fn require_permission(
        &self,
        user_id: Option<Uuid>,
        resource: &str,
        action: &str,
        context: Option<&OwnershipContext>,
    ) -> Result<(), AuthError> {
        self.rbac
            .require_permission(user_id, resource, action, context)
            .await
    }

    /// Return the session's CSRF token, creating it on first use.
    ///
    /// # Errors
    /// `SessionInvalid` when the session does not exist.
    pub async fn issue_csrf_token(&self, session_token: &str) -> Result<String, AuthError> {
        self.csrf
            .get_or_create(session_token)
            .await?
            .ok_or(AuthError::SessionInvalid)
    }

    /// Constant-time CSRF check. A failure is recorded as
    /// `csrf_token_invalid` and says nothing about the session itself.
    pub async fn verify_csrf_token(
        &self,
        session_token: Option<&str>,
        presented: Option<&str>,
        client: &ClientContext,
    ) -> Result<bool, AuthError> {
        let valid = match session_token {
            Some(session_token) => self.csrf.verify(session_token, presented).await?,
            None => false,
        };
        if !valid {
            self.record_csrf_failure(presented, "session", client).await;
        }
        Ok(valid)
    }

    async fn record_csrf_failure(
        &self,
        presented: Option<&str>,
        binding: &str,
        client: &ClientContext,
    ) {
        self.audit
            .record(
                SecurityEventKind::CsrfTokenInvalid,
                None,
                json!({
                    "ip": client.ip,
                    "binding": binding,
                    "token_present": presented.is_some(),
                }),
            )
            .await;
    }

    /// Issue a CSRF token for a caller without a session. The caller returns
    /// it in both the pre-auth cookie and `x-csrf-token`.
    pub async fn issue_preauth_csrf_token(&self) -> Result<String, AuthError> {
        Ok(self.csrf.issue_preauth().await?)
    }

    #[must_use]
    pub fn preauth_csrf_ttl(&self) -> chrono::Duration {
        self.csrf.preauth_ttl()
    }

    /// Guard for login and registration. A caller with a session uses the
    /// session token; anyone else needs a live pre-auth token whose cookie
    /// and header copies match.
    ///
    /// # Errors
    /// `CsrfInvalid`, recorded as `csrf_token_invalid`.
    pub async fn require_login_csrf_token(
        &self,
        session_token: Option<&str>,
        preauth_cookie: Option<&str>,
        presented: Option<&str>,
        client: &ClientContext,
    ) -> Result<(), AuthError> {
        if session_token.is_some() {
            return self
                .require_csrf_token(session_token, presented, client)
                .await;
        }
        if self.csrf.verify_preauth(preauth_cookie, presented).await? {
            Ok(())
        } else {
            self.record_csrf_failure(presented, "preauth", client).await;
            Err(AuthError::CsrfInvalid)
        }
    }

    /// Retire a pre-auth token once a session exists. Failures are logged.
    pub async fn discard_preauth_csrf_token(&self, token: &str) {
        if let Err(err) = self.csrf.discard_preauth(token).await {
            warn!("Failed to discard pre-auth CSRF token: {err}");
        }
    }

    /// [`AuthService::verify_csrf_token`] as a guard.
    pub async fn require_csrf_token(
        &self,
        session_token: Option<&str>,
        presented: Option<&str>,
        client: &ClientContext,
    ) -> Result<(), AuthError> {
        if self
            .verify_csrf_token(session_token, presented, client)
            .await?
        {
            Ok(())
        } else {
            Err(AuthError::CsrfInvalid)
        }
    }

    /// Create an account with the default role.
    ///
    /// # Errors
    /// `InvalidInput` for policy violations, `Unavailable` when the username
    /// or email is already in use (without saying which).
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
        client: &ClientContext,
    ) -> Result<User, AuthError> {
        self.check_rate_limit(client, username, RateLimitAction::Register)
            .await?;

        let username = username.trim();
        validation::validate_username(username).map_err(AuthError::InvalidInput)?;
        let email = validation::normalize_email(email);
        if !validation::valid_email(&email) {
            return Err(AuthError::InvalidInput("Invalid email address".to_string()));
        }
        validation::validate_password(password, self.config.min_password_length())
            .map_err(AuthError::InvalidInput)?;

        let role = self
            .rbac
            .role_by_name(DEFAULT_ROLE)
            .await?
            .ok_or_else(|| StoreError::MissingRole(DEFAULT_ROLE.to_string()))?;
        let password_hash = self.hash_password(password).await?;

        let outcome = self
            .credentials
            .insert_user(
                NewUser {
                    username: username.to_string(),
                    email,
                    password_hash,
                    role_id: role.id,
                },
                self.clock.now(),
            )
            .await?;
        match outcome {
            InsertUserOutcome::Created(user) => {
                self.audit
                    .record(
                        SecurityEventKind::Registration,
                        Some(user.id),
                        json!({ "ip": client.ip }),
                    )
                    .await;
                Ok(user)
            }
            InsertUserOutcome::Conflict => {
                debug!("Registration rejected: username or email in use");
                Err(AuthError::Unavailable)
            }
        }
    }

    /// Storage errors surface as `Infrastructure`, never as "taken".
    pub async fn is_username_taken(&self, username: &str) -> Result<bool, AuthError> {
        Ok(self.credentials.username_exists(username.trim()).await?)
    }

    pub async fn is_email_taken(&self, email: &str) -> Result<bool, AuthError> {
        Ok(self
            .credentials
            .email_exists(&validation::normalize_email(email))
            .await?)
    }

    /// Replace the password of the session's user and regenerate the session.
    /// Returns the new session token; the old one and its CSRF token are void.
    pub async fn change_password(
        &self,
        session_token: &str,
        current_password: &str,
        new_password: &str,
        client: &ClientContext,
    ) -> Result<String, AuthError> {
        let authenticated = self
            .require_authenticated(Some(session_token), client)
            .await?;
        let user_id = authenticated.user.id;
        self.check_rate_limit(client, &authenticated.user.username, RateLimitAction::PasswordChange)
            .await?;

        let record = self
            .credentials
            .find_credentials_by_id(user_id)
            .await?
            .ok_or(AuthError::SessionInvalid)?;
        if !self
            .verify_password(current_password, Some(record.password_hash))
            .await?
        {
            self.audit
                .record(
                    SecurityEventKind::LoginFailed,
                    Some(user_id),
                    json!({ "reason": "password_change", "ip": client.ip }),
                )
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        validation::validate_password(new_password, self.config.min_password_length())
            .map_err(AuthError::InvalidInput)?;
        let password_hash = self.hash_password(new_password).await?;
        self.credentials
            .update_password_hash(user_id, &password_hash)
            .await?;

        let token = self.sessions.regenerate(user_id, client).await?;
        self.audit
            .record(
                SecurityEventKind::PasswordChanged,
                Some(user_id),
                json!({ "ip": client.ip }),
            )
            .await;
        Ok(token)
    }

    /// Destroy the session. Logging out twice is not an error.
    pub async fn logout(&self, session_token: &str, client: &ClientContext) -> Result<(), AuthError> {
        let owner = self.sessions.owner(session_token).await?;
        let destroyed = self.sessions.destroy(session_token).await?;
        if destroyed {
            self.audit
                .record(SecurityEventKind::Logout, owner, json!({ "ip": client.ip }))
                .await;
        }
        Ok(())
    }

    /// Move `user_id` to the role named `role_name`. Requires `roles/manage`.
    pub async fn assign_role(
        &self,
        actor: Uuid,
        user_id: Uuid,
        role_name: &str,
    ) -> Result<(), AuthError> {
        self.require_permission(Some(actor), ROLES_RESOURCE, MANAGE_ACTION, None)
            .await?;
        let role = self
            .rbac
            .role_by_name(role_name)
            .await?
            .ok_or_else(|| AuthError::InvalidInput("Unknown role".to_string()))?;
        if !self.credentials.set_user_role(user_id, role.id).await? {
            return Err(AuthError::InvalidInput("Unknown user".to_string()));
        }
        self.audit
            .record(
                SecurityEventKind::RoleChange,
                Some(actor),
                json!({ "user_id": user_id, "role": role.name }),
            )
            .await;
        Ok(())
    }

    /// Replace a role's permission document after validating it. Requires
    /// `roles/manage`.
    pub async fn update_role_permissions(
        &self,
        actor: Uuid,
        role_name: &str,
        document: &Value,
    ) -> Result<(), AuthError> {
        self.require_permission(Some(actor), ROLES_RESOURCE, MANAGE_ACTION, None)
            .await?;
        let permissions =
            PermissionSet::parse(document).map_err(|err| AuthError::InvalidInput(err.to_string()))?;
        let role = self
            .rbac
            .role_by_name(role_name)
            .await?
            .ok_or_else(|| AuthError::InvalidInput("Unknown role".to_string()))?;
        let stored = permissions.to_value();
        self.rbac.update_permissions(role.id, &stored).await?;
        self.audit
            .record(
                SecurityEventKind::RoleChange,
                Some(actor),
                json!({ "role": role.name, "permissions": stored }),
            )
            .await;
        Ok(())
    }

    /// Soft-delete an account and drop its sessions. Requires `users/manage`.
    pub async fn deactivate_user(&self, actor: Uuid, user_id: Uuid) -> Result<(), AuthError> {
        self.require_permission(Some(actor), USERS_RESOURCE, MANAGE_ACTION, None)
            .await?;
        if !self.credentials.set_active(user_id, false).await? {
            return Err(AuthError::InvalidInput("Unknown user".to_string()));
        }
        let dropped = self.sessions.destroy_user_sessions(user_id).await?;
        self.audit
            .record(
                SecurityEventKind::AccountDeactivated,
                Some(actor),
                json!({ "user_id": user_id, "sessions_removed": dropped }),
            )
            .await;
        Ok(())
    }

    /// Fail if any stored role has a malformed permission document.
    pub async fn validate_roles(&self) -> Result<usize, AuthError> {
        Ok(self.rbac.validate_roles().await?)
    }

    /// Delete idle sessions and elapsed rate-limit windows. Returns the number
    /// of sessions removed.
    pub async fn purge_expired_sessions(&self) -> Result<u64, AuthError> {
        let sessions = self.sessions.purge_expired().await?;
        match self.limiter.purge_expired().await {
            Ok(windows) => debug!(sessions, windows, "Purged expired auth state"),
            Err(err) => error!("Failed to purge rate limit windows: {err}"),
        }
        match self.csrf.purge_preauth().await {
            Ok(tokens) => debug!(tokens, "Purged expired pre-auth CSRF tokens"),
            Err(err) => error!("Failed to purge pre-auth CSRF tokens: {err}"),
        }
        Ok(sessions)
    }

    /// Newest first.
    pub async fn recent_security_events(&self, limit: i64) -> Result<Vec<SecurityEvent>, AuthError> {
        Ok(self.audit.recent(limit).await?)
    }
}
