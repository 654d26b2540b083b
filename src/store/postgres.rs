//! Postgres implementation of the storage contract.
//!
//! Counters are updated with single `UPDATE ... RETURNING` / `INSERT ... ON
//! CONFLICT` statements so concurrent requests never lose increments. The
//! session registry enforces one row per user with a unique index, and
//! eviction-then-insert runs in a transaction holding the user's row lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    Connection, PgConnection, PgPool, Row,
};
use std::time::Duration;
use tracing::{Instrument, Span};
use uuid::Uuid;

use super::{
    CredentialRecord, CredentialStore, FailedLogin, InsertUserOutcome, LockoutState, NewUser,
    PreauthCsrfStore, RateLimitStore, RateWindow, RoleRecord, RoleStore, SecurityEventStore,
    SessionRecord, SessionStore, StoreError,
};
use crate::auth::audit::{SecurityEvent, SecurityEventKind};
use crate::auth::types::User;

pub const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const USER_COLUMNS: &str = "id, username, email, role_id, active, last_login_at, created_at, \
                            password_hash, failed_attempts, locked_until";

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a small pool to `dsn`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be reached.
    pub async fn connect(dsn: &SecretString) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn.expose_secret())
            .await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply `sql/schema.sql` statement by statement. Every statement is
    /// idempotent, so this is safe on an initialized database.
    ///
    /// # Errors
    /// Returns the first failing statement's error.
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        let mut connection = self.pool.acquire().await?;
        apply_statements(&mut connection, SCHEMA_SQL).await
    }
}

async fn apply_statements(connection: &mut PgConnection, sql: &str) -> Result<(), StoreError> {
    let mut tx = connection.begin().await?;
    for statement in split_sql_statements(sql) {
        sqlx::query(&statement)
            .execute(&mut *tx)
            .instrument(query_span("DDL", "schema"))
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Split a schema file into executable statements, skipping comment lines.
pub(crate) fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

fn query_span(operation: &'static str, statement: &str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        role_id: row.try_get("role_id")?,
        active: row.try_get("active")?,
        last_login_at: row.try_get("last_login_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn credentials_from_row(row: &PgRow) -> Result<CredentialRecord, sqlx::Error> {
    Ok(CredentialRecord {
        user: user_from_row(row)?,
        password_hash: row.try_get("password_hash")?,
        lockout: lockout_from_row(row)?,
    })
}

fn lockout_from_row(row: &PgRow) -> Result<LockoutState, sqlx::Error> {
    Ok(LockoutState {
        failed_attempts: row.try_get("failed_attempts")?,
        locked_until: row.try_get("locked_until")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<SessionRecord, sqlx::Error> {
    Ok(SessionRecord {
        session_hash: row.try_get("session_hash")?,
        user_id: row.try_get("user_id")?,
        ip_hash: row.try_get("ip_hash")?,
        user_agent_hash: row.try_get("user_agent_hash")?,
        csrf_token: row.try_get("csrf_token")?,
        created_at: row.try_get("created_at")?,
        rotated_at: row.try_get("rotated_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
    })
}

fn role_from_row(row: &PgRow) -> Result<RoleRecord, StoreError> {
    let permissions: String = row.try_get("permissions")?;
    Ok(RoleRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        permissions: serde_json::from_str(&permissions)?,
    })
}

fn event_from_row(row: &PgRow) -> Result<SecurityEvent, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = kind
        .parse::<SecurityEventKind>()
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
    let context: String = row.try_get("context")?;
    Ok(SecurityEvent {
        kind,
        actor: row.try_get("actor_id")?,
        context: serde_json::from_str(&context)?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_credentials(
        &self,
        identifier: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE lower(username) = lower($1) OR email = lower($1) LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(identifier.trim())
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await?;
        Ok(row.as_ref().map(credentials_from_row).transpose()?)
    }

    async fn find_credentials_by_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await?;
        Ok(row.as_ref().map(credentials_from_row).transpose()?)
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self
            .find_credentials_by_id(user_id)
            .await?
            .map(|record| record.user))
    }

    async fn insert_user(
        &self,
        user: NewUser,
        now: DateTime<Utc>,
    ) -> Result<InsertUserOutcome, StoreError> {
        let query = format!(
            "INSERT INTO users (id, username, email, password_hash, role_id, created_at) \
             VALUES ($1, $2, lower($3), $4, $5, $6) RETURNING {USER_COLUMNS}"
        );
        let result = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(user.role_id)
            .bind(now)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", &query))
            .await;

        match result {
            Ok(row) => Ok(InsertUserOutcome::Created(user_from_row(&row)?)),
            Err(err) if is_unique_violation(&err) => Ok(InsertUserOutcome::Conflict),
            Err(err) => Err(err.into()),
        }
    }

    async fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
        let query = "SELECT EXISTS (SELECT 1 FROM users WHERE lower(username) = lower($1))";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn email_exists(&self, email: &str) -> Result<bool, StoreError> {
        let query = "SELECT EXISTS (SELECT 1 FROM users WHERE email = lower($1))";
        let row = sqlx::query(query)
            .bind(email)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn update_password_hash(&self, user_id: Uuid, hash: &str) -> Result<(), StoreError> {
        let query = "UPDATE users SET password_hash = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(hash)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn record_failed_login(
        &self,
        user_id: Uuid,
        max_attempts: i32,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<FailedLogin, StoreError> {
        // Right-hand expressions see the pre-update row, so the CASE compares
        // against the incremented count. A locked row matches nothing.
        let query = r"
            UPDATE users
            SET failed_attempts = failed_attempts + 1,
                locked_until = CASE
                    WHEN failed_attempts + 1 >= $2 THEN $4
                    ELSE locked_until
                END
            WHERE id = $1
              AND NOT (failed_attempts >= $2 AND locked_until IS NOT NULL AND locked_until > $3)
            RETURNING failed_attempts, locked_until
        ";
        let counted = sqlx::query(query)
            .bind(user_id)
            .bind(max_attempts)
            .bind(now)
            .bind(lock_until)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        if let Some(row) = counted {
            return Ok(FailedLogin::Counted(lockout_from_row(&row)?));
        }

        let query = "SELECT failed_attempts, locked_until FROM users WHERE id = $1";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(FailedLogin::AlreadyLocked(lockout_from_row(&row)?))
    }

    async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), StoreError> {
        let query = "UPDATE users SET failed_attempts = 0, locked_until = NULL WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn record_login(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let query = "UPDATE users SET last_login_at = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn set_active(&self, user_id: Uuid, active: bool) -> Result<bool, StoreError> {
        let query = "UPDATE users SET active = $2 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(active)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_user_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool, StoreError> {
        let query = r"
            UPDATE users SET role_id = $2
            WHERE id = $1 AND EXISTS (SELECT 1 FROM roles WHERE id = $2)
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn replace_user_session(&self, session: &SessionRecord) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serialize concurrent logins for the same user on the user's row.
        let query = "SELECT id FROM users WHERE id = $1 FOR UPDATE";
        sqlx::query(query)
            .bind(session.user_id)
            .fetch_optional(&mut *tx)
            .instrument(query_span("SELECT", query))
            .await?;

        let query = "DELETE FROM user_sessions WHERE user_id = $1";
        let evicted = sqlx::query(query)
            .bind(session.user_id)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await?
            .rows_affected();

        let query = r"
            INSERT INTO user_sessions
                (session_hash, user_id, ip_hash, user_agent_hash, csrf_token,
                 created_at, rotated_at, last_activity_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ";
        sqlx::query(query)
            .bind(&session.session_hash)
            .bind(session.user_id)
            .bind(&session.ip_hash)
            .bind(&session.user_agent_hash)
            .bind(&session.csrf_token)
            .bind(session.created_at)
            .bind(session.rotated_at)
            .bind(session.last_activity_at)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await?;

        tx.commit().await?;
        Ok(evicted)
    }

    async fn find_session(&self, session_hash: &[u8]) -> Result<Option<SessionRecord>, StoreError> {
        let query = r"
            SELECT session_hash, user_id, ip_hash, user_agent_hash, csrf_token,
                   created_at, rotated_at, last_activity_at
            FROM user_sessions
            WHERE session_hash = $1
        ";
        let row = sqlx::query(query)
            .bind(session_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    async fn touch_session(
        &self,
        session_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = "UPDATE user_sessions SET last_activity_at = $2 WHERE session_hash = $1";
        sqlx::query(query)
            .bind(session_hash)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn update_session_ip(
        &self,
        session_hash: &[u8],
        ip_hash: &[u8],
    ) -> Result<(), StoreError> {
        let query = "UPDATE user_sessions SET ip_hash = $2 WHERE session_hash = $1";
        sqlx::query(query)
            .bind(session_hash)
            .bind(ip_hash)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn rotate_session(
        &self,
        old_hash: &[u8],
        new_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // Rewriting the primary key in place retires the old identifier in
        // the same statement that makes the new one valid.
        let query = r"
            UPDATE user_sessions
            SET session_hash = $2, rotated_at = $3, last_activity_at = $3
            WHERE session_hash = $1
        ";
        let result = sqlx::query(query)
            .bind(old_hash)
            .bind(new_hash)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bind_csrf_token(
        &self,
        session_hash: &[u8],
        token: &str,
    ) -> Result<Option<String>, StoreError> {
        let query = r"
            UPDATE user_sessions
            SET csrf_token = COALESCE(csrf_token, $2)
            WHERE session_hash = $1
            RETURNING csrf_token
        ";
        let row = sqlx::query(query)
            .bind(session_hash)
            .bind(token)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(row.map(|row| row.try_get("csrf_token")).transpose()?)
    }

    async fn delete_session(&self, session_hash: &[u8]) -> Result<bool, StoreError> {
        let query = "DELETE FROM user_sessions WHERE session_hash = $1";
        let result = sqlx::query(query)
            .bind(session_hash)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let query = "DELETE FROM user_sessions WHERE user_id = $1";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_user_sessions(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let query = "SELECT COUNT(*) FROM user_sessions WHERE user_id = $1";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn purge_idle_sessions(&self, idle_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "DELETE FROM user_sessions WHERE last_activity_at < $1";
        let result = sqlx::query(query)
            .bind(idle_before)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PreauthCsrfStore for PgStore {
    async fn insert_preauth_csrf(
        &self,
        token_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO preauth_csrf_tokens (token_hash, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (token_hash) DO UPDATE SET expires_at = EXCLUDED.expires_at
        ";
        sqlx::query(query)
            .bind(token_hash)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn preauth_csrf_valid(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM preauth_csrf_tokens WHERE token_hash = $1 AND expires_at > $2
            )
        ";
        let valid: bool = sqlx::query_scalar(query)
            .bind(token_hash)
            .bind(now)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(valid)
    }

    async fn delete_preauth_csrf(&self, token_hash: &[u8]) -> Result<bool, StoreError> {
        let query = "DELETE FROM preauth_csrf_tokens WHERE token_hash = $1";
        let result = sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_preauth_csrf(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "DELETE FROM preauth_csrf_tokens WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RateLimitStore for PgStore {
    async fn hit_rate_limit(
        &self,
        client_key: &str,
        action: &str,
        now: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> Result<RateWindow, StoreError> {
        let query = r"
            INSERT INTO rate_limits (client_key, action, attempts, window_start)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (client_key, action) DO UPDATE
            SET attempts = CASE
                    WHEN rate_limits.window_start <= $4 THEN 1
                    ELSE rate_limits.attempts + 1
                END,
                window_start = CASE
                    WHEN rate_limits.window_start <= $4 THEN $3
                    ELSE rate_limits.window_start
                END
            RETURNING attempts, window_start
        ";
        let row = sqlx::query(query)
            .bind(client_key)
            .bind(action)
            .bind(now)
            .bind(expired_before)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(RateWindow {
            attempts: row.try_get("attempts")?,
            window_start: row.try_get("window_start")?,
        })
    }

    async fn purge_rate_limits(&self, expired_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "DELETE FROM rate_limits WHERE window_start <= $1";
        let result = sqlx::query(query)
            .bind(expired_before)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RoleStore for PgStore {
    async fn role_for_user(&self, user_id: Uuid) -> Result<Option<RoleRecord>, StoreError> {
        let query = r"
            SELECT roles.id, roles.name, roles.permissions::text AS permissions
            FROM users
            JOIN roles ON roles.id = users.role_id
            WHERE users.id = $1
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        row.as_ref().map(role_from_row).transpose()
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, StoreError> {
        let query = "SELECT id, name, permissions::text AS permissions FROM roles WHERE name = $1";
        let row = sqlx::query(query)
            .bind(name)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        row.as_ref().map(role_from_row).transpose()
    }

    async fn list_roles(&self) -> Result<Vec<RoleRecord>, StoreError> {
        let query = "SELECT id, name, permissions::text AS permissions FROM roles ORDER BY name";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        rows.iter().map(role_from_row).collect()
    }

    async fn update_role_permissions(
        &self,
        role_id: Uuid,
        permissions: &Value,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(permissions)?;
        let query = "UPDATE roles SET permissions = $2::jsonb WHERE id = $1";
        let result = sqlx::query(query)
            .bind(role_id)
            .bind(payload)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SecurityEventStore for PgStore {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        let context = serde_json::to_string(&event.context)?;
        let query = r"
            INSERT INTO security_events (kind, actor_id, context, occurred_at)
            VALUES ($1, $2, $3::jsonb, $4)
        ";
        sqlx::query(query)
            .bind(event.kind.as_str())
            .bind(event.actor)
            .bind(context)
            .bind(event.occurred_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn recent_events(&self, limit: i64) -> Result<Vec<SecurityEvent>, StoreError> {
        let query = r"
            SELECT kind, actor_id, context::text AS context, occurred_at
            FROM security_events
            ORDER BY id DESC
            LIMIT $1
        ";
        let rows = sqlx::query(query)
            .bind(limit)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        rows.iter().map(event_from_row).collect()
    }
}
