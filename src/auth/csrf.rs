//! CSRF tokens.
//!
//! A session token is created lazily the first time a session needs one and
//! then stays fixed for the life of the session (periodic rotation carries it
//! over). Only a full session regeneration yields a new token.
//!
//! Callers without a session (login, registration) get a pre-auth token
//! instead. It is sent back both in a cookie and in the request header, and
//! the server keeps its hash with an expiry, so a token is only accepted from
//! the browser it was issued to and only while it is live.

use chrono::Duration;
use std::sync::Arc;

use super::clock::Clock;
use super::utils::{constant_time_eq, generate_token, hash_token};
use crate::store::{PreauthCsrfStore, SessionStore, StoreError};

pub struct CsrfManager {
    sessions: Arc<dyn SessionStore>,
    preauth: Arc<dyn PreauthCsrfStore>,
    clock: Arc<dyn Clock>,
    preauth_ttl: Duration,
}

impl CsrfManager {
    pub fn new<S: SessionStore + PreauthCsrfStore + 'static>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        preauth_ttl: Duration,
    ) -> Self {
        Self {
            sessions: store.clone(),
            preauth: store,
            clock,
            preauth_ttl,
        }
    }

    /// Return the session's token, binding a new random one if it has none.
    /// `None` when the session does not exist.
    pub async fn get_or_create(&self, session_token: &str) -> Result<Option<String>, StoreError> {
        // Independent randomness; never derived from the session identifier.
        let candidate = generate_token()?;
        self.sessions
            .bind_csrf_token(&hash_token(session_token), &candidate)
            .await
    }

    /// Constant-time check of `presented` against the session's token.
    pub async fn verify(
        &self,
        session_token: &str,
        presented: Option<&str>,
    ) -> Result<bool, StoreError> {
        let stored = self
            .sessions
            .find_session(&hash_token(session_token))
            .await?
            .and_then(|session| session.csrf_token);
        Ok(tokens_match(stored.as_deref(), presented))
    }

    #[must_use]
    pub fn preauth_ttl(&self) -> Duration {
        self.preauth_ttl
    }

    /// Issue a token for a caller that has no session yet.
    pub async fn issue_preauth(&self) -> Result<String, StoreError> {
        let token = generate_token()?;
        self.preauth
            .insert_preauth_csrf(&hash_token(&token), self.clock.now() + self.preauth_ttl)
            .await?;
        Ok(token)
    }

    /// The cookie copy and the header copy must match, and the token must
    /// still be live in the store.
    pub async fn verify_preauth(
        &self,
        cookie: Option<&str>,
        presented: Option<&str>,
    ) -> Result<bool, StoreError> {
        let Some(cookie) = cookie.filter(|_| tokens_match(cookie, presented)) else {
            return Ok(false);
        };
        self.preauth
            .preauth_csrf_valid(&hash_token(cookie), self.clock.now())
            .await
    }

    pub async fn discard_preauth(&self, token: &str) -> Result<bool, StoreError> {
        self.preauth.delete_preauth_csrf(&hash_token(token)).await
    }

    pub async fn purge_preauth(&self) -> Result<u64, StoreError> {
        self.preauth.purge_preauth_csrf(self.clock.now()).await
    }
}

/// Absence of either side, or an empty value, is a mismatch.
#[must_use]
pub fn tokens_match(expected: Option<&str>, presented: Option<&str>) -> bool {
    match (expected, presented) {
        (Some(expected), Some(presented)) if !expected.is_empty() => {
            constant_time_eq(expected.as_bytes(), presented.as_bytes())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::store::{MemoryStore, SessionRecord};
    use anyhow::{anyhow, Result};
    use chrono::Utc;
    use uuid::Uuid;

    fn manager(store: Arc<MemoryStore>) -> CsrfManager {
        CsrfManager::new(store, Arc::new(ManualClock::new(Utc::now())), Duration::hours(1))
    }

    async fn session(store: &MemoryStore, token: &str) -> Result<()> {
        let now = Utc::now();
        store
            .replace_user_session(&SessionRecord {
                session_hash: hash_token(token),
                user_id: Uuid::new_v4(),
                ip_hash: Vec::new(),
                user_agent_hash: Vec::new(),
                csrf_token: None,
                created_at: now,
                rotated_at: now,
                last_activity_at: now,
            })
            .await?;
        Ok(())
    }

    #[test]
    fn tokens_match_rejects_absence() {
        assert!(tokens_match(Some("abc"), Some("abc")));
        assert!(!tokens_match(Some("abc"), None));
        assert!(!tokens_match(None, Some("abc")));
        assert!(!tokens_match(None, None));
        assert!(!tokens_match(Some(""), Some("")));
    }

    #[tokio::test]
    async fn token_is_stable_for_session() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        session(&store, "session-a").await?;
        let csrf = manager(store);

        let first = csrf.get_or_create("session-a").await?;
        let second = csrf.get_or_create("session-a").await?;
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_ne!(first.as_deref(), Some("session-a"));
        Ok(())
    }

    #[tokio::test]
    async fn token_only_valid_for_its_session() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        session(&store, "session-a").await?;
        session(&store, "session-b").await?;
        let csrf = manager(store);

        let token_a = csrf
            .get_or_create("session-a")
            .await?
            .ok_or_else(|| anyhow!("no token"))?;
        let token_b = csrf
            .get_or_create("session-b")
            .await?
            .ok_or_else(|| anyhow!("no token"))?;

        assert!(csrf.verify("session-a", Some(&token_a)).await?);
        assert!(!csrf.verify("session-a", Some(&token_b)).await?);
        assert!(!csrf.verify("session-b", Some(&token_a)).await?);

        let mut mutated = token_a.clone().into_bytes();
        mutated[0] = if mutated[0] == b'A' { b'B' } else { b'A' };
        let mutated = String::from_utf8(mutated)?;
        assert!(!csrf.verify("session-a", Some(&mutated)).await?);
        assert!(!csrf.verify("session-a", None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_session_gets_no_token() -> Result<()> {
        let csrf = manager(Arc::new(MemoryStore::new()));
        assert_eq!(csrf.get_or_create("nope").await?, None);
        assert!(!csrf.verify("nope", Some("anything")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn preauth_token_needs_matching_cookie_and_header() -> Result<()> {
        let csrf = manager(Arc::new(MemoryStore::new()));
        let token = csrf.issue_preauth().await?;
        let other = csrf.issue_preauth().await?;
        assert_ne!(token, other);

        assert!(csrf.verify_preauth(Some(&token), Some(&token)).await?);
        assert!(!csrf.verify_preauth(Some(&token), Some(&other)).await?);
        assert!(!csrf.verify_preauth(None, Some(&token)).await?);
        assert!(!csrf.verify_preauth(Some(&token), None).await?);
        // Well-formed but never issued.
        assert!(!csrf.verify_preauth(Some("forged"), Some("forged")).await?);

        assert!(csrf.discard_preauth(&token).await?);
        assert!(!csrf.verify_preauth(Some(&token), Some(&token)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn preauth_token_expires() -> Result<()> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let csrf = CsrfManager::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            Duration::minutes(10),
        );
        let token = csrf.issue_preauth().await?;

        clock.advance(Duration::minutes(9));
        assert!(csrf.verify_preauth(Some(&token), Some(&token)).await?);
        clock.advance(Duration::minutes(1));
        assert!(!csrf.verify_preauth(Some(&token), Some(&token)).await?);
        assert_eq!(csrf.purge_preauth().await?, 1);
        Ok(())
    }
}
