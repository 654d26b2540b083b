//! # Gatehouse
//!
//! Authentication, session integrity and role-based access control for web
//! applications.
//!
//! ## Authentication
//!
//! Passwords are stored as Argon2id digests and verified in constant time.
//! Every attempt passes a per-client rate limiter first and a per-account
//! lockout second. Unknown identifiers and wrong passwords are reported with
//! the same generic error and take the same time to answer.
//!
//! ## Sessions
//!
//! A user holds at most one session. Session identifiers are 256-bit random
//! tokens and only their SHA-256 digest is stored. Sessions expire after a
//! period of inactivity and are rotated periodically; the CSRF token bound to
//! a session survives rotation and dies with the session.
//!
//! ## Authorization
//!
//! Each user has one role. A role's permission document maps resources to
//! actions; an action with the `_own` suffix only applies to resources owned
//! by the caller. The `admin` role is granted everything.

pub mod api;
pub mod auth;
pub mod cli;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
