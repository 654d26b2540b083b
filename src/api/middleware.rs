//! Per-request session context.
//!
//! [`session_context`] runs once per request before any handler. It resolves
//! the session token, pre-auth CSRF cookie, client IP and user agent into a
//! [`RequestContext`]
//! stored in the request extensions, and writes the rotated session cookie
//! back when the session identifier changed during validation.

use axum::{
    extract::{Request, State},
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, COOKIE, SET_COOKIE, USER_AGENT},
        HeaderMap, HeaderValue,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use crate::auth::{AuthError, AuthService, Authenticated, ClientContext};

pub const SESSION_COOKIE_NAME: &str = "gatehouse_session";
pub const CSRF_HEADER: &str = "x-csrf-token";
/// Carries the pre-auth CSRF token of a caller that has no session yet.
pub const PREAUTH_CSRF_COOKIE_NAME: &str = "gatehouse_csrf";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No session token was presented.
    Anonymous,
    Active,
    Expired,
    Invalid,
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub client: ClientContext,
    pub user: Option<Authenticated>,
    pub session_state: SessionState,
    /// Value of the `x-csrf-token` header, if any.
    pub csrf_token: Option<String>,
    /// Value of the pre-auth CSRF cookie, if any.
    pub preauth_csrf: Option<String>,
}

impl RequestContext {
    /// The authenticated user, or the reason there is none.
    ///
    /// # Errors
    /// `SessionExpired` or `SessionInvalid`.
    pub fn require_user(&self) -> Result<&Authenticated, AuthError> {
        match (&self.user, self.session_state) {
            (Some(user), _) => Ok(user),
            (None, SessionState::Expired) => Err(AuthError::SessionExpired),
            (None, _) => Err(AuthError::SessionInvalid),
        }
    }

    /// Current token of the validated session (after any rotation).
    #[must_use]
    pub fn session_token(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.session.token.as_str())
    }

    #[must_use]
    pub fn user_id(&self) -> Option<uuid::Uuid> {
        self.user.as_ref().map(|user| user.user.id)
    }
}

pub async fn session_context(
    State(auth): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let (client, csrf_token, preauth_csrf, presented) = {
        let headers = request.headers();
        let client = ClientContext::new(
            extract_client_ip(headers),
            headers
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        );
        let csrf_token = headers
            .get(CSRF_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        (
            client,
            csrf_token,
            cookie_value(headers, PREAUTH_CSRF_COOKIE_NAME),
            extract_session_token(headers),
        )
    };

    let (user, session_state) = match presented {
        None => (None, SessionState::Anonymous),
        Some(token) => match auth.require_authenticated(Some(&token), &client).await {
            Ok(authenticated) => (Some(authenticated), SessionState::Active),
            Err(AuthError::SessionExpired) => (None, SessionState::Expired),
            Err(err @ AuthError::Infrastructure(_)) => return err.into_response(),
            Err(err) => {
                debug!("Ignoring presented session: {err}");
                (None, SessionState::Invalid)
            }
        },
    };

    let rotated_token = user
        .as_ref()
        .filter(|user| user.session.rotated)
        .map(|user| user.session.token.clone());

    request.extensions_mut().insert(RequestContext {
        client,
        user,
        session_state,
        csrf_token,
        preauth_csrf,
    });

    let mut response = next.run(request).await;

    // A handler that set its own session cookie (login, password change) wins.
    if sets_session_cookie(response.headers()) {
        return response;
    }
    let cookie = match (rotated_token, session_state) {
        (Some(token), _) => session_cookie(&token).ok(),
        (None, SessionState::Expired | SessionState::Invalid) => clear_session_cookie().ok(),
        _ => None,
    };
    if let Some(cookie) = cookie {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

/// Session cookie with fixed attributes: not readable by scripts, HTTPS only,
/// same-site strict, and no expiry so it lasts for the browser session.
pub(crate) fn session_cookie(token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; Secure; SameSite=Strict"
    ))
}

pub(crate) fn clear_session_cookie() -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0"
    ))
}

/// Pre-auth CSRF cookie, scoped like the session cookie and expiring with
/// the server-side token.
pub(crate) fn preauth_csrf_cookie(
    token: &str,
    max_age_seconds: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{PREAUTH_CSRF_COOKIE_NAME}={token}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={max_age_seconds}"
    ))
}

pub(crate) fn clear_preauth_csrf_cookie() -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{PREAUTH_CSRF_COOKIE_NAME}=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0"
    ))
}

fn sets_session_cookie(headers: &HeaderMap) -> bool {
    let prefix = format!("{SESSION_COOKIE_NAME}=");
    headers
        .get_all(SET_COOKIE)
        .iter()
        .any(|value| value.as_bytes().starts_with(prefix.as_bytes()))
}

pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    extract_bearer_token(headers).or_else(|| cookie_value(headers, SESSION_COOKIE_NAME))
}

/// First non-empty value of cookie `name` across all `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            let val = val.trim();
            if key.trim() == name && !val.is_empty() {
                return Some(val.to_string());
            }
        }
    }
    None
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Client IP from common proxy headers. Spoofable; only used for rate-limit
/// keys and session fingerprints.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
