//! Router scenarios over the in-memory store.

use super::app;
use crate::auth::{AuthConfig, AuthService, SecurityEventKind};
use crate::store::MemoryStore;
use anyhow::{anyhow, Result};
use axum::{
    body::{to_bytes, Body},
    http::{
        header::{CONTENT_TYPE, COOKIE, RETRY_AFTER, SET_COOKIE, USER_AGENT},
        Method, Request, Response, StatusCode,
    },
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const PASSWORD: &str = "correct horse 1";
const BROWSER: &str = "Firefox/128";

fn app_and_service(config: AuthConfig) -> (Router, Arc<AuthService>) {
    let store = Arc::new(MemoryStore::new());
    let auth = Arc::new(AuthService::new(store, config));
    (app(auth.clone()), auth)
}

fn app_with(config: AuthConfig) -> Router {
    app_and_service(config).0
}

fn test_app() -> Router {
    // Every call comes from the same IP; keep the rate limit out of the way.
    app_with(AuthConfig::new().with_rate_limit_attempts(100))
}

struct Call<'a> {
    method: Method,
    uri: &'a str,
    session: Option<&'a str>,
    preauth: Option<&'a str>,
    csrf: Option<&'a str>,
    user_agent: &'a str,
    body: Option<Value>,
}

impl<'a> Call<'a> {
    fn new(method: Method, uri: &'a str) -> Self {
        Self {
            method,
            uri,
            session: None,
            preauth: None,
            csrf: None,
            user_agent: BROWSER,
            body: None,
        }
    }

    fn session(mut self, token: &'a str) -> Self {
        self.session = Some(token);
        self
    }

    fn csrf(mut self, token: &'a str) -> Self {
        self.csrf = Some(token);
        self
    }

    /// Send `token` as both the pre-auth cookie and the CSRF header.
    fn preauth(mut self, token: &'a str) -> Self {
        self.preauth = Some(token);
        self.csrf = Some(token);
        self
    }

    fn user_agent(mut self, user_agent: &'a str) -> Self {
        self.user_agent = user_agent;
        self
    }

    fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    async fn send(self, app: &Router) -> Result<Response<Body>> {
        let mut builder = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .header(USER_AGENT, self.user_agent)
            .header("x-forwarded-for", "10.0.0.1");
        let mut cookies = Vec::new();
        if let Some(token) = self.session {
            cookies.push(format!("gatehouse_session={token}"));
        }
        if let Some(token) = self.preauth {
            cookies.push(format!("gatehouse_csrf={token}"));
        }
        if !cookies.is_empty() {
            builder = builder.header(COOKIE, cookies.join("; "));
        }
        if let Some(token) = self.csrf {
            builder = builder.header("x-csrf-token", token);
        }
        let body = match self.body {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&value)?)
            }
            None => Body::empty(),
        };
        Ok(app.clone().oneshot(builder.body(body)?).await?)
    }
}

async fn body_json(response: Response<Body>) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn cookie_from(response: &Response<Body>, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&prefix))
        .map(str::to_string)
}

fn session_from(response: &Response<Body>) -> Result<String> {
    let header =
        cookie_from(response, "gatehouse_session").ok_or_else(|| anyhow!("no session cookie"))?;
    header
        .split(';')
        .next()
        .and_then(|pair| pair.strip_prefix("gatehouse_session="))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("malformed session cookie: {header}"))
}

fn csrf_from(body: &Value) -> Result<String> {
    body.get("csrf_token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing csrf_token"))
}

/// Fetch an anonymous CSRF token; the response also sets its cookie.
async fn preauth_csrf(app: &Router) -> Result<String> {
    let response = Call::new(Method::GET, "/v1/auth/csrf").send(app).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = cookie_from(&response, "gatehouse_csrf")
        .ok_or_else(|| anyhow!("no pre-auth cookie"))?;
    let token = csrf_from(&body_json(response).await?)?;
    assert!(cookie.starts_with(&format!("gatehouse_csrf={token};")));
    Ok(token)
}

async fn login_attempt(app: &Router, identifier: &str, password: &str) -> Result<Response<Body>> {
    let preauth = preauth_csrf(app).await?;
    Call::new(Method::POST, "/v1/auth/login")
        .preauth(&preauth)
        .json(json!({ "identifier": identifier, "password": password }))
        .send(app)
        .await
}

async fn register(app: &Router, username: &str) -> Result<()> {
    let preauth = preauth_csrf(app).await?;
    let response = Call::new(Method::POST, "/v1/auth/register")
        .preauth(&preauth)
        .json(json!({
            "username": username,
            "email": format!("{username}@example.com"),
            "password": PASSWORD,
        }))
        .send(app)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    Ok(())
}

async fn login(app: &Router, identifier: &str) -> Result<String> {
    let response = login_attempt(app, identifier, PASSWORD).await?;
    assert_eq!(response.status(), StatusCode::OK);
    session_from(&response)
}

async fn csrf_token(app: &Router, session: &str) -> Result<String> {
    let response = Call::new(Method::GET, "/v1/auth/csrf")
        .session(session)
        .send(app)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(cookie_from(&response, "gatehouse_csrf").is_none());
    csrf_from(&body_json(response).await?)
}

#[tokio::test]
async fn login_session_and_logout() -> Result<()> {
    let app = test_app();
    register(&app, "alice").await?;
    let session = login(&app, "alice").await?;

    let response = Call::new(Method::GET, "/v1/auth/session")
        .session(&session)
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(
        body.pointer("/user/username").and_then(Value::as_str),
        Some("alice")
    );

    // Logout with a live session needs the CSRF token.
    let response = Call::new(Method::POST, "/v1/auth/logout")
        .session(&session)
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let csrf = csrf_token(&app, &session).await?;
    let response = Call::new(Method::POST, "/v1/auth/logout")
        .session(&session)
        .csrf(&csrf)
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response
        .headers()
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("Max-Age=0")));

    let response = Call::new(Method::GET, "/v1/auth/session")
        .session(&session)
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn login_and_register_require_csrf() -> Result<()> {
    let (app, auth) = app_and_service(AuthConfig::new());
    register(&app, "gina").await?;

    let response = Call::new(Method::POST, "/v1/auth/login")
        .json(json!({ "identifier": "gina", "password": PASSWORD }))
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let events = auth.recent_security_events(1).await?;
    assert_eq!(
        events.first().map(|event| event.kind),
        Some(SecurityEventKind::CsrfTokenInvalid)
    );

    let response = Call::new(Method::POST, "/v1/auth/register")
        .json(json!({
            "username": "mallory",
            "email": "mallory@example.com",
            "password": PASSWORD,
        }))
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // A header without the matching cookie is not enough.
    let preauth = preauth_csrf(&app).await?;
    let response = Call::new(Method::POST, "/v1/auth/login")
        .csrf(&preauth)
        .json(json!({ "identifier": "gina", "password": PASSWORD }))
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn login_retires_preauth_token() -> Result<()> {
    let app = test_app();
    register(&app, "hank").await?;
    let preauth = preauth_csrf(&app).await?;

    let response = Call::new(Method::POST, "/v1/auth/login")
        .preauth(&preauth)
        .json(json!({ "identifier": "hank", "password": PASSWORD }))
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    session_from(&response)?;
    assert!(cookie_from(&response, "gatehouse_csrf")
        .is_some_and(|value| value.contains("Max-Age=0")));

    let response = Call::new(Method::POST, "/v1/auth/login")
        .preauth(&preauth)
        .json(json!({ "identifier": "hank", "password": PASSWORD }))
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_generic_then_locks() -> Result<()> {
    let app = test_app();
    register(&app, "bob").await?;

    let mut last = None;
    for _ in 0..5 {
        last = Some(login_attempt(&app, "bob", "wrong password 1").await?);
    }
    let locked = last.ok_or_else(|| anyhow!("no response"))?;
    assert_eq!(locked.status(), StatusCode::LOCKED);
    assert!(locked.headers().contains_key(RETRY_AFTER));

    let response = login_attempt(&app, "nobody", "wrong password 1").await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(response).await?.get("error").and_then(Value::as_str),
        Some("Invalid username or password")
    );
    Ok(())
}

#[tokio::test]
async fn changed_user_agent_invalidates_session() -> Result<()> {
    let app = test_app();
    register(&app, "carol").await?;
    let session = login(&app, "carol").await?;

    let response = Call::new(Method::GET, "/v1/auth/session")
        .session(&session)
        .user_agent("curl/8.0")
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response
        .headers()
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("Max-Age=0")));

    // The session is gone even for the original browser.
    let response = Call::new(Method::GET, "/v1/auth/session")
        .session(&session)
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn members_cannot_assign_roles() -> Result<()> {
    let app = test_app();
    register(&app, "dave").await?;
    let session = login(&app, "dave").await?;
    let csrf = csrf_token(&app, &session).await?;

    let uri = format!("/v1/admin/users/{}/role", uuid::Uuid::new_v4());
    let response = Call::new(Method::PUT, &uri)
        .session(&session)
        .csrf(&csrf)
        .json(json!({ "role": "admin" }))
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn password_change_issues_new_session() -> Result<()> {
    let app = test_app();
    register(&app, "erin").await?;
    let session = login(&app, "erin").await?;
    let csrf = csrf_token(&app, &session).await?;

    let response = Call::new(Method::POST, "/v1/auth/password")
        .session(&session)
        .csrf(&csrf)
        .json(json!({
            "current_password": PASSWORD,
            "new_password": "battery staple 2",
        }))
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let renewed = session_from(&response)?;
    assert_ne!(renewed, session);

    let response = Call::new(Method::GET, "/v1/auth/session")
        .session(&renewed)
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_conflicts() -> Result<()> {
    let app = test_app();
    register(&app, "frank").await?;
    let preauth = preauth_csrf(&app).await?;
    let response = Call::new(Method::POST, "/v1/auth/register")
        .preauth(&preauth)
        .json(json!({
            "username": "FRANK",
            "email": "other@example.com",
            "password": PASSWORD,
        }))
        .send(&app)
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn default_policy_locks_before_rate_limit() -> Result<()> {
    let app = app_with(AuthConfig::new());
    register(&app, "alice").await?;

    for attempt in 1..=5 {
        let response = login_attempt(&app, "alice", "wrong password 1").await?;
        let expected = if attempt < 5 {
            StatusCode::UNAUTHORIZED
        } else {
            StatusCode::LOCKED
        };
        assert_eq!(response.status(), expected, "attempt {attempt}");
    }
    let response = login_attempt(&app, "alice", PASSWORD).await?;
    assert_eq!(response.status(), StatusCode::LOCKED);
    assert!(response.headers().contains_key(RETRY_AFTER));
    Ok(())
}

#[tokio::test]
async fn login_past_the_window_budget_is_rate_limited() -> Result<()> {
    let app = app_with(AuthConfig::new());
    let preauth = preauth_csrf(&app).await?;
    let preauth = preauth.as_str();
    let attempt = move || {
        Call::new(Method::POST, "/v1/auth/login")
            .preauth(preauth)
            .json(json!({ "identifier": "ghost", "password": "wrong password 1" }))
    };
    for _ in 0..20 {
        assert_eq!(attempt().send(&app).await?.status(), StatusCode::UNAUTHORIZED);
    }
    let response = attempt().send(&app).await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(RETRY_AFTER));
    Ok(())
}
