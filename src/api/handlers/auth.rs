//! Session lifecycle endpoints.
//!
//! Every state-changing request carries a CSRF token in `x-csrf-token`. With
//! a live session it is the session's token. Anonymous login and
//! registration use a pre-auth token from `GET /v1/auth/csrf`, which must
//! also come back in the pre-auth cookie set alongside it.

use axum::{
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    Extension,
};
use std::sync::Arc;
use tracing::error;

use super::types::{
    CsrfResponse, ErrorResponse, LoginRequest, PasswordChangeRequest, RegisterRequest,
    SessionResponse,
};
use crate::{
    api::middleware::{
        clear_preauth_csrf_cookie, clear_session_cookie, preauth_csrf_cookie, session_cookie,
        RequestContext,
    },
    auth::{AuthError, AuthService, User},
};

#[utoipa::path(
    get,
    path = "/v1/auth/csrf",
    responses(
        (status = 200, description = "CSRF token bound to the current session, or a pre-auth token with its cookie set", body = CsrfResponse),
    ),
    tag = "auth"
)]
pub async fn csrf(
    Extension(auth): Extension<Arc<AuthService>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<impl IntoResponse, AuthError> {
    let mut headers = HeaderMap::new();
    let csrf_token = match ctx.session_token() {
        Some(token) => auth.issue_csrf_token(token).await?,
        None => {
            let token = auth.issue_preauth_csrf_token().await?;
            let max_age = auth.preauth_csrf_ttl().num_seconds();
            match preauth_csrf_cookie(&token, max_age) {
                Ok(cookie) => {
                    headers.insert(SET_COOKIE, cookie);
                }
                Err(err) => error!("Failed to build pre-auth CSRF cookie: {err}"),
            }
            token
        }
    };
    Ok((headers, Json(CsrfResponse { csrf_token })))
}

async fn require_login_csrf(auth: &AuthService, ctx: &RequestContext) -> Result<(), AuthError> {
    auth.require_login_csrf_token(
        ctx.session_token(),
        ctx.preauth_csrf.as_deref(),
        ctx.csrf_token.as_deref(),
        &ctx.client,
    )
    .await
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in; session cookie set", body = User),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 403, description = "Missing or invalid CSRF token", body = ErrorResponse),
        (status = 423, description = "Account temporarily locked", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn login(
    Extension(auth): Extension<Arc<AuthService>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    require_login_csrf(&auth, &ctx).await?;

    let success = auth
        .authenticate(&request.identifier, &request.password, &ctx.client)
        .await?;

    let mut headers = HeaderMap::new();
    match session_cookie(&success.session_token) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    // The new session has its own CSRF token from here on.
    if let Some(preauth) = ctx.preauth_csrf.as_deref() {
        auth.discard_preauth_csrf_token(preauth).await;
        if let Ok(cookie) = clear_preauth_csrf_cookie() {
            headers.append(SET_COOKIE, cookie);
        }
    }

    Ok((StatusCode::OK, headers, Json(success.user)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session destroyed; cookie cleared"),
        (status = 403, description = "Missing or invalid CSRF token", body = ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn logout(
    Extension(auth): Extension<Arc<AuthService>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<impl IntoResponse, AuthError> {
    if let Some(token) = ctx.session_token() {
        auth.require_csrf_token(Some(token), ctx.csrf_token.as_deref(), &ctx.client)
            .await?;
        auth.logout(token, &ctx.client).await?;
    }

    let mut headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie() {
        headers.insert(SET_COOKIE, cookie);
    }
    Ok((StatusCode::NO_CONTENT, headers))
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Active session", body = SessionResponse),
        (status = 204, description = "No active session"),
    ),
    tag = "auth"
)]
pub async fn session(Extension(ctx): Extension<RequestContext>) -> impl IntoResponse {
    match ctx.user {
        Some(authenticated) => (
            StatusCode::OK,
            Json(SessionResponse {
                user: authenticated.user,
                csrf_token: authenticated.session.csrf_token,
            }),
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = User),
        (status = 400, description = "Input rejected by policy", body = ErrorResponse),
        (status = 403, description = "Missing or invalid CSRF token", body = ErrorResponse),
        (status = 409, description = "Username or email unavailable", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn register(
    Extension(auth): Extension<Arc<AuthService>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AuthError> {
    require_login_csrf(&auth, &ctx).await?;

    let user = auth
        .register(
            &request.username,
            &request.email,
            &request.password,
            &ctx.client,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/password",
    request_body = PasswordChangeRequest,
    responses(
        (status = 204, description = "Password changed; new session cookie set"),
        (status = 401, description = "No valid session or wrong current password", body = ErrorResponse),
        (status = 403, description = "Missing or invalid CSRF token", body = ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn change_password(
    Extension(auth): Extension<Arc<AuthService>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<PasswordChangeRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let user = ctx.require_user()?;
    auth.require_csrf_token(
        Some(&user.session.token),
        ctx.csrf_token.as_deref(),
        &ctx.client,
    )
    .await?;

    let token = auth
        .change_password(
            &user.session.token,
            &request.current_password,
            &request.new_password,
            &ctx.client,
        )
        .await?;

    let mut headers = HeaderMap::new();
    match session_cookie(&token) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    Ok((StatusCode::NO_CONTENT, headers))
}
