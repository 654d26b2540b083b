//! HTTP mapping for [`AuthError`].

use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::error;

use crate::auth::AuthError;

pub(crate) fn status_for(err: &AuthError) -> StatusCode {
    match err {
        AuthError::InvalidCredentials | AuthError::SessionExpired | AuthError::SessionInvalid => {
            StatusCode::UNAUTHORIZED
        }
        AuthError::AccountLocked { .. } => StatusCode::LOCKED,
        AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        AuthError::CsrfInvalid | AuthError::PermissionDenied => StatusCode::FORBIDDEN,
        AuthError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        AuthError::Unavailable => StatusCode::CONFLICT,
        AuthError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = status_for(&self);

        let mut headers = HeaderMap::new();
        if let Some(seconds) = self.retry_after_seconds() {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                headers.insert(RETRY_AFTER, value);
            }
        }

        let body = match &self {
            AuthError::Infrastructure(err) => {
                error!("Auth request failed: {err}");
                json!({ "error": self.public_message() })
            }
            // Validation messages describe the caller's own input and are safe to return.
            AuthError::InvalidInput(detail) => {
                json!({ "error": self.public_message(), "detail": detail })
            }
            _ => json!({ "error": self.public_message() }),
        };

        (status, headers, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use chrono::Duration;

    #[test]
    fn status_codes() {
        assert_eq!(status_for(&AuthError::InvalidCredentials), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&AuthError::SessionExpired), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&AuthError::CsrfInvalid), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&AuthError::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&AuthError::Unavailable), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&AuthError::Infrastructure(StoreError::Crypto("rng".to_string()))),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn locked_response_carries_retry_after() {
        let response = AuthError::AccountLocked {
            remaining: Duration::seconds(90),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert_eq!(
            response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("90")
        );
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = AuthError::RateLimited {
            retry_after: Duration::seconds(12),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("12")
        );
    }
}
