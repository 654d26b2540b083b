use axum::{
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use std::sync::Arc;
use uuid::Uuid;

use super::types::{AssignRoleRequest, ErrorResponse};
use crate::{
    api::middleware::RequestContext,
    auth::{AuthError, AuthService},
};

#[utoipa::path(
    put,
    path = "/v1/admin/users/{id}/role",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = AssignRoleRequest,
    responses(
        (status = 204, description = "Role assigned"),
        (status = 400, description = "Unknown role", body = ErrorResponse),
        (status = 401, description = "No valid session", body = ErrorResponse),
        (status = 403, description = "Missing permission or CSRF token", body = ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn assign_role(
    Extension(auth): Extension<Arc<AuthService>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<AssignRoleRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let actor = ctx.require_user()?;
    auth.require_csrf_token(
        Some(&actor.session.token),
        ctx.csrf_token.as_deref(),
        &ctx.client,
    )
    .await?;
    auth.assign_role(actor.user.id, id, &request.role).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/deactivate",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 204, description = "User deactivated and signed out"),
        (status = 401, description = "No valid session", body = ErrorResponse),
        (status = 403, description = "Missing permission or CSRF token", body = ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn deactivate_user(
    Extension(auth): Extension<Arc<AuthService>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AuthError> {
    let actor = ctx.require_user()?;
    auth.require_csrf_token(
        Some(&actor.session.token),
        ctx.csrf_token.as_deref(),
        &ctx.client,
    )
    .await?;
    auth.deactivate_user(actor.user.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
