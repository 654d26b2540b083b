use crate::auth::AuthService;
use anyhow::Result;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware::from_fn_with_state,
    Extension, Router,
};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::sleep};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{debug, error, info, info_span, Span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

mod error;
pub(crate) mod handlers;
pub mod middleware;
mod openapi;

pub use middleware::RequestContext;
pub use openapi::openapi;

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Assemble the full application: documented routes, the per-request session
/// context and the tracing / request-id layers.
pub fn app(auth: Arc<AuthService>) -> Router {
    let (router, _openapi) = router().split_for_parts();
    router
        .layer(from_fn_with_state(auth.clone(), middleware::session_context))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(auth)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, auth: Arc<AuthService>, sweep_interval: Duration) -> Result<()> {
    spawn_session_sweeper(auth.clone(), sweep_interval);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app(auth).into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

/// Periodically delete idle sessions and elapsed rate-limit windows. Session
/// validation checks expiry on its own; this only keeps the tables small.
pub fn spawn_session_sweeper(
    auth: Arc<AuthService>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            match auth.purge_expired_sessions().await {
                Ok(purged) => debug!(purged, "Session sweep finished"),
                Err(err) => error!("Session sweep failed: {err}"),
            }
        }
    })
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

#[cfg(test)]
mod tests;
