use crate::{
    api,
    auth::{AuthConfig, AuthService},
    cli::telemetry,
    store::{MemoryStore, PgStore},
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

const MEMORY_DSN: &str = "memory://";

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: SecretString,
    pub auth: AuthConfig,
    pub session_sweep_interval: Duration,
    pub apply_schema: bool,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the store is unreachable, a stored role is malformed,
/// or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let auth = if args.dsn.expose_secret() == MEMORY_DSN {
        warn!("Using the in-memory store; accounts and sessions are lost on restart");
        AuthService::new(Arc::new(MemoryStore::new()), args.auth)
    } else {
        let store = PgStore::connect(&args.dsn)
            .await
            .context("Failed to connect to database")?;
        if args.apply_schema {
            store
                .apply_schema()
                .await
                .context("Failed to apply database schema")?;
            info!("Database schema applied");
        }
        AuthService::new(Arc::new(store), args.auth)
    };

    let roles = auth
        .validate_roles()
        .await
        .context("Role permission validation failed")?;
    info!(roles, "Role permissions validated");

    let result = api::new(args.port, Arc::new(auth), args.session_sweep_interval).await;
    telemetry::shutdown_tracer();
    result
}
