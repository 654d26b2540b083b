//! Domain types shared by the auth components and the storage contract.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// A registered account as seen by collaborators. Credentials never leave the
/// store adapter through this type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role_id: Uuid,
    pub active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Client-supplied request signals. Both values are spoofable and only ever
/// used as tamper-evidence and rate-limit keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientContext {
    #[must_use]
    pub fn new(ip: Option<String>, user_agent: Option<String>) -> Self {
        Self { ip, user_agent }
    }
}

/// Ownership information for ownership-qualified (`*_own`) permissions.
/// Supplied by the caller; the RBAC engine never loads the resource itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnershipContext {
    pub owner_id: Uuid,
}

impl OwnershipContext {
    #[must_use]
    pub fn owned_by(owner_id: Uuid) -> Self {
        Self { owner_id }
    }
}
