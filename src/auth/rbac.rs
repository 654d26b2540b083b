//! Role-based access control.
//!
//! A role's permissions are a map of resource to an ordered set of action
//! tokens. A token ending in `_own` grants the action only on resources the
//! acting user owns. Permission documents are parsed into [`PermissionSet`]
//! and validated when loaded; [`Rbac::validate_roles`] runs at startup so a
//! malformed document stops the service instead of silently denying.
//!
//! The `admin` role is allowed everything regardless of its stored document.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use super::{
    audit::{SecurityEventKind, SecurityLog},
    error::AuthError,
    types::OwnershipContext,
};
use crate::store::{RoleRecord, RoleStore, StoreError};

pub const ADMIN_ROLE: &str = "admin";
pub const DEFAULT_ROLE: &str = "user";
const OWN_SUFFIX: &str = "_own";

/// Built-in roles seeded into every store.
#[must_use]
pub fn default_roles() -> Vec<(&'static str, Value)> {
    vec![
        (ADMIN_ROLE, json!({})),
        (
            "editor",
            json!({
                "posts": ["create", "read", "update", "delete", "publish"],
                "comments": ["read", "moderate", "delete"],
            }),
        ),
        (
            DEFAULT_ROLE,
            json!({
                "posts": ["create", "read", "update_own", "delete_own"],
                "comments": ["create", "read", "update_own", "delete_own"],
            }),
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    #[error("permissions must be a JSON object")]
    NotAnObject,
    #[error("actions for resource {0:?} must be an array of strings")]
    NotAnActionList(String),
    #[error("invalid resource name {0:?}")]
    InvalidResource(String),
    #[error("invalid action token {0:?}")]
    InvalidAction(String),
}

/// One allowed action on a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub action: String,
    pub ownership_qualified: bool,
}

impl Grant {
    fn parse(token: &str) -> Result<Self, PermissionError> {
        if !is_identifier(token) {
            return Err(PermissionError::InvalidAction(token.to_string()));
        }
        match token.strip_suffix(OWN_SUFFIX) {
            Some(base) if base.is_empty() => Err(PermissionError::InvalidAction(token.to_string())),
            Some(base) => Ok(Self {
                action: base.to_string(),
                ownership_qualified: true,
            }),
            None => Ok(Self {
                action: token.to_string(),
                ownership_qualified: false,
            }),
        }
    }

    fn token(&self) -> String {
        if self.ownership_qualified {
            format!("{}{OWN_SUFFIX}", self.action)
        } else {
            self.action.clone()
        }
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionSet {
    grants: BTreeMap<String, Vec<Grant>>,
}

impl PermissionSet {
    /// Parse and validate a stored permission document. Duplicate tokens are
    /// collapsed, keeping the first occurrence.
    ///
    /// # Errors
    /// Returns [`PermissionError`] for anything but an object of string arrays
    /// with well-formed names.
    pub fn parse(document: &Value) -> Result<Self, PermissionError> {
        let object = document.as_object().ok_or(PermissionError::NotAnObject)?;
        let mut grants = BTreeMap::new();
        for (resource, actions) in object {
            if !is_identifier(resource) {
                return Err(PermissionError::InvalidResource(resource.clone()));
            }
            let tokens = actions
                .as_array()
                .ok_or_else(|| PermissionError::NotAnActionList(resource.clone()))?;
            let mut parsed: Vec<Grant> = Vec::with_capacity(tokens.len());
            for token in tokens {
                let token = token
                    .as_str()
                    .ok_or_else(|| PermissionError::NotAnActionList(resource.clone()))?;
                let grant = Grant::parse(token)?;
                if !parsed.contains(&grant) {
                    parsed.push(grant);
                }
            }
            grants.insert(resource.clone(), parsed);
        }
        Ok(Self { grants })
    }

    /// Serialize back to the stored document shape.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let object: Map<String, Value> = self
            .grants
            .iter()
            .map(|(resource, grants)| {
                let tokens = grants.iter().map(|grant| Value::String(grant.token())).collect();
                (resource.clone(), Value::Array(tokens))
            })
            .collect();
        Value::Object(object)
    }

    #[must_use]
    pub fn grants(&self, resource: &str) -> Option<&[Grant]> {
        self.grants.get(resource).map(Vec::as_slice)
    }

    /// `owned` is true when the acting user owns the target resource.
    #[must_use]
    pub fn allows(&self, resource: &str, action: &str, owned: bool) -> bool {
        let Some(grants) = self.grants.get(resource) else {
            return false;
        };
        // A literal `*_own` request matches the stored token verbatim.
        if let Some(base) = action.strip_suffix(OWN_SUFFIX) {
            if grants
                .iter()
                .any(|grant| grant.ownership_qualified && grant.action == base)
            {
                return true;
            }
        }
        grants.iter().any(|grant| {
            grant.action == action && (!grant.ownership_qualified || owned)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub permissions: PermissionSet,
}

impl Role {
    /// # Errors
    /// [`StoreError::MalformedPermissions`] when the document does not parse.
    pub fn from_record(record: RoleRecord) -> Result<Self, StoreError> {
        let permissions =
            PermissionSet::parse(&record.permissions).map_err(|err| {
                StoreError::MalformedPermissions {
                    role: record.name.clone(),
                    reason: err.to_string(),
                }
            })?;
        Ok(Self {
            id: record.id,
            name: record.name,
            permissions,
        })
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.name == ADMIN_ROLE
    }
}

/// Pure decision for `user_id` holding `role`.
#[must_use]
pub fn evaluate(
    role: &Role,
    user_id: Uuid,
    resource: &str,
    action: &str,
    context: Option<&OwnershipContext>,
) -> bool {
    if role.is_admin() {
        return true;
    }
    let owned = context.is_some_and(|context| context.owner_id == user_id);
    role.permissions.allows(resource, action, owned)
}

pub struct Rbac {
    store: Arc<dyn RoleStore>,
    audit: SecurityLog,
}

impl Rbac {
    pub fn new(store: Arc<dyn RoleStore>, audit: SecurityLog) -> Self {
        Self { store, audit }
    }

    /// Resolve and parse the user's role. A user without a role, or whose
    /// role document is malformed, resolves to `None`.
    async fn resolve_role(&self, user_id: Uuid) -> Result<Option<Role>, StoreError> {
        let Some(record) = self.store.role_for_user(user_id).await? else {
            return Ok(None);
        };
        match Role::from_record(record) {
            Ok(role) => Ok(Some(role)),
            Err(err) => {
                error!(%user_id, "Denying access: {err}");
                Ok(None)
            }
        }
    }

    /// Read-only permission check. Malformed role data denies.
    pub async fn has_permission(
        &self,
        user_id: Uuid,
        resource: &str,
        action: &str,
        context: Option<&OwnershipContext>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .resolve_role(user_id)
            .await?
            .is_some_and(|role| evaluate(&role, user_id, resource, action, context)))
    }

    /// Like [`Rbac::has_permission`], but a denial is recorded as
    /// `access_denied` and returned as [`AuthError::PermissionDenied`].
    /// A missing user id is an automatic denial.
    pub async fn require_permission(
        &self,
        user_id: Option<Uuid>,
        resource: &str,
        action: &str,
        context: Option<&OwnershipContext>,
    ) -> Result<(), AuthError> {
        let allowed = match user_id {
            Some(user_id) => self.has_permission(user_id, resource, action, context).await?,
            None => false,
        };
        if allowed {
            return Ok(());
        }
        self.audit
            .record(
                SecurityEventKind::AccessDenied,
                user_id,
                json!({
                    "resource": resource,
                    "action": action,
                    "owner_id": context.map(|context| context.owner_id),
                }),
            )
            .await;
        Err(AuthError::PermissionDenied)
    }

    /// Parse every stored role. Returns how many were checked.
    ///
    /// # Errors
    /// The first malformed role, or a store failure.
    pub async fn validate_roles(&self) -> Result<usize, StoreError> {
        let roles = self.store.list_roles().await?;
        for record in &roles {
            Role::from_record(record.clone())?;
        }
        Ok(roles.len())
    }

    pub async fn update_permissions(
        &self,
        role_id: Uuid,
        document: &Value,
    ) -> Result<bool, StoreError> {
        self.store.update_role_permissions(role_id, document).await
    }

    pub async fn role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError> {
        self.store
            .find_role_by_name(name)
            .await?
            .map(Role::from_record)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::SystemClock;
    use crate::store::{
        CredentialStore, InsertUserOutcome, MemoryStore, NewUser, SecurityEventStore,
    };
    use anyhow::{anyhow, Result};
    use chrono::Utc;

    fn role(name: &str, document: Value) -> Result<Role> {
        Ok(Role::from_record(RoleRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            permissions: document,
        })?)
    }

    async fn user_with_role(store: &MemoryStore, role_name: &str) -> Result<Uuid> {
        let role = store
            .find_role_by_name(role_name)
            .await?
            .ok_or_else(|| anyhow!("missing role {role_name}"))?;
        let username = format!("{role_name}_{}", Uuid::new_v4().simple());
        match store
            .insert_user(
                NewUser {
                    email: format!("{username}@example.com"),
                    username,
                    password_hash: "hash".to_string(),
                    role_id: role.id,
                },
                Utc::now(),
            )
            .await?
        {
            InsertUserOutcome::Created(user) => Ok(user.id),
            InsertUserOutcome::Conflict => Err(anyhow!("conflict")),
        }
    }

    fn rbac(store: &Arc<MemoryStore>) -> Rbac {
        Rbac::new(
            store.clone(),
            SecurityLog::new(store.clone(), Arc::new(SystemClock)),
        )
    }

    #[test]
    fn parse_splits_ownership_suffix() -> Result<()> {
        let set = PermissionSet::parse(&json!({"posts": ["read", "update_own", "read"]}))?;
        assert_eq!(
            set.grants("posts"),
            Some(
                &[
                    Grant {
                        action: "read".to_string(),
                        ownership_qualified: false
                    },
                    Grant {
                        action: "update".to_string(),
                        ownership_qualified: true
                    },
                ][..]
            )
        );
        assert_eq!(set.to_value(), json!({"posts": ["read", "update_own"]}));
        Ok(())
    }

    #[test]
    fn parse_rejects_malformed_documents() {
        assert_eq!(
            PermissionSet::parse(&json!(["posts"])),
            Err(PermissionError::NotAnObject)
        );
        assert_eq!(
            PermissionSet::parse(&json!({"posts": "read"})),
            Err(PermissionError::NotAnActionList("posts".to_string()))
        );
        assert_eq!(
            PermissionSet::parse(&json!({"posts": [1]})),
            Err(PermissionError::NotAnActionList("posts".to_string()))
        );
        assert_eq!(
            PermissionSet::parse(&json!({"posts": ["_own"]})),
            Err(PermissionError::InvalidAction("_own".to_string()))
        );
        assert_eq!(
            PermissionSet::parse(&json!({"Posts ": ["read"]})),
            Err(PermissionError::InvalidResource("Posts ".to_string()))
        );
    }

    #[test]
    fn default_roles_are_valid() {
        for (name, document) in default_roles() {
            assert!(PermissionSet::parse(&document).is_ok(), "role {name}");
        }
    }

    #[test]
    fn ownership_qualified_permission() -> Result<()> {
        let role = role("writer", json!({"posts": ["update_own"]}))?;
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert!(evaluate(&role, user, "posts", "update", Some(&OwnershipContext::owned_by(user))));
        assert!(!evaluate(&role, user, "posts", "update", Some(&OwnershipContext::owned_by(other))));
        assert!(!evaluate(&role, user, "posts", "update", None));
        assert!(evaluate(&role, user, "posts", "update_own", None));
        Ok(())
    }

    #[test]
    fn unlisted_resource_or_action_denies() -> Result<()> {
        let role = role("reader", json!({"posts": ["read"]}))?;
        let user = Uuid::new_v4();
        assert!(evaluate(&role, user, "posts", "read", None));
        assert!(!evaluate(&role, user, "posts", "delete", None));
        assert!(!evaluate(&role, user, "comments", "read", None));
        Ok(())
    }

    #[test]
    fn admin_short_circuits_empty_document() -> Result<()> {
        let admin = role(ADMIN_ROLE, json!({}))?;
        assert!(evaluate(&admin, Uuid::new_v4(), "anything", "delete", None));
        assert!(evaluate(&admin, Uuid::new_v4(), "roles", "manage", None));
        Ok(())
    }

    #[tokio::test]
    async fn has_permission_resolves_stored_roles() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let rbac = rbac(&store);
        let admin = user_with_role(&store, "admin").await?;
        let editor = user_with_role(&store, "editor").await?;
        let member = user_with_role(&store, "user").await?;

        assert!(rbac.has_permission(admin, "anything", "delete", None).await?);
        assert!(rbac.has_permission(editor, "posts", "publish", None).await?);
        assert!(!rbac.has_permission(member, "posts", "publish", None).await?);
        assert!(
            rbac.has_permission(member, "posts", "delete", Some(&OwnershipContext::owned_by(member)))
                .await?
        );
        assert!(!rbac.has_permission(Uuid::new_v4(), "posts", "read", None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_role_denies_at_request_time() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let rbac = rbac(&store);
        let member = user_with_role(&store, "user").await?;
        let role = store
            .find_role_by_name("user")
            .await?
            .ok_or_else(|| anyhow!("missing role"))?;
        store
            .update_role_permissions(role.id, &json!({"posts": "read"}))
            .await?;

        assert!(!rbac.has_permission(member, "posts", "read", None).await?);
        assert!(rbac.validate_roles().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn require_permission_logs_denials() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let rbac = rbac(&store);
        let member = user_with_role(&store, "user").await?;

        assert!(rbac.require_permission(Some(member), "posts", "read", None).await.is_ok());
        assert!(matches!(
            rbac.require_permission(Some(member), "roles", "manage", None).await,
            Err(AuthError::PermissionDenied)
        ));
        assert!(matches!(
            rbac.require_permission(None, "posts", "read", None).await,
            Err(AuthError::PermissionDenied)
        ));

        let events = store.recent_events(10).await?;
        let denials: Vec<_> = events
            .iter()
            .filter(|event| event.kind == SecurityEventKind::AccessDenied)
            .collect();
        assert_eq!(denials.len(), 2);
        assert_eq!(denials[0].actor, None);
        assert_eq!(denials[1].actor, Some(member));
        assert_eq!(denials[1].context["resource"], "roles");
        Ok(())
    }

    #[tokio::test]
    async fn store_outage_is_not_a_denial() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let rbac = rbac(&store);
        store.set_unavailable(true);
        assert!(matches!(
            rbac.require_permission(Some(Uuid::new_v4()), "posts", "read", None).await,
            Err(AuthError::Infrastructure(_))
        ));
        Ok(())
    }
}
