//! Interfaces to the collaborators this core consumes but does not own:
//! identity verification, document access resolution and user lookup.
//!
//! The `Static*` implementations are in-memory tables for tests and the
//! example server.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// A user's role on one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
    None,
}

impl Role {
    /// Owners and editors may append operations and snapshots
    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    pub fn can_read(&self) -> bool {
        !matches!(self, Role::None)
    }
}

/// Verified identity behind a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

/// Display information used in presence events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve a bearer token. Fails with `SyncError::Auth` for a bad,
    /// missing or expired token.
    async fn verify(&self, token: &str) -> SyncResult<Identity>;
}

#[async_trait]
pub trait AccessResolver: Send + Sync {
    async fn check_access(&self, document_id: &str, user_id: &str) -> SyncResult<Role>;

    /// Owner and collaborators of a document, regardless of whether they are
    /// connected
    async fn document_members(&self, document_id: &str) -> SyncResult<Vec<String>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn profile(&self, user_id: &str) -> SyncResult<Option<UserProfile>>;
}

/// Token table
#[derive(Default)]
pub struct StaticIdentityVerifier {
    tokens: DashMap<String, Identity>,
}

impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user_id: impl Into<String>, email: Option<&str>) {
        self.tokens.insert(
            token.into(),
            Identity {
                user_id: user_id.into(),
                email: email.map(str::to_string),
            },
        );
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, token: &str) -> SyncResult<Identity> {
        if token.is_empty() {
            return Err(SyncError::Auth("missing token".to_string()));
        }
        self.tokens
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SyncError::Auth("invalid or expired token".to_string()))
    }
}

/// Role table keyed by document, then user
#[derive(Default)]
pub struct StaticAccessResolver {
    grants: DashMap<String, DashMap<String, Role>>,
}

impl StaticAccessResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, document_id: impl Into<String>, user_id: impl Into<String>, role: Role) {
        self.grants
            .entry(document_id.into())
            .or_default()
            .insert(user_id.into(), role);
    }

    pub fn revoke(&self, document_id: &str, user_id: &str) {
        if let Some(users) = self.grants.get(document_id) {
            users.remove(user_id);
        }
    }
}

#[async_trait]
impl AccessResolver for StaticAccessResolver {
    async fn check_access(&self, document_id: &str, user_id: &str) -> SyncResult<Role> {
        let Some(users) = self.grants.get(document_id) else {
            return Ok(Role::None);
        };
        let role = users.get(user_id).map(|role| *role).unwrap_or(Role::None);
        Ok(role)
    }

    async fn document_members(&self, document_id: &str) -> SyncResult<Vec<String>> {
        let Some(users) = self.grants.get(document_id) else {
            return Ok(Vec::new());
        };
        let members = users
            .iter()
            .filter(|entry| entry.value().can_read())
            .map(|entry| entry.key().clone())
            .collect();
        Ok(members)
    }
}

#[derive(Default)]
pub struct StaticUserDirectory {
    profiles: DashMap<String, UserProfile>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: impl Into<String>, name: Option<&str>, email: Option<&str>) {
        self.profiles.insert(
            user_id.into(),
            UserProfile {
                name: name.map(str::to_string),
                email: email.map(str::to_string),
            },
        );
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn profile(&self, user_id: &str) -> SyncResult<Option<UserProfile>> {
        Ok(self.profiles.get(user_id).map(|p| p.value().clone()))
    }
}
