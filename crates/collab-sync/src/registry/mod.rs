use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::SyncResult;

pub mod memory;

pub use memory::MemoryConnectionRegistry;

/// One live transport session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    /// Set by `join`; authoritative for routing once present
    pub document_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Where pushes for this connection are addressed
    pub endpoint: String,
    pub expires_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        endpoint: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            document_id: None,
            connected_at: now,
            last_activity_at: now,
            endpoint: endpoint.into(),
            expires_at: expiry_from(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time since the last inbound traffic
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).to_std().unwrap_or_default()
    }

    /// Time since the connection was accepted
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.connected_at).to_std().unwrap_or_default()
    }

    pub fn is_in(&self, document_id: &str) -> bool {
        self.document_id.as_deref() == Some(document_id)
    }

    /// Advance activity and push the expiry out by `ttl`
    pub fn refresh(&mut self, now: DateTime<Utc>, ttl: Duration) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
        self.expires_at = expiry_from(self.last_activity_at, ttl);
    }
}

pub(crate) fn expiry_from(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Durable record of open connections, indexed by id, user and document.
///
/// The user and document indexes may lag the primary record. Callers that
/// need exact room membership must merge in a second source (see
/// [`crate::broadcast::Broadcaster`]).
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn save(&self, connection: Connection) -> SyncResult<()>;

    async fn get(&self, connection_id: &str) -> SyncResult<Option<Connection>>;

    /// Remove a connection, returning the removed record if it existed
    async fn delete(&self, connection_id: &str) -> SyncResult<Option<Connection>>;

    async fn by_user(&self, user_id: &str) -> SyncResult<Vec<Connection>>;

    async fn by_document(&self, document_id: &str) -> SyncResult<Vec<Connection>>;

    /// Attach the connection to a document, or detach it with `None`.
    /// Returns false if the connection is unknown.
    /// Also refreshes the rolling expiry by `ttl`.
    async fn set_document(
        &self,
        connection_id: &str,
        document_id: Option<&str>,
        ttl: Duration,
    ) -> SyncResult<bool>;

    /// Refresh activity time and push the expiry out by `ttl`. Returns false
    /// if unknown.
    async fn touch(&self, connection_id: &str, ttl: Duration) -> SyncResult<bool>;

    async fn count_by_user(&self, user_id: &str) -> SyncResult<usize> {
        Ok(self.by_user(user_id).await?.len())
    }

    async fn count_by_document(&self, document_id: &str) -> SyncResult<usize> {
        Ok(self.by_document(document_id).await?.len())
    }

    async fn list_all(&self) -> SyncResult<Vec<Connection>>;

    /// Drop entries whose rolling expiry has passed. Returns how many.
    async fn purge_expired(&self) -> SyncResult<usize>;
}
