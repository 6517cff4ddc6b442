use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::time::Duration;
use tracing::debug;

use super::{Connection, ConnectionRegistry};
use crate::SyncResult;

/// In-process registry backed by concurrent maps.
///
/// Each write is atomic per key; the secondary indexes are updated after the
/// primary record and may briefly disagree with it, the same way a secondary
/// index in an external store would.
pub struct MemoryConnectionRegistry {
    connections: DashMap<String, Connection>,
    by_user: DashMap<String, DashSet<String>>,
    by_document: DashMap<String, DashSet<String>>,
}

impl MemoryConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            by_document: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn index_add(index: &DashMap<String, DashSet<String>>, key: &str, connection_id: &str) {
        index
            .entry(key.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    fn index_remove(index: &DashMap<String, DashSet<String>>, key: &str, connection_id: &str) {
        if let Some(set) = index.get(key) {
            set.remove(connection_id);
        }
        index.remove_if(key, |_, set| set.is_empty());
    }

    /// Add to the document index, then undo it if the primary record was
    /// deleted or moved in the meantime
    fn index_document(&self, document_id: &str, connection_id: &str) {
        Self::index_add(&self.by_document, document_id, connection_id);
        let still_there = self
            .connections
            .get(connection_id)
            .is_some_and(|c| c.is_in(document_id));
        if !still_there {
            Self::index_remove(&self.by_document, document_id, connection_id);
        }
    }

    /// Resolve index ids against the primary records, dropping stale ones
    fn resolve<F>(&self, ids: Vec<String>, keep: F) -> Vec<Connection>
    where
        F: Fn(&Connection) -> bool,
    {
        let now = Utc::now();
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|c| c.value().clone()))
            .filter(|c| !c.is_expired(now) && keep(c))
            .collect()
    }

    fn index_ids(index: &DashMap<String, DashSet<String>>, key: &str) -> Vec<String> {
        match index.get(key) {
            Some(set) => set.iter().map(|id| id.key().clone()).collect(),
            None => Vec::new(),
        }
    }
}

impl Default for MemoryConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryConnectionRegistry {
    async fn save(&self, connection: Connection) -> SyncResult<()> {
        let id = connection.connection_id.clone();
        let user_id = connection.user_id.clone();
        let document_id = connection.document_id.clone();

        if let Some(previous) = self.connections.insert(id.clone(), connection) {
            if let Some(old_doc) = previous.document_id.as_deref() {
                if document_id.as_deref() != Some(old_doc) {
                    Self::index_remove(&self.by_document, old_doc, &id);
                }
            }
        }

        Self::index_add(&self.by_user, &user_id, &id);
        if let Some(doc) = document_id.as_deref() {
            self.index_document(doc, &id);
        }
        Ok(())
    }

    async fn get(&self, connection_id: &str) -> SyncResult<Option<Connection>> {
        let found = self
            .connections
            .get(connection_id)
            .map(|c| c.value().clone());

        match found {
            Some(conn) if conn.is_expired(Utc::now()) => {
                debug!("Connection {} expired, dropping", connection_id);
                self.delete(connection_id).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn delete(&self, connection_id: &str) -> SyncResult<Option<Connection>> {
        let Some((_, removed)) = self.connections.remove(connection_id) else {
            return Ok(None);
        };

        Self::index_remove(&self.by_user, &removed.user_id, connection_id);
        if let Some(doc) = removed.document_id.as_deref() {
            Self::index_remove(&self.by_document, doc, connection_id);
        }
        Ok(Some(removed))
    }

    async fn by_user(&self, user_id: &str) -> SyncResult<Vec<Connection>> {
        let ids = Self::index_ids(&self.by_user, user_id);
        Ok(self.resolve(ids, |c| c.user_id == user_id))
    }

    async fn by_document(&self, document_id: &str) -> SyncResult<Vec<Connection>> {
        let ids = Self::index_ids(&self.by_document, document_id);
        Ok(self.resolve(ids, |c| c.is_in(document_id)))
    }

    async fn set_document(
        &self,
        connection_id: &str,
        document_id: Option<&str>,
        ttl: Duration,
    ) -> SyncResult<bool> {
        let previous = {
            let Some(mut conn) = self.connections.get_mut(connection_id) else {
                return Ok(false);
            };
            let previous = conn.document_id.take();
            conn.document_id = document_id.map(str::to_string);
            conn.refresh(Utc::now(), ttl);
            previous
        };

        if let Some(old_doc) = previous.as_deref() {
            if document_id != Some(old_doc) {
                Self::index_remove(&self.by_document, old_doc, connection_id);
            }
        }
        if let Some(doc) = document_id {
            self.index_document(doc, connection_id);
        }
        Ok(true)
    }

    async fn touch(&self, connection_id: &str, ttl: Duration) -> SyncResult<bool> {
        match self.connections.get_mut(connection_id) {
            Some(mut conn) => {
                conn.refresh(Utc::now(), ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_all(&self) -> SyncResult<Vec<Connection>> {
        Ok(self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn purge_expired(&self) -> SyncResult<usize> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for id in expired {
            if self.delete(&id).await?.is_some() {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!("Purged {} expired connections", purged);
        }
        Ok(purged)
    }
}
