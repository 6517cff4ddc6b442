use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Operation, OperationStore, Snapshot};
use crate::{SyncError, SyncResult};

/// Everything stored for one document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLog {
    pub operations: Vec<Operation>,
    pub snapshots: BTreeMap<i64, Snapshot>,
    #[serde(skip)]
    revision: u64,
    #[serde(skip)]
    persisted_revision: u64,
}

impl DocumentLog {
    /// Timestamp for the next entry: wall clock, nudged forward so entries of
    /// one document never share or reverse a timestamp
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let last_op = self.operations.last().map(|op| op.created_at);
        let last_snapshot = self.snapshots.values().map(|s| s.created_at).max();

        match last_op.max(last_snapshot) {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        }
    }

    fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.values().next_back()
    }

    fn operations_after(&self, cutoff: Option<DateTime<Utc>>) -> impl Iterator<Item = &Operation> {
        self.operations
            .iter()
            .filter(move |op| cutoff.map_or(true, |cutoff| op.created_at > cutoff))
    }

    fn mark_changed(&mut self) {
        self.revision += 1;
    }

    pub fn is_dirty(&self) -> bool {
        self.revision != self.persisted_revision
    }
}

/// Thread-safe in-process operation store.
///
/// Each document's log sits behind one map entry, so appends and snapshot
/// writes for a document are serialized by that entry alone; different
/// documents never contend.
pub struct MemoryOperationStore {
    logs: DashMap<String, DocumentLog>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
        }
    }

    /// List all document IDs with a log
    pub fn list_documents(&self) -> Vec<String> {
        self.logs.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn document_count(&self) -> usize {
        self.logs.len()
    }

    /// Copy of a document's log with the revision it reflects
    pub fn export(&self, document_id: &str) -> Option<(DocumentLog, u64)> {
        self.logs
            .get(document_id)
            .map(|log| (log.value().clone(), log.revision))
    }

    /// Documents with changes not yet persisted
    pub fn dirty_documents(&self) -> Vec<String> {
        self.logs
            .iter()
            .filter(|entry| entry.value().is_dirty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Record that `revision` of a document reached durable storage. Later
    /// changes keep the document dirty.
    pub fn mark_persisted(&self, document_id: &str, revision: u64) {
        if let Some(mut log) = self.logs.get_mut(document_id) {
            if revision > log.persisted_revision {
                log.persisted_revision = revision;
            }
        }
    }

    /// Install a log loaded from durable storage
    pub fn restore(&self, document_id: impl Into<String>, mut log: DocumentLog) {
        let document_id = document_id.into();
        log.operations.sort_by_key(|op| op.created_at);
        log.revision = 0;
        log.persisted_revision = 0;
        info!(
            "Restored document {} ({} operations, {} snapshots)",
            document_id,
            log.operations.len(),
            log.snapshots.len()
        );
        self.logs.insert(document_id, log);
    }
}

impl Default for MemoryOperationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn append_operation(
        &self,
        document_id: &str,
        payload: String,
        session_id: &str,
    ) -> SyncResult<Operation> {
        let mut log = self.logs.entry(document_id.to_string()).or_default();

        let operation = Operation {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            payload,
            created_at: log.next_timestamp(),
            session_id: session_id.to_string(),
        };
        log.operations.push(operation.clone());
        log.mark_changed();

        Ok(operation)
    }

    async fn latest_snapshot(&self, document_id: &str) -> SyncResult<Option<Snapshot>> {
        Ok(self
            .logs
            .get(document_id)
            .and_then(|log| log.latest_snapshot().cloned()))
    }

    async fn operations_since(
        &self,
        document_id: &str,
        version: Option<i64>,
    ) -> SyncResult<Vec<Operation>> {
        let Some(log) = self.logs.get(document_id) else {
            return Ok(Vec::new());
        };

        let cutoff = match version {
            Some(v) => match log.snapshots.get(&v) {
                Some(snapshot) => Some(snapshot.created_at),
                None => {
                    debug!(
                        "Snapshot version {} unknown for document {}, returning full log",
                        v, document_id
                    );
                    None
                }
            },
            None => None,
        };

        let ops = log.operations_after(cutoff).cloned().collect();
        Ok(ops)
    }

    async fn next_snapshot_version(&self, document_id: &str) -> SyncResult<i64> {
        let latest = self
            .logs
            .get(document_id)
            .and_then(|log| log.snapshots.keys().next_back().copied());
        Ok(latest.map_or(1, |v| v + 1))
    }

    async fn write_snapshot(
        &self,
        document_id: &str,
        version: i64,
        payload: String,
    ) -> SyncResult<Option<Snapshot>> {
        if version < 1 {
            return Err(SyncError::Store(format!(
                "snapshot version must be positive, got {}",
                version
            )));
        }

        let mut log = self.logs.entry(document_id.to_string()).or_default();
        if log.snapshots.contains_key(&version) {
            debug!(
                "Snapshot version {} of document {} already exists",
                version, document_id
            );
            return Ok(None);
        }

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            version,
            payload,
            created_at: log.next_timestamp(),
        };
        log.snapshots.insert(version, snapshot.clone());
        log.mark_changed();

        Ok(Some(snapshot))
    }

    async fn count_operations_since_last_snapshot(&self, document_id: &str) -> SyncResult<usize> {
        let Some(log) = self.logs.get(document_id) else {
            return Ok(0);
        };
        let cutoff = log.latest_snapshot().map(|s| s.created_at);
        let count = log.operations_after(cutoff).count();
        Ok(count)
    }
}
