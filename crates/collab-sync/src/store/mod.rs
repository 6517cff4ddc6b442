//! Ordered per-document log of opaque update blobs, plus compaction
//! snapshots authored by clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::SyncResult;

pub mod memory;

pub use memory::{DocumentLog, MemoryOperationStore};

/// One opaque update blob. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub document_id: String,
    /// Base64 text exactly as the client sent it
    pub payload: String,
    pub created_at: DateTime<Utc>,
    /// Connection that produced the operation
    pub session_id: String,
}

/// Full-state checkpoint at a per-document version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub document_id: String,
    pub version: i64,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn append_operation(
        &self,
        document_id: &str,
        payload: String,
        session_id: &str,
    ) -> SyncResult<Operation>;

    async fn latest_snapshot(&self, document_id: &str) -> SyncResult<Option<Snapshot>>;

    /// Operations created strictly after the snapshot at `version`, ascending
    /// by creation time. With no version, every operation of the document.
    async fn operations_since(
        &self,
        document_id: &str,
        version: Option<i64>,
    ) -> SyncResult<Vec<Operation>>;

    /// `1` for a document without snapshots, otherwise the highest version + 1
    async fn next_snapshot_version(&self, document_id: &str) -> SyncResult<i64>;

    /// Insert-or-ignore on (document, version). `Ok(None)` means another
    /// writer already created this version, which is not an error.
    async fn write_snapshot(
        &self,
        document_id: &str,
        version: i64,
        payload: String,
    ) -> SyncResult<Option<Snapshot>>;

    async fn count_operations_since_last_snapshot(&self, document_id: &str) -> SyncResult<usize>;
}

/// Decides when to hint clients that a snapshot is due.
///
/// The store never builds snapshot content itself; only clients hold
/// reconstructible state, so this only produces an advisory signal.
pub struct SnapshotCadence {
    op_threshold: usize,
    interval: Duration,
    documents: DashMap<String, CadenceState>,
}

struct CadenceState {
    last_hint: Instant,
    /// Pending op count when the last hint went out
    ops_at_hint: usize,
    last_seen: Instant,
}

impl CadenceState {
    fn new(now: Instant) -> Self {
        Self {
            last_hint: now,
            ops_at_hint: 0,
            last_seen: now,
        }
    }
}

impl SnapshotCadence {
    pub fn new(op_threshold: usize, interval: Duration) -> Self {
        Self {
            op_threshold,
            interval,
            documents: DashMap::new(),
        }
    }

    pub fn should_suggest(&self, document_id: &str, ops_since_snapshot: usize) -> bool {
        self.should_suggest_at(document_id, ops_since_snapshot, Instant::now())
    }

    /// True when another `op_threshold` operations piled up since the last
    /// hint, or when the interval passed since it. The first observation of a
    /// document only starts its timer.
    pub fn should_suggest_at(&self, document_id: &str, ops_since_snapshot: usize, now: Instant) -> bool {
        if ops_since_snapshot == 0 {
            return false;
        }

        let mut state = self
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| CadenceState::new(now));
        if now > state.last_seen {
            state.last_seen = now;
        }

        let by_count = ops_since_snapshot.saturating_sub(state.ops_at_hint) >= self.op_threshold;
        let by_time = now.saturating_duration_since(state.last_hint) > self.interval;
        if by_count || by_time {
            state.last_hint = now;
            state.ops_at_hint = ops_since_snapshot;
        }
        by_count || by_time
    }

    /// A snapshot was written; restart the timer and the count
    pub fn reset(&self, document_id: &str) {
        self.documents
            .insert(document_id.to_string(), CadenceState::new(Instant::now()));
    }

    /// Forget documents with no update for longer than the interval. Returns
    /// how many were dropped.
    pub fn prune_idle(&self, now: Instant) -> usize {
        let before = self.documents.len();
        self.documents
            .retain(|_, state| now.saturating_duration_since(state.last_seen) <= self.interval);
        before.saturating_sub(self.documents.len())
    }

    pub fn tracked_documents(&self) -> usize {
        self.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_by_count() {
        let cadence = SnapshotCadence::new(100, Duration::from_secs(300));
        let now = Instant::now();
        assert!(!cadence.should_suggest_at("d", 99, now));
        assert!(cadence.should_suggest_at("d", 100, now));
        assert!(!cadence.should_suggest_at("d", 0, now));
    }

    #[test]
    fn test_cadence_by_time() {
        let cadence = SnapshotCadence::new(100, Duration::from_secs(300));
        let start = Instant::now();
        assert!(!cadence.should_suggest_at("d", 1, start));
        assert!(!cadence.should_suggest_at("d", 2, start + Duration::from_secs(299)));
        assert!(cadence.should_suggest_at("d", 3, start + Duration::from_secs(301)));
        // Timer restarted by the hint
        assert!(!cadence.should_suggest_at("d", 4, start + Duration::from_secs(302)));
        // Documents are independent
        assert!(!cadence.should_suggest_at("e", 4, start + Duration::from_secs(400)));
    }

    #[test]
    fn test_count_hint_repeats_only_per_threshold() {
        let cadence = SnapshotCadence::new(100, Duration::from_secs(300));
        let now = Instant::now();
        assert!(cadence.should_suggest_at("d", 100, now));
        assert!(!cadence.should_suggest_at("d", 101, now));
        assert!(!cadence.should_suggest_at("d", 199, now));
        assert!(cadence.should_suggest_at("d", 200, now));

        cadence.reset("d");
        assert!(!cadence.should_suggest_at("d", 99, Instant::now()));
        assert!(cadence.should_suggest_at("d", 100, Instant::now()));
    }

    #[test]
    fn test_prune_idle_documents() {
        let cadence = SnapshotCadence::new(100, Duration::from_secs(300));
        let start = Instant::now();
        cadence.should_suggest_at("old", 1, start);
        cadence.should_suggest_at("busy", 1, start);
        cadence.should_suggest_at("busy", 2, start + Duration::from_secs(200));
        assert_eq!(cadence.tracked_documents(), 2);

        assert_eq!(cadence.prune_idle(start + Duration::from_secs(400)), 1);
        assert_eq!(cadence.tracked_documents(), 1);
        // Still tracked, so its timer was kept
        assert!(cadence.should_suggest_at("busy", 3, start + Duration::from_secs(401)));
    }
}
