use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::store::{DocumentLog, MemoryOperationStore};

const LOG_EXTENSION: &str = "oplog";

/// Flushes changed document logs of the in-memory store to disk in the
/// background, one JSON file per document
pub struct PersistenceManager {
    store: Arc<MemoryOperationStore>,
    storage_path: PathBuf,
    check_interval: Duration,
    handles: JoinSet<()>,
}

impl PersistenceManager {
    pub fn new(store: Arc<MemoryOperationStore>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            storage_path: storage_path.into(),
            check_interval: Duration::from_secs(10),
            handles: JoinSet::new(),
        }
    }

    /// Set the interval for checking dirty documents
    pub fn set_check_interval(&mut self, interval: Duration) {
        self.check_interval = interval;
    }

    /// Start the background flush loop
    pub async fn start(&mut self) -> crate::SyncResult<()> {
        tokio::fs::create_dir_all(&self.storage_path).await?;

        info!(
            "Starting persistence manager with storage path: {:?}",
            self.storage_path
        );

        let store = self.store.clone();
        let storage_path = self.storage_path.clone();
        let check_interval = self.check_interval;

        self.handles.spawn(async move {
            let mut interval = interval(check_interval);

            loop {
                interval.tick().await;
                flush_dirty(&store, &storage_path).await;
            }
        });

        Ok(())
    }

    /// Stop the flush loop after one final pass
    pub async fn stop(&mut self) {
        info!("Stopping persistence manager");

        flush_dirty(&self.store, &self.storage_path).await;

        self.handles.abort_all();
        while let Some(result) = self.handles.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("Persistence task error: {}", e);
                }
            }
        }
    }

    /// Write every dirty document now. Returns how many were written.
    pub async fn flush(&self) -> usize {
        flush_dirty(&self.store, &self.storage_path).await
    }

    /// Load all document logs from storage. Call on startup, before serving.
    pub async fn load_all_documents(&self) -> crate::SyncResult<usize> {
        info!(
            "Loading documents from storage path: {:?}",
            self.storage_path
        );

        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(&self.storage_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(document_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match load_document(&self.store, document_id, &path).await {
                Ok(()) => loaded += 1,
                Err(e) => error!("Failed to load document from {:?}: {}", path, e),
            }
        }

        Ok(loaded)
    }
}

async fn flush_dirty(store: &MemoryOperationStore, storage_path: &Path) -> usize {
    let mut written = 0;
    for document_id in store.dirty_documents() {
        match persist_document(store, &document_id, storage_path).await {
            Ok(true) => {
                debug!("Persisted document '{}'", document_id);
                written += 1;
            }
            Ok(false) => {}
            Err(e) => error!("Failed to persist document '{}': {}", document_id, e),
        }
    }
    if written > 0 {
        info!("Persisted {} document(s)", written);
    }
    written
}

/// Write one document's log. Changes that land while the file is being
/// written keep the document dirty for the next pass.
async fn persist_document(
    store: &MemoryOperationStore,
    document_id: &str,
    storage_path: &Path,
) -> crate::SyncResult<bool> {
    let Some((log, revision)) = store.export(document_id) else {
        return Ok(false);
    };

    let file_path = storage_path.join(format!("{}.{}", document_id, LOG_EXTENSION));
    let json_data = serde_json::to_string_pretty(&log)?;
    tokio::fs::write(&file_path, json_data).await?;

    store.mark_persisted(document_id, revision);
    Ok(true)
}

async fn load_document(
    store: &MemoryOperationStore,
    document_id: &str,
    file_path: &Path,
) -> crate::SyncResult<()> {
    let json_data = tokio::fs::read_to_string(file_path).await?;
    let log: DocumentLog = serde_json::from_str(&json_data)?;
    store.restore(document_id, log);
    Ok(())
}
