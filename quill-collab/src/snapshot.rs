//! Periodic persistence of edited documents.
//!
//! Edits only mark a document dirty; a timer flushes the dirty set, so a
//! burst of keystrokes costs one save per interval instead of one per
//! keystroke.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::protocol::DocumentId;
use crate::registry::DocumentRegistry;
use crate::storage::{DocumentStore, StoreError};

/// Snapshot configuration.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Time between flushes (default: 5s)
    pub interval: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(5) }
    }
}

impl SnapshotConfig {
    pub fn for_testing() -> Self {
        Self { interval: Duration::from_millis(50) }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub saved: usize,
    pub failed: usize,
    /// Dirty documents no longer hydrated in this process
    pub skipped: usize,
    /// Saves refused because the document was rolled back meanwhile
    pub superseded: usize,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub flushes: u64,
    pub saved: u64,
    pub failed: u64,
    pub dirty: usize,
}

/// Tracks dirty documents and saves their text plus replica state.
pub struct SnapshotCoordinator {
    registry: Arc<DocumentRegistry>,
    store: Arc<dyn DocumentStore>,
    config: SnapshotConfig,
    dirty: Mutex<HashSet<DocumentId>>,
    flushes: AtomicU64,
    saved: AtomicU64,
    failed: AtomicU64,
}

impl SnapshotCoordinator {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        store: Arc<dyn DocumentStore>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            dirty: Mutex::new(HashSet::new()),
            flushes: AtomicU64::new(0),
            saved: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub async fn mark_dirty(&self, document_id: &DocumentId) {
        self.dirty.lock().await.insert(document_id.clone());
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.lock().await.len()
    }

    /// Save every dirty document once.
    ///
    /// The dirty set is swapped out first, so marks arriving during the
    /// flush land in the next one. Failed saves are logged and dropped; the
    /// document is saved again only after its next edit. A save from before
    /// a rollback is refused by the store; the rollback marks the document
    /// dirty again, so nothing is retried.
    pub async fn flush(&self) -> FlushReport {
        let batch = std::mem::take(&mut *self.dirty.lock().await);
        let mut report = FlushReport::default();

        for document_id in batch {
            let Some(handle) = self.registry.get(&document_id).await else {
                log::warn!("Dirty document {document_id} is not hydrated, skipping");
                report.skipped += 1;
                continue;
            };

            let snapshot = match handle.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::error!("Failed to snapshot {document_id}: {e}");
                    report.failed += 1;
                    continue;
                }
            };

            match self.store.save(&document_id, &snapshot.content, &snapshot.state).await {
                Ok(version) => {
                    log::debug!("Saved {document_id} as version {version}");
                    report.saved += 1;
                }
                Err(e @ StoreError::Superseded { .. }) => {
                    log::info!("Skipping snapshot of {document_id}: {e}");
                    report.superseded += 1;
                }
                Err(e) => {
                    log::error!("Failed to save snapshot of {document_id}: {e}");
                    report.failed += 1;
                }
            }
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.saved.fetch_add(report.saved as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        if report.saved + report.failed + report.superseded > 0 {
            log::info!(
                "Snapshot flush: {} saved, {} failed, {} skipped, {} superseded",
                report.saved,
                report.failed,
                report.skipped,
                report.superseded
            );
        }
        report
    }

    /// Run [`flush`](Self::flush) every `config.interval` until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.flush().await;
            }
        })
    }

    pub async fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dirty: self.dirty_count().await,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::replica::{Lineage, ReplicaId, ReplicaState};
    use crate::storage::{MemoryStore, StoredDocument, VersionRecord};
    use async_trait::async_trait;

    /// Store that fails saves for one document.
    struct PickyStore {
        inner: MemoryStore,
        reject: DocumentId,
    }

    #[async_trait]
    impl DocumentStore for PickyStore {
        async fn get_or_create(&self, id: &DocumentId) -> Result<StoredDocument, StoreError> {
            self.inner.get_or_create(id).await
        }
        async fn save(&self, id: &DocumentId, content: &str, state: &ReplicaState) -> Result<u64, StoreError> {
            if *id == self.reject {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.save(id, content, state).await
        }
        async fn rollback(&self, id: &DocumentId, version: u64, seed: ReplicaId) -> Result<StoredDocument, StoreError> {
            self.inner.rollback(id, version, seed).await
        }
        async fn versions(&self, id: &DocumentId) -> Result<Vec<VersionRecord>, StoreError> {
            self.inner.versions(id).await
        }
    }

    fn coordinator(store: Arc<dyn DocumentStore>) -> (Arc<DocumentRegistry>, SnapshotCoordinator) {
        let registry = Arc::new(DocumentRegistry::new(
            ReplicaId(1),
            store.clone(),
            RegistryConfig::for_testing(),
        ));
        let snapshots = SnapshotCoordinator::new(registry.clone(), store, SnapshotConfig::for_testing());
        (registry, snapshots)
    }

    #[tokio::test]
    async fn test_repeated_marks_coalesce_into_one_save() {
        let store = Arc::new(MemoryStore::new());
        let (registry, snapshots) = coordinator(store.clone());
        let doc = DocumentId::from("doc");
        let handle = registry.get_or_create(&doc).await.unwrap();

        for text in ["h", "he", "hel", "hell", "hello"] {
            handle.edit(text.into()).await.unwrap();
            snapshots.mark_dirty(&doc).await;
        }
        assert_eq!(snapshots.dirty_count().await, 1);

        let report = snapshots.flush().await;
        assert_eq!(report, FlushReport { saved: 1, ..Default::default() });

        let versions = store.versions(&doc).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].content, "hello");
        assert_eq!(snapshots.dirty_count().await, 0);

        // The head keeps the element ids along with the text.
        let head = store.get_or_create(&doc).await.unwrap();
        assert_eq!(head.state, handle.snapshot().await.unwrap().state);
    }

    #[tokio::test]
    async fn test_save_from_before_rollback_is_superseded() {
        let store = Arc::new(MemoryStore::new());
        let (registry, snapshots) = coordinator(store.clone());
        let doc = DocumentId::from("doc");
        let handle = registry.get_or_create(&doc).await.unwrap();
        handle.edit("first".into()).await.unwrap();
        snapshots.mark_dirty(&doc).await;
        snapshots.flush().await;

        // Another instance rolls back while this one still has older edits.
        handle.edit("first, unsaved".into()).await.unwrap();
        snapshots.mark_dirty(&doc).await;
        store.rollback(&doc, 1, ReplicaId(9)).await.unwrap();

        let report = snapshots.flush().await;
        assert_eq!(report, FlushReport { superseded: 1, ..Default::default() });
        let head = store.get_or_create(&doc).await.unwrap();
        assert_eq!(head.content, "first");
        assert_eq!(head.state.lineage, Lineage::ORIGIN.next(ReplicaId(9)));
        assert_eq!(store.versions(&doc).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_marking_twice_keeps_one_entry() {
        let (_registry, snapshots) = coordinator(Arc::new(MemoryStore::new()));
        let doc = DocumentId::from("doc");
        snapshots.mark_dirty(&doc).await;
        snapshots.mark_dirty(&doc).await;
        snapshots.mark_dirty(&"other".into()).await;
        assert_eq!(snapshots.dirty_count().await, 2);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_dirty() {
        let (_registry, snapshots) = coordinator(Arc::new(MemoryStore::new()));
        assert_eq!(snapshots.flush().await, FlushReport::default());
        assert_eq!(snapshots.stats().await.flushes, 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_documents() {
        let store = Arc::new(PickyStore { inner: MemoryStore::new(), reject: "bad".into() });
        let (registry, snapshots) = coordinator(store.clone());

        for id in ["good", "bad"] {
            let doc = DocumentId::from(id);
            registry.get_or_create(&doc).await.unwrap().edit(id.into()).await.unwrap();
            snapshots.mark_dirty(&doc).await;
        }

        let report = snapshots.flush().await;
        assert_eq!(report.saved, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(store.inner.get_or_create(&"good".into()).await.unwrap().content, "good");

        // Not retried until marked again.
        assert_eq!(snapshots.dirty_count().await, 0);
        assert_eq!(snapshots.flush().await, FlushReport::default());
        assert_eq!(snapshots.stats().await.failed, 1);
    }

    #[tokio::test]
    async fn test_unhydrated_document_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let (_registry, snapshots) = coordinator(store.clone());
        snapshots.mark_dirty(&"ghost".into()).await;

        let report = snapshots.flush().await;
        assert_eq!(report.skipped, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_spawned_timer_flushes() {
        let store = Arc::new(MemoryStore::new());
        let (registry, snapshots) = coordinator(store.clone());
        let snapshots = Arc::new(snapshots);
        let doc = DocumentId::from("doc");

        registry.get_or_create(&doc).await.unwrap().edit("tick".into()).await.unwrap();
        snapshots.mark_dirty(&doc).await;

        let timer = snapshots.clone().spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;
        timer.abort();

        assert_eq!(store.versions(&doc).await.unwrap().len(), 1);
        assert!(snapshots.stats().await.flushes >= 1);
    }
}
