//! In-memory document store, used for single-process deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_lineage, now_secs, DocumentStore, StoreError, StoredDocument, VersionRecord};
use crate::protocol::DocumentId;
use crate::replica::{ReplicaId, ReplicaState};

#[derive(Debug, Default)]
struct Entry {
    content: String,
    state: ReplicaState,
    history: Vec<VersionRecord>,
}

impl Entry {
    fn latest_version(&self) -> u64 {
        self.history.last().map_or(0, |r| r.version)
    }

    fn head(&self) -> StoredDocument {
        StoredDocument {
            content: self.content.clone(),
            version: self.latest_version(),
            state: self.state.clone(),
        }
    }
}

/// Volatile [`DocumentStore`]; everything is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents ever created.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_or_create(&self, document_id: &DocumentId) -> Result<StoredDocument, StoreError> {
        if let Some(entry) = self.documents.read().await.get(document_id) {
            return Ok(entry.head());
        }

        let mut documents = self.documents.write().await;
        let entry = documents.entry(document_id.clone()).or_insert_with(|| {
            log::debug!("Created document {document_id}");
            Entry::default()
        });
        Ok(entry.head())
    }

    async fn save(
        &self,
        document_id: &DocumentId,
        content: &str,
        state: &ReplicaState,
    ) -> Result<u64, StoreError> {
        let mut documents = self.documents.write().await;
        let entry = documents.entry(document_id.clone()).or_default();
        check_lineage(document_id, &entry.state, state)?;

        let version = entry.latest_version() + 1;
        entry.content = content.to_string();
        entry.state = state.clone();
        entry.history.push(VersionRecord {
            document_id: document_id.clone(),
            version,
            content: content.to_string(),
            created_at: now_secs(),
        });
        Ok(version)
    }

    async fn rollback(
        &self,
        document_id: &DocumentId,
        version: u64,
        seed: ReplicaId,
    ) -> Result<StoredDocument, StoreError> {
        let mut documents = self.documents.write().await;
        let not_found = || StoreError::VersionNotFound {
            document_id: document_id.clone(),
            version,
        };

        let entry = documents.get_mut(document_id).ok_or_else(not_found)?;
        let content = entry
            .history
            .iter()
            .find(|r| r.version == version)
            .map(|r| r.content.clone())
            .ok_or_else(not_found)?;
        entry.content = content;
        entry.state = ReplicaState::loaded(entry.state.lineage.next(seed));
        Ok(entry.head())
    }

    async fn versions(&self, document_id: &DocumentId) -> Result<Vec<VersionRecord>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .get(document_id)
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }
}
