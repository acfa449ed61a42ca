//! Durable document storage.
//!
//! ```text
//! ┌─────────────────────┐ save(text, state)  ┌────────────────────────────┐
//! │ SnapshotCoordinator │ ─────────────────► │ DocumentStore              │
//! └─────────────────────┘                    │  head     — text + replica │
//! ┌─────────────────────┐   get_or_create    │             state          │
//! │ DocumentRegistry    │ ◄───────────────── │  versions — append-only    │
//! └─────────────────────┘                    │  history 1, 2, 3, …        │
//!                                            └────────────────────────────┘
//! ```
//!
//! Every save appends version `latest + 1`; rollback moves the head back to
//! an older version's content without appending. The head also keeps the
//! replica state, so every instance hydrating a document mints the same
//! element ids. A save never replaces state of a newer lineage.

pub mod memory;
pub mod rocks;

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::DocumentId;
use crate::replica::{Lineage, ReplicaId, ReplicaState};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Current head of a document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoredDocument {
    pub content: String,
    /// Latest saved version, 0 when never saved
    pub version: u64,
    pub state: ReplicaState,
}

/// One entry of a document's append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub document_id: DocumentId,
    pub version: u64,
    pub content: String,
    /// Seconds since epoch
    pub created_at: u64,
}

/// Persistence contract used by the registry, the snapshot coordinator and
/// rollback.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current head, creating an empty document on first access.
    async fn get_or_create(&self, document_id: &DocumentId) -> Result<StoredDocument, StoreError>;

    /// Set the current content and state and append a new version.
    /// Returns the version number.
    ///
    /// Fails with [`StoreError::Superseded`] when the head already belongs
    /// to a newer lineage.
    async fn save(
        &self,
        document_id: &DocumentId,
        content: &str,
        state: &ReplicaState,
    ) -> Result<u64, StoreError>;

    /// Make `version`'s content current again under the lineage following
    /// the head's, minted from `seed`. Returns the new head.
    async fn rollback(
        &self,
        document_id: &DocumentId,
        version: u64,
        seed: ReplicaId,
    ) -> Result<StoredDocument, StoreError>;

    /// History in ascending version order.
    async fn versions(&self, document_id: &DocumentId) -> Result<Vec<VersionRecord>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    VersionNotFound { document_id: DocumentId, version: u64 },
    /// A rollback moved the head to a newer lineage than the saved state's
    Superseded { document_id: DocumentId, head: Lineage },
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Store refused or could not serve the request
    Unavailable(String),
    /// Stored key did not decode
    InvalidKey(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::VersionNotFound { document_id, version } => {
                write!(f, "Version {version} not found for document {document_id}")
            }
            StoreError::Superseded { document_id, head } => {
                write!(f, "Document {document_id} was rolled back (lineage {head})")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::InvalidKey(e) => write!(f, "Invalid key: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Whether a save of `incoming` may replace the head `stored`.
pub(crate) fn check_lineage(
    document_id: &DocumentId,
    stored: &ReplicaState,
    incoming: &ReplicaState,
) -> Result<(), StoreError> {
    if incoming.lineage < stored.lineage {
        return Err(StoreError::Superseded {
            document_id: document_id.clone(),
            head: stored.lineage,
        });
    }
    Ok(())
}

/// Seconds since the Unix epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
