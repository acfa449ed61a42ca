//! # quill-collab — replicated collaborative text engine
//!
//! Many clients edit the same plain-text document; edits converge through a
//! sequence CRDT, fan out to local sockets and to sibling server instances,
//! and are persisted by a periodic snapshot.
//!
//! ## Architecture
//!
//! ```text
//!  Client ──ws──┐                                    ┌── sibling instance
//!               ▼                                    │
//!        ┌─────────────┐  publish   ┌──────────────┐ │
//!        │ CollabServer│──────────► │ReplicationBus│◄┘
//!        └──────┬──────┘            └──────┬───────┘
//!               ▼                          │ listener
//!        ┌─────────────┐ ◄─────────────────┘
//!        │ FanoutHub   │ ── broadcast_content ──► ClientHandles
//!        └──────┬──────┘
//!               ▼
//!        ┌─────────────────┐   dirty   ┌────────────────────┐   save   ┌───────────────┐
//!        │DocumentRegistry │ ◄──────── │SnapshotCoordinator │ ───────► │ DocumentStore │
//!        │ actor ▸ Replica │           └────────────────────┘          │ Memory/RocksDB│
//!        └─────────────────┘ ◄──────────── hydrate ────────────────────└───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`] — sequence CRDT (elements, tombstones, causal buffering)
//! - [`diff`] — full-text to splice diff
//! - [`registry`] — per-document actors, lazy hydration
//! - [`hub`] — local fanout, bus bridge, state sync, rollback
//! - [`bus`] — replication bus trait, envelope, in-process and Redis buses
//! - [`snapshot`] — dirty tracking and periodic saves
//! - [`storage`] — store trait, in-memory and RocksDB stores
//! - [`protocol`] — JSON client protocol
//! - [`server`] — WebSocket transport

pub mod bus;
pub mod diff;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod server;
pub mod snapshot;
pub mod storage;

// Re-exports for convenience
pub use bus::{
    spawn_listener, spawn_listener_on, BusEnvelope, BusError, BusEvent, BusStream, LocalBus, RedisBus,
    ReplicationBus, Replicated,
};
pub use diff::{text_edit, TextEdit};
pub use hub::{ClientHandle, Delivery, FanoutHub, HubError, HubStats};
pub use protocol::{ClientMessage, DocumentId, ProtocolError, ServerMessage};
pub use registry::{
    DocumentHandle, DocumentRegistry, DocumentSnapshot, EditOutcome, LineageMatch, RegistryConfig,
    RegistryError, RemoteOutcome, Rendered,
};
pub use replica::{Element, ElementId, Lineage, Operation, Replica, ReplicaId, ReplicaState, ReplicaStats};
pub use server::{document_id_from_path, CollabServer, ServerConfig, ServerStats};
pub use snapshot::{FlushReport, SnapshotConfig, SnapshotCoordinator, SnapshotStats};
pub use storage::{
    DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError, StoredDocument, VersionRecord,
};
