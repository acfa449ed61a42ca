//! Connection fanout for local sockets, bridged to the replication bus.
//!
//! ```text
//!  socket ─ClientMessage─► handle_client ─► DocumentHandle (apply)
//!                                │
//!                                ├─► broadcast_content ─► every ClientHandle of the doc
//!                                └─► bus.publish(BusEnvelope)
//!
//!  bus listener ─► on_bus_message ─► DocumentHandle (apply) ─► broadcast_content
//! ```
//!
//! An instance also receives its own publications; those are dropped by
//! event id, and edits whose operations are all known already are dropped
//! as no-ops. Events from the bus are never relayed. The only publications
//! they trigger are state transfers:
//!
//! - **Hydration** — an instance that loads a document from the store asks
//!   its siblings for their state, which may hold edits not yet saved.
//! - **Lag** — a listener that lost messages asks again for every document
//!   it holds and offers its own state.
//! - **Lineage mismatch** — a message from before a rollback is answered
//!   with the current state; one from after a rollback this instance missed
//!   triggers a request.
//!
//! Content frames carry the document revision that produced them. Each
//! handle remembers the last revision it queued and drops older frames,
//! so a client always ends on the latest text even when two tasks
//! broadcast concurrently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::bus::{BusEnvelope, ReplicationBus, Replicated};
use crate::protocol::{ClientMessage, DocumentId, ProtocolError, ServerMessage};
use crate::registry::{DocumentHandle, DocumentRegistry, LineageMatch, RegistryError};
use crate::replica::{Lineage, Operation, ReplicaId, ReplicaState};
use crate::snapshot::SnapshotCoordinator;
use crate::storage::{DocumentStore, StoreError};

/// Remembered bus event ids, oldest evicted first.
const SEEN_EVENTS_CAPACITY: usize = 4096;

/// Result of queueing a frame on a [`ClientHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// A frame from a later revision was already queued
    Superseded,
    /// Connection gone or not keeping up
    Closed,
}

/// Outbound side of one local connection.
///
/// Frames are pre-encoded JSON, shared between all recipients of a broadcast.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: Uuid,
    sender: mpsc::Sender<Arc<str>>,
    /// Revision of the last content frame queued
    revision: Arc<parking_lot::Mutex<Option<u64>>>,
}

impl ClientHandle {
    pub fn new(sender: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            revision: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// A handle plus the receiving end its connection task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a frame without waiting. `false` when the connection is gone
    /// or not keeping up.
    pub fn deliver(&self, frame: Arc<str>) -> bool {
        self.sender.try_send(frame).is_ok()
    }

    /// Queue a content frame produced by `revision`, unless a frame from a
    /// later revision was queued before.
    ///
    /// The check and the send happen under one lock, so content frames
    /// enter the queue in revision order. Frames of equal revision carry
    /// the same text and are all queued.
    pub fn deliver_revision(&self, revision: u64, frame: Arc<str>) -> Delivery {
        let mut last = self.revision.lock();
        if last.is_some_and(|last| revision < last) {
            return Delivery::Superseded;
        }
        match self.sender.try_send(frame) {
            Ok(()) => {
                *last = Some(revision);
                Delivery::Sent
            }
            Err(_) => Delivery::Closed,
        }
    }
}

/// Hub errors.
#[derive(Debug, Clone)]
pub enum HubError {
    Registry(RegistryError),
    Store(StoreError),
    Protocol(ProtocolError),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::Registry(e) => write!(f, "Registry error: {e}"),
            HubError::Store(e) => write!(f, "Store error: {e}"),
            HubError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<RegistryError> for HubError {
    fn from(e: RegistryError) -> Self {
        HubError::Registry(e)
    }
}

impl From<StoreError> for HubError {
    fn from(e: StoreError) -> Self {
        HubError::Store(e)
    }
}

impl From<ProtocolError> for HubError {
    fn from(e: ProtocolError) -> Self {
        HubError::Protocol(e)
    }
}

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub delivered: u64,
    /// Content frames dropped because a newer one was already queued
    pub superseded: u64,
    pub dropped_handles: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub bus_applied: u64,
    pub echoes_suppressed: u64,
    /// Times the bus listener lost messages or its subscription
    pub lag_events: u64,
    pub sync_requests: u64,
    pub states_sent: u64,
    pub active_documents: usize,
    pub connections: usize,
}

/// Lock-free counters, read through [`FanoutHub::stats`].
#[derive(Default)]
struct AtomicHubStats {
    delivered: AtomicU64,
    superseded: AtomicU64,
    dropped_handles: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    bus_applied: AtomicU64,
    echoes_suppressed: AtomicU64,
    lag_events: AtomicU64,
    sync_requests: AtomicU64,
    states_sent: AtomicU64,
}

/// Bounded set of recently seen bus event ids.
#[derive(Debug, Default)]
struct SeenEvents {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl SeenEvents {
    /// Record `id`; `false` if it was already present.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_EVENTS_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Per-document local connection sets plus the bus bridge.
pub struct FanoutHub {
    registry: Arc<DocumentRegistry>,
    snapshots: Arc<SnapshotCoordinator>,
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn ReplicationBus>,
    connections: RwLock<HashMap<DocumentId, HashMap<Uuid, ClientHandle>>>,
    seen: Mutex<SeenEvents>,
    stats: AtomicHubStats,
}

impl FanoutHub {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        snapshots: Arc<SnapshotCoordinator>,
        store: Arc<dyn DocumentStore>,
        bus: Arc<dyn ReplicationBus>,
    ) -> Self {
        Self {
            registry,
            snapshots,
            store,
            bus,
            connections: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenEvents::default()),
            stats: AtomicHubStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCoordinator> {
        &self.snapshots
    }

    /// Handle for `document_id`; a fresh hydration asks siblings for the
    /// edits the store does not have yet.
    async fn document(&self, document_id: &DocumentId) -> Result<DocumentHandle, HubError> {
        let (document, hydrated) = self.registry.open(document_id).await?;
        if hydrated {
            self.request_sync(document_id).await;
        }
        Ok(document)
    }

    // ─── Connections ─────────────────────────────────────────────────

    /// Register a handle for `document_id`.
    pub async fn connect(&self, document_id: &DocumentId, handle: ClientHandle) {
        let mut connections = self.connections.write().await;
        connections
            .entry(document_id.clone())
            .or_default()
            .insert(handle.id(), handle);
        log::debug!("Client connected to {document_id}");
    }

    /// Hydrate the document, register the handle and queue `init` to it.
    ///
    /// The handle is registered before the text is rendered, so no edit
    /// falls between the two. If a newer edit frame overtakes the render,
    /// the client already has newer text and `init` is skipped.
    pub async fn open(&self, document_id: &DocumentId, handle: ClientHandle) -> Result<(), HubError> {
        let document = self.document(document_id).await?;
        self.connect(document_id, handle.clone()).await;

        let rendered = document.render().await?;
        let frame: Arc<str> = ServerMessage::Init { content: rendered.content }.encode()?.into();
        match handle.deliver_revision(rendered.revision, frame) {
            Delivery::Sent => {}
            Delivery::Superseded => {
                log::debug!("Client {} already has newer text of {document_id}, skipping init", handle.id());
            }
            Delivery::Closed => {
                log::warn!("Client {} went away before init on {document_id}", handle.id());
                self.disconnect(document_id, handle.id()).await;
            }
        }
        Ok(())
    }

    /// Remove a handle; the document's set is pruned once empty.
    pub async fn disconnect(&self, document_id: &DocumentId, handle_id: Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(handles) = connections.get_mut(document_id) {
            handles.remove(&handle_id);
            if handles.is_empty() {
                connections.remove(document_id);
            }
        }
        log::debug!("Client {handle_id} disconnected from {document_id}");
    }

    pub async fn connection_count(&self, document_id: &DocumentId) -> usize {
        let connections = self.connections.read().await;
        connections.get(document_id).map_or(0, HashMap::len)
    }

    // ─── Delivery ────────────────────────────────────────────────────

    /// Deliver `message` to every local handle of `document_id`.
    ///
    /// Handles that fail are removed; delivery to the rest continues.
    /// Returns the number of successful deliveries.
    pub async fn broadcast_local(&self, document_id: &DocumentId, message: &ServerMessage) -> usize {
        self.fan_out(document_id, message, None).await
    }

    /// Like [`broadcast_local`](Self::broadcast_local) for text produced by
    /// `revision`; handles that already queued a later revision skip it.
    pub async fn broadcast_content(&self, document_id: &DocumentId, revision: u64, message: &ServerMessage) -> usize {
        self.fan_out(document_id, message, Some(revision)).await
    }

    async fn fan_out(&self, document_id: &DocumentId, message: &ServerMessage, revision: Option<u64>) -> usize {
        let frame: Arc<str> = match message.encode() {
            Ok(json) => json.into(),
            Err(e) => {
                log::error!("Failed to encode message for {document_id}: {e}");
                return 0;
            }
        };

        let handles: Vec<ClientHandle> = {
            let connections = self.connections.read().await;
            match connections.get(document_id) {
                Some(handles) => handles.values().cloned().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut superseded: u64 = 0;
        let mut failed = Vec::new();
        for handle in &handles {
            let delivery = match revision {
                Some(revision) => handle.deliver_revision(revision, frame.clone()),
                None if handle.deliver(frame.clone()) => Delivery::Sent,
                None => Delivery::Closed,
            };
            match delivery {
                Delivery::Sent => delivered += 1,
                Delivery::Superseded => superseded += 1,
                Delivery::Closed => failed.push(handle.id()),
            }
        }

        if !failed.is_empty() {
            log::warn!("Dropping {} unresponsive client(s) on {document_id}", failed.len());
            let mut connections = self.connections.write().await;
            if let Some(handles) = connections.get_mut(document_id) {
                for id in &failed {
                    handles.remove(id);
                }
                if handles.is_empty() {
                    connections.remove(document_id);
                }
            }
            self.stats.dropped_handles.fetch_add(failed.len() as u64, Ordering::Relaxed);
        }

        self.stats.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats.superseded.fetch_add(superseded, Ordering::Relaxed);
        delivered
    }

    /// Deliver locally, then publish `payload` for sibling instances.
    ///
    /// A publish failure is logged; local delivery has already happened.
    pub async fn broadcast_global(
        &self,
        document_id: &DocumentId,
        message: &ServerMessage,
        payload: Replicated,
    ) -> usize {
        let delivered = self.broadcast_local(document_id, message).await;
        self.publish(document_id, payload).await;
        delivered
    }

    /// Publish `payload` on the document's channel, remembering its event
    /// id so the echo is dropped.
    async fn publish(&self, document_id: &DocumentId, payload: Replicated) {
        let envelope = BusEnvelope::new(document_id.clone(), payload);
        self.seen.lock().await.insert(envelope.event_id);

        let result = match envelope.encode() {
            Ok(bytes) => self.bus.publish(document_id.as_str(), bytes).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("Failed to publish {} for {document_id}: {e}", envelope.payload.kind());
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn request_sync(&self, document_id: &DocumentId) {
        log::debug!("Requesting state of {document_id} from sibling instances");
        self.stats.sync_requests.fetch_add(1, Ordering::Relaxed);
        self.publish(document_id, Replicated::SyncRequest).await;
    }

    async fn send_state(&self, document_id: &DocumentId, document: &DocumentHandle) -> Result<(), HubError> {
        let snapshot = document.snapshot().await?;
        self.stats.states_sent.fetch_add(1, Ordering::Relaxed);
        self.publish(document_id, Replicated::State { state: snapshot.state }).await;
        Ok(())
    }

    // ─── Bus ─────────────────────────────────────────────────────────

    /// Apply an event from the bus and deliver it locally.
    ///
    /// Only state transfers are published in response; the event itself
    /// is never relayed.
    pub async fn on_bus_message(&self, envelope: BusEnvelope) {
        let BusEnvelope { document_id, event_id, payload } = envelope;

        if !self.seen.lock().await.insert(event_id) {
            log::trace!("Suppressed echo {event_id} on {document_id}");
            self.stats.echoes_suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Storage is authoritative for documents hydrated later.
        let Some(document) = self.registry.get(&document_id).await else {
            log::trace!("Ignoring {} for unhydrated document {document_id}", payload.kind());
            return;
        };

        let kind = payload.kind();
        let result = match payload {
            Replicated::Edit { lineage, ops } => self.apply_remote_edit(&document_id, &document, lineage, ops).await,
            Replicated::Reset { content, lineage } => {
                self.apply_remote_reset(&document_id, &document, content, lineage).await
            }
            Replicated::State { state } => self.merge_remote_state(&document_id, &document, state).await,
            Replicated::SyncRequest => self.send_state(&document_id, &document).await,
            Replicated::Cursor { position } => {
                self.stats.bus_applied.fetch_add(1, Ordering::Relaxed);
                self.broadcast_local(&document_id, &ServerMessage::Cursor { position }).await;
                Ok(())
            }
            Replicated::Join { user_id } => {
                self.stats.bus_applied.fetch_add(1, Ordering::Relaxed);
                self.broadcast_local(&document_id, &ServerMessage::Join { user_id }).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            log::error!("Failed to apply remote {kind} to {document_id}: {e}");
        }
    }

    async fn apply_remote_edit(
        &self,
        document_id: &DocumentId,
        document: &DocumentHandle,
        lineage: Lineage,
        ops: Vec<Operation>,
    ) -> Result<(), HubError> {
        let outcome = document.apply_remote(lineage, ops).await?;
        match outcome.lineage {
            LineageMatch::Same if outcome.changed => {
                self.stats.bus_applied.fetch_add(1, Ordering::Relaxed);
                let message = ServerMessage::Edit { content: outcome.content };
                self.broadcast_content(document_id, outcome.revision, &message).await;
            }
            LineageMatch::Same => {
                self.stats.echoes_suppressed.fetch_add(1, Ordering::Relaxed);
            }
            LineageMatch::Stale => {
                log::debug!("Dropping edit to {document_id} from before lineage {lineage} was replaced");
                self.send_state(document_id, document).await?;
            }
            LineageMatch::Newer => {
                log::info!("{document_id}: edit from unseen lineage {lineage}, resyncing");
                self.request_sync(document_id).await;
            }
        }
        Ok(())
    }

    async fn apply_remote_reset(
        &self,
        document_id: &DocumentId,
        document: &DocumentHandle,
        content: String,
        lineage: Lineage,
    ) -> Result<(), HubError> {
        match document.reset(content, lineage).await? {
            Some(rendered) => {
                self.stats.bus_applied.fetch_add(1, Ordering::Relaxed);
                let message = ServerMessage::Edit { content: rendered.content };
                self.broadcast_content(document_id, rendered.revision, &message).await;
            }
            None => log::debug!("{document_id}: ignoring reset to lineage {lineage}, already past it"),
        }
        Ok(())
    }

    async fn merge_remote_state(
        &self,
        document_id: &DocumentId,
        document: &DocumentHandle,
        state: ReplicaState,
    ) -> Result<(), HubError> {
        let outcome = document.merge_state(state).await?;
        if outcome.lineage == LineageMatch::Stale {
            return self.send_state(document_id, document).await;
        }
        if outcome.changed {
            self.stats.bus_applied.fetch_add(1, Ordering::Relaxed);
            let message = ServerMessage::Edit { content: outcome.content };
            self.broadcast_content(document_id, outcome.revision, &message).await;
        }
        Ok(())
    }

    /// The listener lost `skipped` messages (0 when unknown): offer this
    /// instance's state of every hydrated document and ask for everyone
    /// else's.
    pub async fn on_bus_lag(&self, skipped: u64) {
        self.stats.lag_events.fetch_add(1, Ordering::Relaxed);
        let documents = self.registry.documents().await;
        log::warn!(
            "Bus listener lost {skipped} message(s), resyncing {} document(s)",
            documents.len()
        );
        for document_id in documents {
            let Some(document) = self.registry.get(&document_id).await else {
                continue;
            };
            if let Err(e) = self.send_state(&document_id, &document).await {
                log::error!("Failed to offer state of {document_id}: {e}");
            }
            self.request_sync(&document_id).await;
        }
    }

    // ─── Client messages ─────────────────────────────────────────────

    /// Dispatch one inbound client message.
    ///
    /// Returns a reply meant only for the sender (`pong`); everything else
    /// is broadcast.
    pub async fn handle_client(
        &self,
        document_id: &DocumentId,
        handle_id: Uuid,
        message: ClientMessage,
    ) -> Result<Option<ServerMessage>, HubError> {
        match message {
            ClientMessage::Edit { content } => {
                let document = self.document(document_id).await?;
                let outcome = document.edit(content).await?;
                if outcome.ops.is_empty() {
                    log::trace!("No-op edit from {handle_id} on {document_id}");
                    return Ok(None);
                }
                self.snapshots.mark_dirty(document_id).await;
                let message = ServerMessage::Edit { content: outcome.content };
                self.broadcast_content(document_id, outcome.revision, &message).await;
                self.publish(document_id, Replicated::Edit { lineage: outcome.lineage, ops: outcome.ops })
                    .await;
                Ok(None)
            }
            ClientMessage::Cursor { position } => {
                self.broadcast_global(
                    document_id,
                    &ServerMessage::Cursor { position },
                    Replicated::Cursor { position },
                )
                .await;
                Ok(None)
            }
            ClientMessage::Join { user_id } => {
                log::info!("{user_id} joined {document_id}");
                self.broadcast_global(
                    document_id,
                    &ServerMessage::Join { user_id: user_id.clone() },
                    Replicated::Join { user_id },
                )
                .await;
                Ok(None)
            }
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
        }
    }

    // ─── Rollback ────────────────────────────────────────────────────

    /// Restore `version` of a document and push it to every viewer.
    ///
    /// The store moves the document to a new lineage first; a missing
    /// version fails with [`StoreError::VersionNotFound`] before anything
    /// is touched. Edits made concurrently on the old lineage are dropped
    /// everywhere.
    pub async fn rollback(&self, document_id: &DocumentId, version: u64) -> Result<String, HubError> {
        let head = self.store.rollback(document_id, version, ReplicaId::random()).await?;
        let lineage = head.state.lineage;

        let document = self.document(document_id).await?;
        if let Some(rendered) = document.reset(head.content.clone(), lineage).await? {
            let message = ServerMessage::Edit { content: rendered.content };
            self.broadcast_content(document_id, rendered.revision, &message).await;
        }
        self.snapshots.mark_dirty(document_id).await;

        log::info!("Rolled back {document_id} to version {version} (lineage {lineage})");
        self.publish(document_id, Replicated::Reset { content: head.content.clone(), lineage }).await;
        Ok(head.content)
    }

    pub async fn stats(&self) -> HubStats {
        let connections = self.connections.read().await;
        HubStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            superseded: self.stats.superseded.load(Ordering::Relaxed),
            dropped_handles: self.stats.dropped_handles.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
            publish_failures: self.stats.publish_failures.load(Ordering::Relaxed),
            bus_applied: self.stats.bus_applied.load(Ordering::Relaxed),
            echoes_suppressed: self.stats.echoes_suppressed.load(Ordering::Relaxed),
            lag_events: self.stats.lag_events.load(Ordering::Relaxed),
            sync_requests: self.stats.sync_requests.load(Ordering::Relaxed),
            states_sent: self.stats.states_sent.load(Ordering::Relaxed),
            active_documents: connections.len(),
            connections: connections.values().map(HashMap::len).sum(),
        }
    }
}
