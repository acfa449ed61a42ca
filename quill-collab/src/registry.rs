//! Process-local registry of live documents.
//!
//! Each hydrated document is owned by a [`DocumentActor`] task; the rest of
//! the process talks to it through a cloneable [`DocumentHandle`]:
//!
//! ```text
//!  FanoutHub ──┐                          ┌──────────────────────────┐
//!  Snapshot ───┼─► DocumentHandle ─mpsc─► │ DocumentActor (1 task)   │
//!  bus ────────┘        ▲                 │   Replica                │
//!                       └──── oneshot ─── └──────────────────────────┘
//! ```
//!
//! The inbox serializes every mutation of a replica, and a command is
//! handled without awaiting, so no other task ever observes a half-applied
//! operation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OnceCell, RwLock};

use crate::diff::text_edit;
use crate::protocol::DocumentId;
use crate::replica::{Lineage, Operation, Replica, ReplicaId, ReplicaState, ReplicaStats};
use crate::storage::{DocumentStore, StoreError};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bounded inbox size of each document actor
    pub inbox_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { inbox_capacity: 256 }
    }
}

impl RegistryConfig {
    pub fn for_testing() -> Self {
        Self { inbox_capacity: 16 }
    }
}

/// Registry errors.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// Hydration from the store failed
    Store(StoreError),
    /// The document's actor is gone
    Closed(DocumentId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Store(e) => write!(f, "Hydration failed: {e}"),
            RegistryError::Closed(id) => write!(f, "Document actor closed: {id}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        RegistryError::Store(e)
    }
}

/// Result of a full-text client edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    /// Operations to replicate; empty when the text was unchanged
    pub ops: Vec<Operation>,
    /// Visible text after the edit
    pub content: String,
    pub revision: u64,
    /// Lineage the operations belong to
    pub lineage: Lineage,
}

/// How a replicated lineage relates to the local replica's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageMatch {
    Same,
    /// Sender has not seen a rollback this replica has
    Stale,
    /// This replica missed a rollback
    Newer,
}

/// Result of applying operations or state received from another instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutcome {
    /// How many operations changed the replica
    pub applied: usize,
    pub content: String,
    pub revision: u64,
    pub lineage: LineageMatch,
    /// Whether the visible document changed
    pub changed: bool,
}

/// Visible text tagged with the revision that produced it.
///
/// Revisions grow by one with every change of a document's replica, so
/// frames can be ordered by the time the change was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub content: String,
    pub revision: u64,
}

/// Text plus durable replica state, taken atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub content: String,
    pub state: ReplicaState,
}

enum Command {
    Edit { content: String, reply: oneshot::Sender<EditOutcome> },
    ApplyRemote { lineage: Lineage, ops: Vec<Operation>, reply: oneshot::Sender<RemoteOutcome> },
    Merge { state: ReplicaState, reply: oneshot::Sender<RemoteOutcome> },
    Reset { content: String, lineage: Lineage, reply: oneshot::Sender<Option<Rendered>> },
    Render { reply: oneshot::Sender<Rendered> },
    Snapshot { reply: oneshot::Sender<DocumentSnapshot> },
    Lineage { reply: oneshot::Sender<Lineage> },
    Stats { reply: oneshot::Sender<ReplicaStats> },
}

/// Task owning one document's [`Replica`].
struct DocumentActor {
    document_id: DocumentId,
    replica: Replica,
    revision: u64,
    inbox: mpsc::Receiver<Command>,
}

impl DocumentActor {
    async fn run(mut self) {
        while let Some(command) = self.inbox.recv().await {
            self.handle(command);
        }
        log::debug!("Document actor for {} stopped", self.document_id);
    }

    fn compare(&self, lineage: Lineage) -> LineageMatch {
        match lineage.cmp(&self.replica.lineage()) {
            std::cmp::Ordering::Equal => LineageMatch::Same,
            std::cmp::Ordering::Less => LineageMatch::Stale,
            std::cmp::Ordering::Greater => LineageMatch::Newer,
        }
    }

    fn remote_outcome(&mut self, applied: usize, lineage: LineageMatch, changed: bool) -> RemoteOutcome {
        if changed {
            self.revision += 1;
        }
        RemoteOutcome {
            applied,
            content: self.replica.materialize(),
            revision: self.revision,
            lineage,
            changed,
        }
    }

    fn handle(&mut self, command: Command) {
        // A dropped reply only means the caller went away.
        match command {
            Command::Edit { content, reply } => {
                let edit = text_edit(&self.replica.materialize(), &content);
                let ops = if edit.is_noop() {
                    Vec::new()
                } else {
                    self.replica.apply_text_edit(&edit)
                };
                if !ops.is_empty() {
                    self.revision += 1;
                }
                log::trace!("{}: local edit produced {} ops", self.document_id, ops.len());
                // Applying the diff yields exactly the requested text.
                let _ = reply.send(EditOutcome {
                    ops,
                    content,
                    revision: self.revision,
                    lineage: self.replica.lineage(),
                });
            }
            Command::ApplyRemote { lineage, ops, reply } => {
                let relation = self.compare(lineage);
                let applied = match relation {
                    LineageMatch::Same => self.replica.apply_all(&ops),
                    LineageMatch::Stale | LineageMatch::Newer => 0,
                };
                let _ = reply.send(self.remote_outcome(applied, relation, applied > 0));
            }
            Command::Merge { state, reply } => {
                let relation = self.compare(state.lineage);
                let (applied, changed) = match relation {
                    LineageMatch::Same => {
                        let applied = self.replica.apply_all(&state.ops);
                        (applied, applied > 0)
                    }
                    LineageMatch::Newer => {
                        log::info!(
                            "{}: adopting lineage {} from a sibling",
                            self.document_id,
                            state.lineage
                        );
                        self.replica.adopt(&state);
                        (state.ops.len(), true)
                    }
                    LineageMatch::Stale => (0, false),
                };
                let _ = reply.send(self.remote_outcome(applied, relation, changed));
            }
            Command::Reset { content, lineage, reply } => {
                let rendered = if lineage > self.replica.lineage() {
                    self.replica.load(&content, lineage);
                    self.revision += 1;
                    Some(Rendered { content, revision: self.revision })
                } else {
                    None
                };
                let _ = reply.send(rendered);
            }
            Command::Render { reply } => {
                let _ = reply.send(Rendered {
                    content: self.replica.materialize(),
                    revision: self.revision,
                });
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(DocumentSnapshot {
                    content: self.replica.materialize(),
                    state: self.replica.state(),
                });
            }
            Command::Lineage { reply } => {
                let _ = reply.send(self.replica.lineage());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.replica.stats());
            }
        }
    }
}

/// Cloneable handle to a document actor.
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    document_id: DocumentId,
    sender: mpsc::Sender<Command>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Edit { .. } => "Edit",
            Command::ApplyRemote { .. } => "ApplyRemote",
            Command::Merge { .. } => "Merge",
            Command::Reset { .. } => "Reset",
            Command::Render { .. } => "Render",
            Command::Snapshot { .. } => "Snapshot",
            Command::Lineage { .. } => "Lineage",
            Command::Stats { .. } => "Stats",
        };
        f.write_str(name)
    }
}

impl DocumentHandle {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RegistryError> {
        let closed = || RegistryError::Closed(self.document_id.clone());
        let (reply, response) = oneshot::channel();
        self.sender.send(command(reply)).await.map_err(|_| closed())?;
        response.await.map_err(|_| closed())
    }

    /// Diff `content` against the current text and apply the difference.
    pub async fn edit(&self, content: String) -> Result<EditOutcome, RegistryError> {
        self.request(|reply| Command::Edit { content, reply }).await
    }

    /// Apply operations replicated from another instance. Operations of a
    /// different lineage are not applied.
    pub async fn apply_remote(
        &self,
        lineage: Lineage,
        ops: Vec<Operation>,
    ) -> Result<RemoteOutcome, RegistryError> {
        self.request(|reply| Command::ApplyRemote { lineage, ops, reply }).await
    }

    /// Merge a sibling's full state: same lineage merges, a newer lineage
    /// replaces the replica, an older one is ignored.
    pub async fn merge_state(&self, state: ReplicaState) -> Result<RemoteOutcome, RegistryError> {
        self.request(|reply| Command::Merge { state, reply }).await
    }

    /// Replace the whole text under `lineage`, minting ids from its seed.
    /// `None` when the replica is already at that lineage or a newer one.
    pub async fn reset(&self, content: String, lineage: Lineage) -> Result<Option<Rendered>, RegistryError> {
        self.request(|reply| Command::Reset { content, lineage, reply }).await
    }

    pub async fn render(&self) -> Result<Rendered, RegistryError> {
        self.request(|reply| Command::Render { reply }).await
    }

    pub async fn materialize(&self) -> Result<String, RegistryError> {
        Ok(self.render().await?.content)
    }

    pub async fn snapshot(&self) -> Result<DocumentSnapshot, RegistryError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn lineage(&self) -> Result<Lineage, RegistryError> {
        self.request(|reply| Command::Lineage { reply }).await
    }

    pub async fn stats(&self) -> Result<ReplicaStats, RegistryError> {
        self.request(|reply| Command::Stats { reply }).await
    }
}

/// Maps document ids to their actors, hydrating lazily from the store.
pub struct DocumentRegistry {
    replica_id: ReplicaId,
    store: Arc<dyn DocumentStore>,
    config: RegistryConfig,
    documents: RwLock<HashMap<DocumentId, Arc<OnceCell<DocumentHandle>>>>,
}

impl DocumentRegistry {
    pub fn new(replica_id: ReplicaId, store: Arc<dyn DocumentStore>, config: RegistryConfig) -> Self {
        Self {
            replica_id,
            store,
            config,
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Handle for `document_id`, hydrating it from the store on first access.
    ///
    /// Concurrent first accesses share one hydration. A failed hydration
    /// leaves the slot empty so the next call retries.
    pub async fn get_or_create(&self, document_id: &DocumentId) -> Result<DocumentHandle, RegistryError> {
        Ok(self.open(document_id).await?.0)
    }

    /// Like [`get_or_create`](Self::get_or_create), also reporting whether
    /// this call hydrated the document.
    pub async fn open(&self, document_id: &DocumentId) -> Result<(DocumentHandle, bool), RegistryError> {
        let cell = self.slot(document_id).await;
        let mut hydrated = false;
        let handle = cell
            .get_or_try_init(|| {
                hydrated = true;
                self.hydrate(document_id)
            })
            .await?;
        Ok((handle.clone(), hydrated))
    }

    /// Handle for an already hydrated document. Never creates.
    pub async fn get(&self, document_id: &DocumentId) -> Option<DocumentHandle> {
        let documents = self.documents.read().await;
        documents.get(document_id).and_then(|cell| cell.get().cloned())
    }

    /// Ids of every hydrated document.
    pub async fn documents(&self) -> Vec<DocumentId> {
        let documents = self.documents.read().await;
        documents
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of hydrated documents.
    pub async fn len(&self) -> usize {
        let documents = self.documents.read().await;
        documents.values().filter(|cell| cell.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slot(&self, document_id: &DocumentId) -> Arc<OnceCell<DocumentHandle>> {
        // Fast path: read lock
        {
            let documents = self.documents.read().await;
            if let Some(cell) = documents.get(document_id) {
                return cell.clone();
            }
        }

        let mut documents = self.documents.write().await;
        documents
            .entry(document_id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    async fn hydrate(&self, document_id: &DocumentId) -> Result<DocumentHandle, RegistryError> {
        let stored = self.store.get_or_create(document_id).await?;
        let replica = Replica::restore(self.replica_id, &stored.content, &stored.state);

        let (sender, inbox) = mpsc::channel(self.config.inbox_capacity);
        let actor = DocumentActor {
            document_id: document_id.clone(),
            replica,
            revision: 0,
            inbox,
        };
        tokio::spawn(actor.run());

        log::info!(
            "Hydrated document {document_id} at version {} ({} chars, {} ops, lineage {})",
            stored.version,
            stored.content.chars().count(),
            stored.state.ops.len(),
            stored.state.lineage
        );
        Ok(DocumentHandle { document_id: document_id.clone(), sender })
    }
}
