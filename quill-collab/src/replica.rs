//! Sequence CRDT holding one document's text.
//!
//! Every character ever typed is an [`Element`] with a globally unique
//! [`ElementId`] and the id of the element that was on its left when it was
//! created (`origin_left`). Deleted characters stay as tombstones.
//!
//! ```text
//!   START ── h(1@a) ── i(2@a) ── !(4@b)         visible text: "hi!"
//!                  └── ✗(3@a)  (tombstone)
//! ```
//!
//! Ordering rule: an element sits right after its origin; elements sharing
//! an origin are ordered by descending id, and the run of a greater sibling
//! (including everything inserted into it later) precedes a lesser sibling.
//! Ids are Lamport timestamps, so a newly integrated element only has to
//! skip the elements to its right whose id is greater than its own. Two
//! replicas holding the same set of elements therefore produce the same
//! order no matter how delivery was interleaved.
//!
//! Operations whose dependencies have not arrived yet (an insert whose
//! origin is unknown, a delete of an unknown id) are parked and take effect
//! as soon as the missing element shows up.
//!
//! Text loaded in bulk (hydration, rollback) gets ids minted from the
//! replica's [`Lineage`]; a rollback starts a newer lineage, and operations
//! from an older one no longer apply.
//!
//! Integration cost: locating an origin is a linear scan unless it is the
//! element integrated last, which covers typed and pasted runs; inserting
//! shifts the element vector. Local multi-character edits are spliced in
//! one go.
//!
//! Tombstones are never collected: that needs causal-stability tracking
//! across every replica.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diff::TextEdit;

/// Identity of a replica minting element ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// A random, non-zero replica id (one per server process).
    pub fn random() -> Self {
        loop {
            let (high, _) = Uuid::new_v4().as_u64_pair();
            if high != 0 {
                return Self(high);
            }
        }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Globally unique element id, ordered by `(counter, replica)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl ElementId {
    /// Start-of-document sentinel. Never stored as an element.
    pub const START: ElementId = ElementId { counter: 0, replica: ReplicaId(0) };

    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        Self { counter, replica }
    }

    pub fn is_start(&self) -> bool {
        *self == Self::START
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.replica)
    }
}

/// Generation of a document's element ids.
///
/// Every rollback moves to a greater lineage; text loaded in bulk gets ids
/// `(1..=n, seed)`. Ordered by `(epoch, seed)`, so concurrent rollbacks
/// on different instances still agree on a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lineage {
    pub epoch: u64,
    pub seed: ReplicaId,
}

impl Lineage {
    /// Lineage of a document that was never rolled back.
    pub const ORIGIN: Lineage = Lineage { epoch: 0, seed: ReplicaId(u64::MAX) };

    pub fn new(epoch: u64, seed: ReplicaId) -> Self {
        Self { epoch, seed }
    }

    /// The lineage a rollback from `self` starts.
    pub fn next(&self, seed: ReplicaId) -> Self {
        Self { epoch: self.epoch + 1, seed }
    }
}

impl Default for Lineage {
    fn default() -> Self {
        Self::ORIGIN
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.epoch, self.seed)
    }
}

/// One character of a document, live or tombstoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    id: ElementId,
    value: char,
    origin_left: ElementId,
    deleted: bool,
}

impl Element {
    fn new(id: ElementId, value: char, origin_left: ElementId) -> Self {
        Self { id, value, origin_left, deleted: false }
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn value(&self) -> char {
        self.value
    }

    pub fn origin_left(&self) -> ElementId {
        self.origin_left
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Unit of replication. Idempotent and commutative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert { id: ElementId, value: char, origin_left: ElementId },
    Delete { id: ElementId },
}

impl Operation {
    pub fn id(&self) -> ElementId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id } => *id,
        }
    }
}

/// Durable form of a replica.
///
/// `ops` rebuilds the integrated elements in any order. Empty `ops` means
/// the document's stored text is loaded with the lineage's seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub lineage: Lineage,
    pub ops: Vec<Operation>,
}

impl ReplicaState {
    /// State for text loaded in bulk under `lineage`.
    pub fn loaded(lineage: Lineage) -> Self {
        Self { lineage, ops: Vec::new() }
    }
}

/// Counters describing a replica's internal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStats {
    pub visible: usize,
    pub elements: usize,
    pub tombstones: usize,
    pub pending: usize,
}

/// The sequence CRDT for one document.
#[derive(Debug, Clone)]
pub struct Replica {
    replica_id: ReplicaId,
    lineage: Lineage,
    /// Highest counter seen; next local id is `clock + 1`
    clock: u64,
    /// All integrated elements in traversal order
    elements: Vec<Element>,
    known: HashSet<ElementId>,
    /// Inserts waiting for their origin, keyed by the missing origin
    pending: HashMap<ElementId, Vec<Element>>,
    /// Deletes that arrived before the element they target
    pending_deletes: HashSet<ElementId>,
    /// Index of the element integrated or deleted last
    hint: usize,
}

impl Replica {
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            lineage: Lineage::ORIGIN,
            clock: 0,
            elements: Vec::new(),
            known: HashSet::new(),
            pending: HashMap::new(),
            pending_deletes: HashSet::new(),
            hint: 0,
        }
    }

    /// Fresh replica initialised from stored text.
    pub fn hydrated(replica_id: ReplicaId, text: &str, lineage: Lineage) -> Self {
        let mut replica = Self::new(replica_id);
        replica.load(text, lineage);
        replica
    }

    /// Rebuild a replica from its durable state; `text` is only read when
    /// the state carries no operations.
    pub fn restore(replica_id: ReplicaId, text: &str, state: &ReplicaState) -> Self {
        let mut replica = Self::new(replica_id);
        if state.ops.is_empty() {
            replica.load(text, state.lineage);
        } else {
            replica.adopt(state);
        }
        replica
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn lineage(&self) -> Lineage {
        self.lineage
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    // ─── Remote application ──────────────────────────────────────────

    /// Integrate an insert.
    ///
    /// Returns the element once it is part of the sequence (also for a
    /// duplicate delivery), or `None` while it waits for its origin.
    pub fn apply_insert(
        &mut self,
        id: ElementId,
        value: char,
        origin_left: ElementId,
    ) -> Option<&Element> {
        if id.is_start() {
            return None;
        }
        if self.known.contains(&id) {
            return self.get(id);
        }
        if !origin_left.is_start() && !self.known.contains(&origin_left) {
            let parked = self.pending.entry(origin_left).or_default();
            if !parked.iter().any(|e| e.id == id) {
                parked.push(Element::new(id, value, origin_left));
            }
            return None;
        }

        self.integrate(Element::new(id, value, origin_left));
        self.release_pending(id);
        self.get(id)
    }

    /// Tombstone an element. Returns `true` if a live element was deleted.
    ///
    /// Unknown ids are remembered and deleted on arrival; already deleted
    /// ids are a no-op.
    pub fn apply_delete(&mut self, id: ElementId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.hint = index;
                let element = &mut self.elements[index];
                if element.deleted {
                    false
                } else {
                    element.deleted = true;
                    true
                }
            }
            None => {
                if !id.is_start() {
                    self.pending_deletes.insert(id);
                }
                false
            }
        }
    }

    /// Apply one operation. Returns `true` if the sequence changed.
    pub fn apply(&mut self, op: &Operation) -> bool {
        match *op {
            Operation::Insert { id, value, origin_left } => {
                if self.known.contains(&id) {
                    return false;
                }
                self.apply_insert(id, value, origin_left).is_some()
            }
            Operation::Delete { id } => self.apply_delete(id),
        }
    }

    /// Apply a batch, returning how many operations changed the sequence.
    pub fn apply_all<'a>(&mut self, ops: impl IntoIterator<Item = &'a Operation>) -> usize {
        ops.into_iter().filter(|op| self.apply(op)).count()
    }

    /// Place `element` after its origin, skipping greater siblings' runs.
    fn integrate(&mut self, mut element: Element) {
        let mut index = if element.origin_left.is_start() {
            0
        } else {
            self.position(element.origin_left).map_or(0, |i| i + 1)
        };
        while index < self.elements.len() && self.elements[index].id > element.id {
            index += 1;
        }

        if self.pending_deletes.remove(&element.id) {
            element.deleted = true;
        }
        self.clock = self.clock.max(element.id.counter);
        self.known.insert(element.id);
        self.elements.insert(index, element);
        self.hint = index;
    }

    /// Integrate every parked insert that was waiting on `origin`, transitively.
    fn release_pending(&mut self, origin: ElementId) {
        let mut ready = vec![origin];
        while let Some(origin) = ready.pop() {
            let Some(children) = self.pending.remove(&origin) else {
                continue;
            };
            for child in children {
                if self.known.contains(&child.id) {
                    continue;
                }
                let child_id = child.id;
                self.integrate(child);
                ready.push(child_id);
            }
        }
    }

    // ─── Local editing ───────────────────────────────────────────────

    fn next_id(&mut self) -> ElementId {
        self.clock += 1;
        ElementId::new(self.clock, self.replica_id)
    }

    /// Id of the visible element left of `position`; positions past the end
    /// resolve to the last visible element.
    fn origin_for(&self, position: usize) -> ElementId {
        if position == 0 {
            return ElementId::START;
        }
        self.visible()
            .take(position)
            .last()
            .map_or(ElementId::START, |e| e.id)
    }

    /// Insert `value` at visible `position`; past the end appends.
    pub fn insert_local(&mut self, position: usize, value: char) -> Operation {
        let origin_left = self.origin_for(position);
        let id = self.next_id();
        self.integrate(Element::new(id, value, origin_left));
        Operation::Insert { id, value, origin_left }
    }

    /// Delete the visible character at `position`, if there is one.
    pub fn delete_local(&mut self, position: usize) -> Option<Operation> {
        let id = self.visible().nth(position)?.id;
        self.apply_delete(id);
        Some(Operation::Delete { id })
    }

    /// Apply a splice as local operations, returning what to replicate.
    ///
    /// Deletes come first; inserted characters chain their origins so the
    /// inserted run stays contiguous. Fresh local ids exceed every known
    /// id, so the run lands right after its origin and is spliced in once.
    pub fn apply_text_edit(&mut self, edit: &TextEdit) -> Vec<Operation> {
        let mut ops = Vec::with_capacity(edit.delete_len + edit.insert.len());

        let doomed: Vec<ElementId> = self
            .visible()
            .skip(edit.position)
            .take(edit.delete_len)
            .map(|e| e.id)
            .collect();
        for id in doomed {
            if self.apply_delete(id) {
                ops.push(Operation::Delete { id });
            }
        }

        if edit.insert.is_empty() {
            return ops;
        }
        let mut origin_left = self.origin_for(edit.position);
        let at = if origin_left.is_start() {
            0
        } else {
            self.position(origin_left).map_or(0, |i| i + 1)
        };

        let mut run = Vec::with_capacity(edit.insert.len());
        for value in edit.insert.chars() {
            let id = self.next_id();
            self.known.insert(id);
            run.push(Element::new(id, value, origin_left));
            ops.push(Operation::Insert { id, value, origin_left });
            origin_left = id;
        }
        self.hint = at + run.len() - 1;
        self.elements.splice(at..at, run);
        ops
    }

    // ─── Reading ─────────────────────────────────────────────────────

    /// Index of `id`, trying the last touched element and its right
    /// neighbour before scanning.
    fn position(&self, id: ElementId) -> Option<usize> {
        let near = self.hint..(self.hint + 2).min(self.elements.len());
        near.into_iter()
            .find(|&i| self.elements[i].id == id)
            .or_else(|| self.elements.iter().position(|e| e.id == id))
    }

    /// Look up an integrated element, tombstoned or not.
    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.position(id).map(|i| &self.elements[i])
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.known.contains(&id)
    }

    /// Live elements, left to right.
    pub fn visible(&self) -> impl Iterator<Item = &Element> + '_ {
        self.elements.iter().filter(|e| !e.deleted)
    }

    /// Visible characters, left to right. Restartable and side-effect free.
    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.visible().map(|e| e.value)
    }

    /// The visible text.
    pub fn materialize(&self) -> String {
        self.chars().collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible().count()
    }

    pub fn is_empty(&self) -> bool {
        self.visible().next().is_none()
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.elements.iter().filter(|e| e.deleted).count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> ReplicaStats {
        ReplicaStats {
            visible: self.len(),
            elements: self.element_count(),
            tombstones: self.tombstone_count(),
            pending: self.pending_count(),
        }
    }

    /// Every operation needed to rebuild this replica's integrated state:
    /// inserts in traversal order, then deletes for the tombstones.
    pub fn operations(&self) -> Vec<Operation> {
        let inserts = self.elements.iter().map(|e| Operation::Insert {
            id: e.id,
            value: e.value,
            origin_left: e.origin_left,
        });
        let deletes = self
            .elements
            .iter()
            .filter(|e| e.deleted)
            .map(|e| Operation::Delete { id: e.id });
        inserts.chain(deletes).collect()
    }

    /// Lineage plus [`operations`](Self::operations), for persistence and
    /// state transfer.
    pub fn state(&self) -> ReplicaState {
        ReplicaState { lineage: self.lineage, ops: self.operations() }
    }

    /// Replace the contents with `state`, including its lineage.
    pub fn adopt(&mut self, state: &ReplicaState) {
        self.clear();
        self.lineage = state.lineage;
        self.apply_all(&state.ops);
    }

    fn clear(&mut self) {
        self.elements.clear();
        self.known.clear();
        self.pending.clear();
        self.pending_deletes.clear();
        self.hint = 0;
    }

    // ─── Bulk load ───────────────────────────────────────────────────

    /// Replace the contents with `text`, one element per char, and move to
    /// `lineage`.
    ///
    /// Ids are `(1..=n, lineage.seed)` with origins chained left to right,
    /// so two replicas loading the same text under the same lineage agree
    /// on every id. The clock never moves backwards, so local ids stay
    /// unique.
    pub fn load(&mut self, text: &str, lineage: Lineage) {
        self.clear();
        self.lineage = lineage;

        let seed = lineage.seed;
        let mut origin_left = ElementId::START;
        for (i, value) in text.chars().enumerate() {
            let id = ElementId::new(i as u64 + 1, seed);
            self.elements.push(Element::new(id, value, origin_left));
            self.known.insert(id);
            origin_left = id;
        }
        self.clock = self.clock.max(self.elements.len() as u64);
    }
}
