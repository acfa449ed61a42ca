//! Replication bus: fanout between server instances.
//!
//! Every instance publishes the events it originates on the document's
//! channel and listens to all channels:
//!
//! ```text
//!  instance A                                 instance B
//!  FanoutHub ── publish(doc, envelope) ──►  ReplicationBus ──► listener ──► FanoutHub
//!      ▲                                          │                         (apply + local)
//!      └──────────── listener ◄───────────────────┘  (A sees its own echo)
//! ```
//!
//! Payloads are bincode-encoded [`BusEnvelope`]s. Delivery is at most once:
//! a subscriber that falls behind or reconnects sees a [`BusEvent::Lagged`],
//! and the hub then asks its siblings for their full state.

mod local;
mod redis;

pub use self::local::LocalBus;
pub use self::redis::RedisBus;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::hub::FanoutHub;
use crate::protocol::DocumentId;
use crate::replica::{Lineage, Operation, ReplicaState};

/// First delay before re-subscribing after a subscription ended.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(100);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message { channel: String, payload: Vec<u8> },
    /// Messages were lost; the count is 0 when unknown
    Lagged(u64),
}

/// Lazy, unbounded stream of bus events.
pub type BusStream = Pin<Box<dyn Stream<Item = BusEvent> + Send>>;

/// Publish/subscribe transport between instances.
#[async_trait]
pub trait ReplicationBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to every channel. Messages published after this call
    /// returns are delivered, including this instance's own.
    async fn subscribe_all(&self) -> Result<BusStream, BusError>;
}

/// Bus errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Broker unreachable or publish rejected
    Unavailable(String),
    EncodeError(String),
    DecodeError(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Unavailable(e) => write!(f, "Bus unavailable: {e}"),
            BusError::EncodeError(e) => write!(f, "Envelope encode error: {e}"),
            BusError::DecodeError(e) => write!(f, "Envelope decode error: {e}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Event replicated between instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Replicated {
    /// CRDT operations from a local edit
    Edit { lineage: Lineage, ops: Vec<Operation> },
    /// Whole-text replacement after a rollback; ids are minted from the
    /// lineage's seed
    Reset { content: String, lineage: Lineage },
    /// A replica's full state, answering a [`Replicated::SyncRequest`] or
    /// a message from an older lineage
    State { state: ReplicaState },
    /// Ask every instance holding the document for its state
    SyncRequest,
    Cursor { position: u64 },
    Join { user_id: String },
}

impl Replicated {
    pub fn kind(&self) -> &'static str {
        match self {
            Replicated::Edit { .. } => "edit",
            Replicated::Reset { .. } => "reset",
            Replicated::State { .. } => "state",
            Replicated::SyncRequest => "sync_request",
            Replicated::Cursor { .. } => "cursor",
            Replicated::Join { .. } => "join",
        }
    }
}

/// Wire envelope published on a document's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub document_id: DocumentId,
    /// Unique per publish; lets receivers drop their own echoes
    pub event_id: Uuid,
    pub payload: Replicated,
}

impl BusEnvelope {
    pub fn new(document_id: DocumentId, payload: Replicated) -> Self {
        Self { document_id, event_id: Uuid::new_v4(), payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BusError::EncodeError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BusError::DecodeError(e.to_string()))?;
        Ok(envelope)
    }
}

/// Feed every bus event into `hub` until the task is aborted.
///
/// Subscribes before returning, so nothing published afterwards is missed.
/// When the subscription ends the listener re-subscribes with backoff and
/// reports the gap to the hub as a lag.
pub async fn spawn_listener(
    bus: Arc<dyn ReplicationBus>,
    hub: Arc<FanoutHub>,
) -> Result<JoinHandle<()>, BusError> {
    let stream = bus.subscribe_all().await?;
    Ok(spawn_listener_on(bus, hub, stream))
}

/// [`spawn_listener`] on a subscription taken earlier.
pub fn spawn_listener_on(bus: Arc<dyn ReplicationBus>, hub: Arc<FanoutHub>, stream: BusStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = stream;
        loop {
            while let Some(event) = stream.next().await {
                match event {
                    BusEvent::Message { channel, payload } => dispatch(&hub, &channel, &payload).await,
                    BusEvent::Lagged(skipped) => hub.on_bus_lag(skipped).await,
                }
            }
            log::warn!("Bus subscription ended, re-subscribing");
            stream = resubscribe(bus.as_ref()).await;
            hub.on_bus_lag(0).await;
        }
    })
}

async fn resubscribe(bus: &dyn ReplicationBus) -> BusStream {
    let mut backoff = RESUBSCRIBE_BACKOFF;
    loop {
        match bus.subscribe_all().await {
            Ok(stream) => return stream,
            Err(e) => {
                log::warn!("Bus re-subscribe failed, retrying in {backoff:?}: {e}");
                sleep(backoff).await;
                backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
            }
        }
    }
}

async fn dispatch(hub: &FanoutHub, channel: &str, payload: &[u8]) {
    let envelope = match BusEnvelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("Skipping undecodable bus message on {channel}: {e}");
            return;
        }
    };
    if envelope.document_id.as_str() != channel {
        log::warn!(
            "Skipping bus message for {} published on channel {channel}",
            envelope.document_id
        );
        return;
    }
    hub.on_bus_message(envelope).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{ElementId, ReplicaId};

    #[test]
    fn test_envelope_codec() {
        let envelope = BusEnvelope::new(
            DocumentId::from("doc"),
            Replicated::Edit {
                lineage: Lineage::ORIGIN.next(ReplicaId(2)),
                ops: vec![
                    Operation::Insert {
                        id: ElementId::new(3, ReplicaId(9)),
                        value: 'é',
                        origin_left: ElementId::START,
                    },
                    Operation::Delete { id: ElementId::new(1, ReplicaId(4)) },
                ],
            },
        );
        let bytes = envelope.encode().unwrap();
        assert_eq!(BusEnvelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_state_envelope_codec() {
        let state = crate::replica::Replica::hydrated(ReplicaId(3), "héllo", Lineage::ORIGIN).state();
        let envelope = BusEnvelope::new("doc".into(), Replicated::State { state });
        let decoded = BusEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.payload.kind(), "state");
    }

    #[test]
    fn test_envelope_decode_garbage() {
        assert!(matches!(BusEnvelope::decode(&[0xFF, 0xFF, 0xFF]), Err(BusError::DecodeError(_))));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = BusEnvelope::new("doc".into(), Replicated::Cursor { position: 1 });
        let b = BusEnvelope::new("doc".into(), Replicated::Cursor { position: 1 });
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.payload.kind(), "cursor");
        assert_eq!(Replicated::SyncRequest.kind(), "sync_request");
    }
}
