//! Redis pub/sub bus for instances in separate processes.
//!
//! Documents map to channels `<prefix><document_id>`; the listener holds a
//! single pattern subscription on `<prefix>*`.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};

use super::{BusError, BusEvent, BusStream, ReplicationBus};

/// Channel prefix used by [`RedisBus::connect`].
pub const DEFAULT_CHANNEL_PREFIX: &str = "quill:";

impl From<RedisError> for BusError {
    fn from(e: RedisError) -> Self {
        BusError::Unavailable(e.to_string())
    }
}

/// Bus backed by a Redis server.
///
/// Publishing goes through a reconnecting connection manager. Each
/// subscription opens its own pub/sub connection; when that connection
/// drops the stream ends and the listener subscribes again.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
    prefix: String,
}

impl RedisBus {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        Self::with_prefix(url, DEFAULT_CHANNEL_PREFIX).await
    }

    pub async fn with_prefix(url: &str, prefix: &str) -> Result<Self, BusError> {
        let client = Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        log::info!("Connected to Redis bus at {url} (prefix {prefix:?})");
        Ok(Self { client, publisher, prefix: prefix.to_string() })
    }

    fn channel_key(&self, channel: &str) -> String {
        channel_key(&self.prefix, channel)
    }
}

fn channel_key(prefix: &str, channel: &str) -> String {
    format!("{prefix}{channel}")
}

/// Document channel for a Redis channel name, `None` outside `prefix`.
fn strip_channel<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|channel| !channel.is_empty())
}

#[async_trait]
impl ReplicationBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut connection = self.publisher.clone();
        let _receivers: i64 = connection.publish(self.channel_key(channel), payload).await?;
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<BusStream, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(channel_key(&self.prefix, "*")).await?;

        let prefix = self.prefix.clone();
        let stream = pubsub.into_on_message().filter_map(move |message| {
            let event = match strip_channel(&prefix, message.get_channel_name()) {
                Some(channel) => Some(BusEvent::Message {
                    channel: channel.to_string(),
                    payload: message.get_payload_bytes().to_vec(),
                }),
                None => {
                    log::warn!("Ignoring Redis message on foreign channel {}", message.get_channel_name());
                    None
                }
            };
            futures_util::future::ready(event)
        });
        Ok(Box::pin(stream))
    }
}
