//! In-process bus on a tokio broadcast channel.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{BusError, BusEvent, BusStream, ReplicationBus};

/// Several hubs sharing one `LocalBus` behave like instances sharing a
/// broker with a pattern subscription.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<(String, Vec<u8>)>,
}

impl LocalBus {
    /// `capacity` messages are buffered per subscriber before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ReplicationBus for LocalBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        // No subscribers is not an error: nobody else is running.
        let _ = self.sender.send((channel.to_string(), payload));
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<BusStream, BusError> {
        let receiver = self.sender.subscribe();
        Ok(Box::pin(futures_util::stream::unfold(receiver, |mut receiver| async move {
            let event = match receiver.recv().await {
                Ok((channel, payload)) => BusEvent::Message { channel, payload },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Bus subscriber lagged, skipped {skipped} messages");
                    BusEvent::Lagged(skipped)
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            Some((event, receiver))
        })))
    }
}
