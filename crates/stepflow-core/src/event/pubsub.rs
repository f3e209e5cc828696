//! Pub/sub port for watch events.
//!
//! [`InProcessPubSub`] keeps one `tokio::sync::broadcast` channel per topic.
//! Publishing to a topic nobody subscribed to is a no-op.

use dashmap::DashMap;
use stepflow_types::error::PubSubError;
use stepflow_types::event::WatchEvent;
use tokio::sync::broadcast;

/// Topic-based event transport.
pub trait PubSub: Send + Sync + 'static {
    /// Publish an event on `channel`.
    fn publish(
        &self,
        channel: &str,
        event: WatchEvent,
    ) -> impl std::future::Future<Output = Result<(), PubSubError>> + Send;

    /// Receive every event published on `channel` from now on.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<WatchEvent>;
}

/// Multi-topic broadcast bus living in the current process.
pub struct InProcessPubSub {
    channels: DashMap<String, broadcast::Sender<WatchEvent>>,
    capacity: usize,
}

impl InProcessPubSub {
    /// Create a bus whose per-topic channels hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of topics that currently have a channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for InProcessPubSub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl PubSub for InProcessPubSub {
    async fn publish(&self, channel: &str, event: WatchEvent) -> Result<(), PubSubError> {
        let Some(sender) = self.channels.get(channel).map(|s| s.clone()) else {
            return Ok(());
        };
        if sender.send(event).is_err() {
            // Every receiver is gone; drop the topic.
            self.channels.remove_if(channel, |_, s| s.receiver_count() == 0);
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<WatchEvent> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl std::fmt::Debug for InProcessPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessPubSub")
            .field("channels", &self.channels.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
