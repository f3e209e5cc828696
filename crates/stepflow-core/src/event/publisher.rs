//! Ordered, bounded event publishing.
//!
//! Events are queued on a bounded `mpsc` channel and forwarded to the
//! [`PubSub`] by a single background task, so publish order is preserved
//! and a slow transport applies backpressure to the engine instead of
//! letting unflushed events pile up. [`EventPublisher::flush`] waits until
//! everything queued before it has been handed to the transport.

use std::sync::Arc;

use stepflow_types::event::{WatchEvent, run_channel};
use tokio::sync::{mpsc, oneshot};

use super::pubsub::PubSub;

enum Message {
    Publish(WatchEvent),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle to the publishing queue.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Message>,
}

impl EventPublisher {
    /// Start the forwarding task on the current tokio runtime.
    pub fn spawn<P: PubSub>(pubsub: Arc<P>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Publish(event) => {
                        let channel = run_channel(&event.run_id);
                        if let Err(e) = pubsub.publish(&channel, event).await {
                            tracing::warn!(channel = %channel, error = %e, "failed to publish watch event");
                        }
                    }
                    Message::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue an event on its run channel. Waits when the queue is full.
    pub async fn publish(&self, event: WatchEvent) {
        let event_type = event.event_type();
        if self.tx.send(Message::Publish(event)).await.is_err() {
            tracing::warn!(event = event_type.as_str(), "event publisher is closed; dropping event");
        }
    }

    /// Wait until every previously queued event reached the transport.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("capacity", &self.tx.max_capacity())
            .finish()
    }
}
