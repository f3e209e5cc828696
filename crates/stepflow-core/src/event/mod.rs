//! Watch-event distribution.
//!
//! - `pubsub` -- the `PubSub` port and its in-process broadcast implementation
//! - `publisher` -- bounded, ordered publishing queue used by the engine

pub mod publisher;
pub mod pubsub;

pub use publisher::EventPublisher;
pub use pubsub::{InProcessPubSub, PubSub};
