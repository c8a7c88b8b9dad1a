//! Client library for a distributed topic/channel pub-sub message broker
//!
//! Two entry points: [`Publisher`] sends messages to topics with a
//! configurable atomicity policy, and [`Subscriber`] discovers broker nodes
//! for a topic, maintains per-node connections and delivers messages to a
//! user-supplied [`handler::MessageHandler`].

pub mod error;
pub mod handler;

mod connection;
mod frame;
mod host_port;
mod publisher;
mod subscriber;
#[cfg(test)]
mod test_support;
mod types;

pub use connection::{CloseCause, PubConnection, SubConnection};
pub use host_port::HostAndPort;
pub use publisher::{Publisher, PublisherConfig};
pub use subscriber::{Subscriber, SubscriberConfig};
pub use types::{Channel, InvalidName, Message, MessageId, SubscriptionId, Topic};
