//! Transport boundary - what the relay needs from a pub/sub broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TransportContext                          │
//! │  - topic / subscription caches, active stream registry      │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Transport trait                          │
//! │  get/create topic · get/create subscription                  │
//! │  publish -> PublishFuture · streaming_pull -> StreamingPull  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                        │
//!          ▼                                        ▼
//! ┌──────────────────────┐              ┌──────────────────────┐
//! │  InMemoryTransport   │              │  broker clients      │
//! │     (included)       │              │     (external)       │
//! └──────────────────────┘              └──────────────────────┘
//! ```
//!
//! The trait is synchronous: admin calls are one network round
//! trip, publishes confirm through a `PublishFuture`, and pull streams push
//! messages into a callback on the transport's own threads.

mod completion;
mod in_memory;
mod message;

pub use completion::{Completion, PublishFuture, PublishOutcome};
pub use in_memory::InMemoryTransport;
pub use message::{
    AckHandle, Attributes, InboundMessage, OutboundMessage, CONTENT_TYPE_ATTRIBUTE,
    MESSAGE_ID_ATTRIBUTE, RETRY_COUNT_ATTRIBUTE,
};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{FlowControl, SubscriptionSettings};
use crate::error::TransportError;

/// A topic or subscription name scoped to a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    pub namespace: String,
    pub name: String,
}

impl ResourceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// A topic known to exist on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicRef {
    pub name: ResourceName,
    pub path: String,
}

impl TopicRef {
    pub fn new(name: ResourceName) -> Self {
        let path = format!("projects/{}/topics/{}", name.namespace, name.name);
        Self { name, path }
    }
}

/// A subscription known to exist, with the topic it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionRef {
    pub name: ResourceName,
    pub path: String,
    pub topic: TopicRef,
}

impl SubscriptionRef {
    pub fn new(name: ResourceName, topic: TopicRef) -> Self {
        let path = format!("projects/{}/subscriptions/{}", name.namespace, name.name);
        Self { name, path, topic }
    }
}

/// Everything a transport needs to create a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub name: ResourceName,
    pub topic: TopicRef,
    pub settings: SubscriptionSettings,
}

/// Result of a bounded wait on a pull stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamWait {
    /// The stream finished without error (usually because it was cancelled).
    Completed,
    /// Nothing happened within the wait window; the stream is still running.
    TimedOut,
    /// The stream died.
    Failed(TransportError),
}

/// Called by the transport once per delivery.
pub type DeliveryCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// A running flow-controlled pull stream.
pub trait StreamingPull: Send + Sync {
    /// Block until the stream ends or `timeout` elapses.
    fn wait(&self, timeout: Duration) -> StreamWait;

    /// Stop the stream. Later waits return `Completed`.
    fn cancel(&self);
}

/// Operations the relay consumes from a pub/sub broker.
///
/// Implementations might include:
/// - `InMemoryTransport` - for testing and single-process scenarios
/// - Google Cloud Pub/Sub, NATS JetStream or Kafka clients
pub trait Transport: Send + Sync {
    /// Fetch a topic; `TransportError::NotFound` when it does not exist.
    fn get_topic(&self, name: &ResourceName) -> Result<TopicRef, TransportError>;

    /// Create a topic; `TransportError::AlreadyExists` on a lost race.
    fn create_topic(&self, name: &ResourceName) -> Result<TopicRef, TransportError>;

    fn get_subscription(&self, name: &ResourceName) -> Result<SubscriptionRef, TransportError>;

    fn create_subscription(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionRef, TransportError>;

    /// Submit a message. Returns once the transport accepted it; persistence
    /// is reported through the future.
    fn publish(
        &self,
        topic: &TopicRef,
        message: OutboundMessage,
    ) -> Result<PublishFuture, TransportError>;

    /// Open a pull stream that feeds every delivery to `callback`.
    fn streaming_pull(
        &self,
        subscription: &SubscriptionRef,
        flow_control: &FlowControl,
        callback: DeliveryCallback,
    ) -> Result<Arc<dyn StreamingPull>, TransportError>;
}
