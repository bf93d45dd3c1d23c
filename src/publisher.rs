//! Outbound publishing.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::bus::{OutboundMessage, PublishFuture};
use crate::context::TransportContext;
use crate::error::PublishError;
use crate::payload::{OutboundEnvelope, Payload};

/// Serializes payloads and submits them to a topic.
///
/// `publish` returns as soon as the transport accepted the message; the
/// persistence outcome is logged from the future's callback and can also be
/// awaited through the returned `PublishFuture`.
#[derive(Clone)]
pub struct Publisher {
    context: Arc<TransportContext>,
}

impl Publisher {
    pub fn new(context: Arc<TransportContext>) -> Self {
        Self { context }
    }

    /// Publish a payload as-is: records as JSON, text as UTF-8, bytes untouched.
    ///
    /// The content type attribute lets subscribers decode the same variant.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
    ) -> Result<PublishFuture, PublishError> {
        let message = payload.into().into_message()?;
        self.submit(topic, message, None)
    }

    /// Publish any serializable value, falling back to its debug text.
    pub fn publish_value<T>(&self, topic: &str, value: &T) -> Result<PublishFuture, PublishError>
    where
        T: Serialize + std::fmt::Debug,
    {
        self.publish(topic, Payload::best_effort(value))
    }

    /// Publish a payload tagged with its application message id.
    pub fn publish_envelope(
        &self,
        topic: &str,
        envelope: OutboundEnvelope,
    ) -> Result<PublishFuture, PublishError> {
        let message_id = envelope.message_id.clone();
        let message = envelope.into_message()?;
        self.submit(topic, message, Some(message_id))
    }

    fn submit(
        &self,
        topic: &str,
        message: OutboundMessage,
        message_id: Option<String>,
    ) -> Result<PublishFuture, PublishError> {
        let topic_ref = self.context.ensure_topic(topic)?;
        let bytes = message.data.len();
        let future = self
            .context
            .transport()
            .publish(&topic_ref, message)
            .map_err(|source| PublishError::Submit {
                topic: topic.to_string(),
                source,
            })?;

        let topic = topic.to_string();
        future.add_done_callback(move |outcome| match outcome {
            Ok(server_id) => debug!(
                topic = %topic,
                server_id = %server_id,
                correlation_id = message_id.as_deref().unwrap_or("-"),
                bytes,
                "publish confirmed"
            ),
            Err(err) => warn!(
                topic = %topic,
                correlation_id = message_id.as_deref().unwrap_or("-"),
                error = %err,
                "publish failed"
            ),
        });
        Ok(future)
    }
}
