//! Wire-level messages exchanged with a transport.

use std::collections::BTreeMap;
use std::fmt;
use std::num::IntErrorKind;

/// Delivery attribute carrying how many times a message was already attempted.
pub const RETRY_COUNT_ATTRIBUTE: &str = "retry_count";

/// Attribute mirroring the application message id of an `OutboundEnvelope`.
pub const MESSAGE_ID_ATTRIBUTE: &str = "message_id";

/// Attribute naming how the payload bytes were encoded. See `Payload::content_type`.
pub const CONTENT_TYPE_ATTRIBUTE: &str = "content_type";

pub type Attributes = BTreeMap<String, String>;

/// Bytes plus attributes, ready to hand to `Transport::publish`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub attributes: Attributes,
}

impl OutboundMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Acknowledgment callback supplied by the transport for one delivery.
pub struct AckHandle(Box<dyn FnOnce() + Send>);

impl AckHandle {
    pub fn new<F>(ack: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(ack))
    }

    /// A handle that does nothing, for messages built outside a transport.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    fn ack(self) {
        (self.0)()
    }
}

/// One delivery of a message from a subscription.
///
/// `ack` consumes the message, so each delivery is acknowledged at most once.
/// Dropping it without acking leaves redelivery to the transport's lease.
pub struct InboundMessage {
    message_id: String,
    data: Vec<u8>,
    attributes: Attributes,
    ack: AckHandle,
}

impl InboundMessage {
    pub fn new(
        message_id: impl Into<String>,
        data: Vec<u8>,
        attributes: Attributes,
        ack: AckHandle,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            data,
            attributes,
            ack,
        }
    }

    /// Transport-assigned id of this message.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// The `retry_count` attribute, or 0 when absent or unparsable.
    ///
    /// Counts too large for a `u32` saturate at `u32::MAX`.
    pub fn retry_count(&self) -> u32 {
        self.attribute(RETRY_COUNT_ATTRIBUTE)
            .map_or(0, parse_retry_count)
    }

    /// How the payload bytes were encoded, if the publisher said.
    pub fn content_type(&self) -> Option<&str> {
        self.attribute(CONTENT_TYPE_ATTRIBUTE)
    }

    /// Permanently remove this delivery from the subscription.
    pub fn ack(self) {
        self.ack.ack()
    }
}

pub(crate) fn parse_retry_count(raw: &str) -> u32 {
    match raw.trim().parse::<u32>() {
        Ok(count) => count,
        Err(err) if *err.kind() == IntErrorKind::PosOverflow => u32::MAX,
        Err(_) => 0,
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("message_id", &self.message_id)
            .field("bytes", &self.data.len())
            .field("attributes", &self.attributes)
            .finish()
    }
}
