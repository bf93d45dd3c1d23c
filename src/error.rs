//! Error types shared across the relay.
//!
//! Only `SetupError` (and `PublishError`, which wraps it) is meant to reach
//! callers. Decode, handler and stream errors are recovered below the
//! supervisor and only ever logged.

use std::error::Error;

use thiserror::Error;

/// Errors reported by a `Transport` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The topic or subscription does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A create call raced with another creator.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The transport could not be reached or dropped the stream.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// Anything else the transport reports.
    #[error("transport error: {0}")]
    Other(String),
}

/// Failure to provision a topic, subscription or stream.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to provision topic {name}: {source}")]
    Topic {
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to provision subscription {name}: {source}")]
    Subscription {
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to open stream {key}: {source}")]
    Stream {
        key: String,
        #[source]
        source: TransportError,
    },
    #[error("transport context is closed")]
    ContextClosed,
}

/// A payload that looked structured but did not parse.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed structured payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Error returned by a message handler.
///
/// The delivery pipeline logs these and still acknowledges the message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler refused the payload.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The payload did not have the shape the handler expects.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("handler error: {0}")]
    Other(Box<dyn Error + Send + Sync>),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

/// Failure to submit a publish call.
///
/// Delivery failures after submission are reported through the
/// `PublishFuture`, not here.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
    #[error("publish to {topic} failed: {source}")]
    Submit {
        topic: String,
        #[source]
        source: TransportError,
    },
    /// The endpoint's role does not allow sending to this topic.
    #[error("topic {0} is not in this endpoint's send routes")]
    NotPermitted(String),
}

/// Errors from the request correlator.
///
/// Timeouts are not errors; they come back as an `Exchange` with no response.
#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelationId(String),
    #[error("connector worker pool is shut down")]
    PoolClosed,
    #[error("request worker failed: {0}")]
    Worker(String),
}

/// Errors loading a `RelayConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors binding an endpoint to its routes.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("role {0} has no routes")]
    UnknownRole(String),
    #[error(transparent)]
    Setup(#[from] SetupError),
}
