//! Request/reply and self-healing subscription streams over an
//! at-least-once pub/sub transport.
//!
//! - [`TransportContext`] provisions topics and subscriptions once and owns
//!   the registry of active streams.
//! - [`StreamSupervisor`] keeps each subscription's pull stream alive,
//!   resubscribing with backoff.
//! - [`DeliveryPipeline`] decodes, dispatches and always acknowledges.
//! - [`Publisher`] sends payloads; [`Connector`] correlates requests with replies.

pub mod bus;
pub mod config;
mod context;
mod correlator;
pub mod error;
mod payload;
mod pipeline;
mod publisher;
mod routes;
mod supervisor;

pub use bus::{InMemoryTransport, Transport};
pub use config::{
    CorrelatorConfig, FlowControl, RelayConfig, ReplyMatching, SubscriptionSettings,
    SupervisorConfig,
};
pub use context::TransportContext;
pub use correlator::{
    Connector, Exchange, LatencyBreakdown, ReplyRouter, Request, StageTimings, WorkerPool,
};
pub use error::{
    ConfigError, CorrelatorError, DecodeError, HandlerError, PublishError, RouteError, SetupError,
    TransportError,
};
pub use payload::{
    OutboundEnvelope, Payload, BYTES_CONTENT_TYPE, JSON_CONTENT_TYPE, MESSAGE_FIELD,
    MESSAGE_ID_FIELD, TEXT_CONTENT_TYPE,
};
pub use pipeline::{DeliveryCounts, DeliveryOutcome, DeliveryPipeline, MessageHandler};
pub use publisher::Publisher;
pub use routes::{Endpoint, RouteTable, TopicRoutes};
pub use supervisor::{StopReason, StreamHandle, StreamKey, StreamState, StreamStats, StreamSupervisor};
