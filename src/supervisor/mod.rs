//! Streaming supervisor.
//!
//! Keeps one pull stream alive per (topic, subscription) key:
//!
//! ```text
//! STARTING -> STREAMING -> (TIMED_OUT | FAILED) -> RESUBSCRIBING -> STREAMING
//!                                                                  \-> STOPPED
//! ```
//!
//! Each stream gets a supervising thread. Removing the key from the
//! context's registry is the stop signal: the thread notices between wait
//! iterations, cancels its pull and exits.

mod thread;

pub(crate) use thread::ActiveStream;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::bus::Completion;
use crate::config::SupervisorConfig;
use crate::context::TransportContext;
use crate::error::SetupError;
use crate::pipeline::{DeliveryCounts, MessageHandler};

/// Registry key: one active stream per (topic, subscription).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub topic: String,
    pub subscription: String,
}

impl StreamKey {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.subscription)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    Streaming,
    TimedOut,
    Failed,
    Resubscribing,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The key was removed from the registry.
    Requested,
    /// Too many consecutive stream failures.
    RetriesExhausted,
    /// The transport finished the stream on its own.
    StreamEnded,
}

/// What a supervised stream did over its lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub waits: usize,
    pub timeouts: usize,
    pub failures: usize,
    pub resubscribes: usize,
    pub deliveries: DeliveryCounts,
    pub stop_reason: Option<StopReason>,
}

pub(crate) struct StreamStatus {
    state: Mutex<StreamState>,
    stopped: Completion<StreamStats>,
}

impl StreamStatus {
    fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::Starting),
            stopped: Completion::new(),
        }
    }

    pub(crate) fn set(&self, state: StreamState) {
        *self.state.lock() = state;
    }

    pub(crate) fn finish(&self, stats: StreamStats) {
        self.set(StreamState::Stopped);
        self.stopped.complete(stats);
    }
}

/// Observer for one supervised stream.
#[derive(Clone)]
pub struct StreamHandle {
    key: StreamKey,
    status: Arc<StreamStatus>,
}

impl StreamHandle {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn state(&self) -> StreamState {
        *self.status.state.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.status.stopped.is_complete()
    }

    /// Wait for the stream to reach `Stopped`; `None` if still running at `timeout`.
    pub fn wait_stopped(&self, timeout: Duration) -> Option<StreamStats> {
        self.status.stopped.wait(timeout)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Starts, tracks and stops supervised pull streams on a context.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use pubsub_relay::{InMemoryTransport, Payload, RelayConfig, StreamSupervisor, TransportContext};
/// use pubsub_relay::error::HandlerError;
///
/// let transport = InMemoryTransport::new();
/// let context = TransportContext::open(Arc::new(transport), RelayConfig::new("test"));
/// let supervisor = StreamSupervisor::new(Arc::clone(&context));
///
/// let handle = supervisor
///     .start("events", "events_subscription", |payload: Payload| -> Result<bool, HandlerError> {
///         println!("got {payload}");
///         Ok(true)
///     })
///     .unwrap();
///
/// let stats = supervisor.stop(handle.key()).unwrap();
/// assert!(stats.stop_reason.is_some());
/// context.close();
/// ```
#[derive(Clone)]
pub struct StreamSupervisor {
    context: Arc<TransportContext>,
    config: SupervisorConfig,
}

impl StreamSupervisor {
    pub fn new(context: Arc<TransportContext>) -> Self {
        let config = context.config().supervisor.clone();
        Self { context, config }
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.context
    }

    /// Provision `subscription` on `topic` and start streaming it into `handler`.
    ///
    /// Starting a key that is already active returns the running stream's handle.
    pub fn start<H>(
        &self,
        topic: &str,
        subscription: &str,
        handler: H,
    ) -> Result<StreamHandle, SetupError>
    where
        H: MessageHandler + 'static,
    {
        self.start_shared(topic, subscription, Arc::new(handler))
    }

    pub fn start_shared(
        &self,
        topic: &str,
        subscription: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<StreamHandle, SetupError> {
        let key = StreamKey::new(topic, subscription);
        self.context.exclusive(|| {
            if let Some(handle) = self.context.active_stream(&key) {
                return Ok(handle);
            }
            let sub = self.context.ensure_subscription(topic, subscription)?;
            let handle = StreamHandle {
                key: key.clone(),
                status: Arc::new(StreamStatus::new()),
            };
            thread::spawn_stream(
                Arc::clone(&self.context),
                self.config.clone(),
                handle.clone(),
                sub,
                handler,
            )?;
            Ok(handle)
        })
    }

    /// Stop a stream and wait for its supervising thread to exit.
    ///
    /// Returns `None` when the key was not active.
    pub fn stop(&self, key: &StreamKey) -> Option<StreamStats> {
        let stream = self.context.remove_stream(key)?;
        info!(stream = %key, "stopping stream");
        let handle = stream.handle.clone();
        if stream.shutdown() {
            handle.status.stopped.try_get()
        } else {
            None
        }
    }

    pub fn is_active(&self, key: &StreamKey) -> bool {
        self.context.active_stream(key).is_some()
    }

    pub fn handle(&self, key: &StreamKey) -> Option<StreamHandle> {
        self.context.active_stream(key)
    }

    pub fn active_streams(&self) -> Vec<StreamKey> {
        self.context.active_stream_keys()
    }
}
