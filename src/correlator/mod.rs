//! Request correlator.
//!
//! Turns publish + subscribe into a request/reply call:
//!
//! ```text
//!  caller ── send_request ──► WorkerPool ──► Publisher ──► destination topic
//!    ▲                            │
//!    │                     waits on private slot
//!    │                            ▲
//!    └──── Exchange ◄─────────────┴── ReplyRouter ◄── reply stream (supervised)
//! ```
//!
//! Every request gets a fresh correlation id, embedded in the outbound record
//! as `message_id`. Replies are matched to pending requests by the
//! `message_id` they echo back, so any number of requests may be in flight.

mod exchange;
mod pending;
mod pool;
mod reply;

pub use exchange::{Exchange, LatencyBreakdown, StageTimings};
pub use pool::WorkerPool;
pub use reply::ReplyRouter;

use pending::Reply;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::Completion;
use crate::config::CorrelatorConfig;
use crate::context::TransportContext;
use crate::error::{CorrelatorError, SetupError};
use crate::payload::{OutboundEnvelope, Payload};
use crate::publisher::Publisher;
use crate::supervisor::{StreamHandle, StreamSupervisor};

/// Extra time the caller waits for a worker to report its own timeout.
const RESULT_GRACE: Duration = Duration::from_millis(50);

/// One outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    destination: String,
    payload: Payload,
    correlation_id: String,
    timeout: Option<Duration>,
}

impl Request {
    pub fn new(destination: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
            correlation_id: Uuid::new_v4().to_string(),
            timeout: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

struct Core {
    publisher: Publisher,
    router: ReplyRouter,
    config: CorrelatorConfig,
}

impl Core {
    fn publish(&self, destination: &str, envelope: OutboundEnvelope) -> Result<(), CorrelatorError> {
        let pending = &self.router.state().pending;
        let correlation_id = envelope.message_id.clone();
        pending.mark_send_started(&correlation_id);
        if let Err(err) = self.publisher.publish_envelope(destination, envelope) {
            pending.finish(&correlation_id);
            return Err(err.into());
        }
        pending.mark_sent(&correlation_id);
        debug!(correlation_id = %correlation_id, destination, "request sent");
        Ok(())
    }

    fn complete(&self, correlation_id: &str, reply: Reply, timeout: Duration) -> Exchange {
        match self.router.state().pending.finish(correlation_id) {
            Some(timings) => {
                let exchange = Exchange::completed(correlation_id, reply, timings);
                info!(
                    correlation_id,
                    latency_ms = exchange.latency_ms.unwrap_or_default(),
                    "response received"
                );
                exchange
            }
            None => self.time_out(correlation_id, timeout),
        }
    }

    fn time_out(&self, correlation_id: &str, timeout: Duration) -> Exchange {
        self.router.state().pending.finish(correlation_id);
        warn!(correlation_id, timeout_ms = timeout.as_millis() as u64, "timed out waiting for response");
        Exchange::timed_out(correlation_id, timeout)
    }

    /// Worker side of a blocking request: send, then poll the slot until the deadline.
    fn run_blocking(
        &self,
        request: Request,
        slot: Completion<Reply>,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<Exchange, CorrelatorError> {
        let correlation_id = request.correlation_id.clone();
        if Instant::now() >= deadline {
            debug!(correlation_id = %correlation_id, "deadline passed before a worker was free, not sending");
            return Ok(self.time_out(&correlation_id, timeout));
        }

        let envelope = OutboundEnvelope::with_message_id(correlation_id.clone(), request.payload);
        self.publish(&request.destination, envelope)?;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(self.time_out(&correlation_id, timeout));
            }
            let wait = self.config.poll_interval.min(deadline - now);
            if let Some(reply) = slot.wait(wait) {
                return Ok(self.complete(&correlation_id, reply, timeout));
            }
        }
    }
}

/// Sends requests and waits for their correlated replies.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use pubsub_relay::{Connector, InMemoryTransport, RelayConfig, StreamSupervisor, TransportContext};
///
/// let context = TransportContext::open(Arc::new(InMemoryTransport::new()), RelayConfig::new("test"));
/// let supervisor = StreamSupervisor::new(Arc::clone(&context));
/// let connector = Connector::new(Arc::clone(&context));
/// connector.listen(&supervisor, "to_users", "to_users_subscription").unwrap();
///
/// // Nobody answers on "from_users": the call times out without raising.
/// let exchange = connector
///     .send_and_await("from_users", "hello", Duration::from_millis(100))
///     .unwrap();
/// assert!(exchange.is_timeout());
///
/// connector.shutdown();
/// context.close();
/// ```
pub struct Connector {
    core: Arc<Core>,
    pool: WorkerPool,
}

impl Connector {
    pub fn new(context: Arc<TransportContext>) -> Self {
        let config = context.config().correlator.clone();
        Self::with_config(context, config)
    }

    pub fn with_config(context: Arc<TransportContext>, config: CorrelatorConfig) -> Self {
        let pool = WorkerPool::new(config.workers, "connector-worker");
        let router = ReplyRouter::new(config.matching, config.inbox_capacity);
        Self {
            core: Arc::new(Core {
                publisher: Publisher::new(context),
                router,
                config,
            }),
            pool,
        }
    }

    /// Handler to register on the reply subscription.
    pub fn reply_handler(&self) -> ReplyRouter {
        self.core.router.clone()
    }

    /// Start a supervised stream on `topic` / `subscription` that feeds replies
    /// to this connector.
    pub fn listen(
        &self,
        supervisor: &StreamSupervisor,
        topic: &str,
        subscription: &str,
    ) -> Result<StreamHandle, SetupError> {
        supervisor.start(topic, subscription, self.reply_handler())
    }

    /// Send `payload` to `destination` and block until the reply or `timeout`.
    pub fn send_and_await(
        &self,
        destination: &str,
        payload: impl Into<Payload>,
        timeout: Duration,
    ) -> Result<Exchange, CorrelatorError> {
        self.send_request(Request::new(destination, payload).with_timeout(timeout))
    }

    /// Blocking request on the worker pool.
    pub fn send_request(&self, request: Request) -> Result<Exchange, CorrelatorError> {
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or(self.core.config.default_timeout);
        let deadline = started + timeout;
        let correlation_id = request.correlation_id.clone();

        let slot = self.prepare(&correlation_id, started)?;

        let (tx, rx) = mpsc::channel();
        let core = Arc::clone(&self.core);
        let submitted = self.pool.execute(move || {
            let _ = tx.send(core.run_blocking(request, slot, timeout, deadline));
        });
        if let Err(err) = submitted {
            self.core.router.state().pending.finish(&correlation_id);
            return Err(err);
        }

        let wait = deadline.saturating_duration_since(Instant::now()) + RESULT_GRACE;
        match rx.recv_timeout(wait) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Ok(self.core.time_out(&correlation_id, timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                self.core.router.state().pending.finish(&correlation_id);
                Err(CorrelatorError::Worker(format!(
                    "worker exited without a result for {correlation_id}"
                )))
            }
        }
    }

    /// Send `payload` and suspend until the reply or `timeout`.
    #[cfg(feature = "async")]
    pub async fn send_and_await_async(
        &self,
        destination: &str,
        payload: impl Into<Payload>,
        timeout: Duration,
    ) -> Result<Exchange, CorrelatorError> {
        self.send_request_async(Request::new(destination, payload).with_timeout(timeout))
            .await
    }

    /// Suspend-until-signaled request: the reply router completes a oneshot.
    #[cfg(feature = "async")]
    pub async fn send_request_async(&self, request: Request) -> Result<Exchange, CorrelatorError> {
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or(self.core.config.default_timeout);
        let correlation_id = request.correlation_id.clone();

        let slot = self.prepare(&correlation_id, started)?;
        // Dropping this future mid-await must not leave the id reserved.
        let _pending = self.core.router.state().pending.guard(&correlation_id);
        let (tx, rx) = tokio::sync::oneshot::channel();
        slot.on_complete(move |reply| {
            let _ = tx.send(reply.clone());
        });

        let core = Arc::clone(&self.core);
        let envelope = OutboundEnvelope::with_message_id(correlation_id.clone(), request.payload);
        let destination = request.destination;
        let sent = tokio::task::spawn_blocking(move || core.publish(&destination, envelope)).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(CorrelatorError::Worker(err.to_string())),
        }

        let remaining = (started + timeout).saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(reply)) => Ok(self.core.complete(&correlation_id, reply, timeout)),
            _ => Ok(self.core.time_out(&correlation_id, timeout)),
        }
    }

    /// Requests currently waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.core.router.state().pending.len()
    }

    /// Replies that arrived without a matching request since the last send.
    pub fn unmatched_replies(&self) -> Vec<Payload> {
        self.core.router.state().inbox.snapshot()
    }

    /// Let queued requests finish and stop the worker threads.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn prepare(
        &self,
        correlation_id: &str,
        started: Instant,
    ) -> Result<Completion<Reply>, CorrelatorError> {
        let state = self.core.router.state();
        let purged = state.inbox.purge();
        if purged > 0 {
            debug!(purged, "discarded stale replies before send");
        }
        state.pending.register(correlation_id, started)
    }
}
