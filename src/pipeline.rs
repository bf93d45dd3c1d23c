//! Per-delivery decode, retry-budget check, dispatch and acknowledgment.
//!
//! Every delivery that enters [`DeliveryPipeline::deliver`] is acknowledged
//! exactly once, whatever the handler does. Redelivery is left to the
//! transport's ack deadline only.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::InboundMessage;
use crate::error::HandlerError;
use crate::payload::Payload;

/// Application callback registered per subscription.
///
/// `Ok(false)` declines the message; it is still acknowledged.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: Payload) -> Result<bool, HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(Payload) -> Result<bool, HandlerError> + Send + Sync,
{
    fn handle(&self, payload: Payload) -> Result<bool, HandlerError> {
        self(payload)
    }
}

/// What happened to a delivery. Every variant ends in an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    /// Handled successfully.
    Ack,
    /// Retry budget exhausted; the handler was never called.
    AckPoison,
    /// Looked structured but did not parse.
    AckMalformed,
    /// The handler returned `false`.
    AckDeclined,
    /// The handler returned an error or panicked.
    AckHandlerError,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Ack => "ack",
            DeliveryOutcome::AckPoison => "ack_poison",
            DeliveryOutcome::AckMalformed => "ack_malformed",
            DeliveryOutcome::AckDeclined => "ack_declined",
            DeliveryOutcome::AckHandlerError => "ack_handler_error",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome delivery counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub handled: usize,
    pub poison: usize,
    pub malformed: usize,
    pub declined: usize,
    pub handler_errors: usize,
}

impl DeliveryCounts {
    pub fn total(&self) -> usize {
        self.handled + self.poison + self.malformed + self.declined + self.handler_errors
    }
}

#[derive(Default)]
struct Counters {
    handled: AtomicUsize,
    poison: AtomicUsize,
    malformed: AtomicUsize,
    declined: AtomicUsize,
    handler_errors: AtomicUsize,
}

impl Counters {
    fn record(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Ack => &self.handled,
            DeliveryOutcome::AckPoison => &self.poison,
            DeliveryOutcome::AckMalformed => &self.malformed,
            DeliveryOutcome::AckDeclined => &self.declined,
            DeliveryOutcome::AckHandlerError => &self.handler_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DeliveryCounts {
        DeliveryCounts {
            handled: self.handled.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            declined: self.declined.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// Decode → dispatch → acknowledge for one subscription.
#[derive(Clone)]
pub struct DeliveryPipeline {
    subscription: String,
    handler: Arc<dyn MessageHandler>,
    max_retries: u32,
    counters: Arc<Counters>,
}

impl DeliveryPipeline {
    pub fn new(
        subscription: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        max_retries: u32,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            handler,
            max_retries,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Decide the outcome of a delivery without acknowledging it.
    pub fn evaluate(&self, message: &InboundMessage) -> DeliveryOutcome {
        let retry_count = message.retry_count();
        if retry_count >= self.max_retries {
            warn!(
                subscription = %self.subscription,
                message_id = message.message_id(),
                retry_count,
                "retry budget exhausted, dropping message"
            );
            return DeliveryOutcome::AckPoison;
        }

        let payload = match Payload::decode_with(message.data(), message.content_type()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    subscription = %self.subscription,
                    message_id = message.message_id(),
                    error = %err,
                    "dropping malformed message"
                );
                return DeliveryOutcome::AckMalformed;
            }
        };

        let handler = Arc::clone(&self.handler);
        let result = panic::catch_unwind(AssertUnwindSafe(move || handler.handle(payload)))
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));

        match result {
            Ok(true) => DeliveryOutcome::Ack,
            Ok(false) => {
                warn!(
                    subscription = %self.subscription,
                    message_id = message.message_id(),
                    "handler declined message"
                );
                DeliveryOutcome::AckDeclined
            }
            Err(err) => {
                warn!(
                    subscription = %self.subscription,
                    message_id = message.message_id(),
                    error = %err,
                    "handler failed, acknowledging anyway"
                );
                DeliveryOutcome::AckHandlerError
            }
        }
    }

    /// Evaluate and acknowledge a delivery.
    pub fn deliver(&self, message: InboundMessage) -> DeliveryOutcome {
        let outcome = self.evaluate(&message);
        debug!(
            subscription = %self.subscription,
            message_id = message.message_id(),
            %outcome,
            "acknowledging"
        );
        message.ack();
        self.counters.record(outcome);
        outcome
    }

    pub fn counts(&self) -> DeliveryCounts {
        self.counters.snapshot()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
