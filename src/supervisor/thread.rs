//! Supervising thread for a single pull stream.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use super::{StopReason, StreamHandle, StreamKey, StreamState, StreamStats};
use crate::bus::{InboundMessage, StreamWait, StreamingPull, SubscriptionRef};
use crate::config::{FlowControl, SupervisorConfig};
use crate::context::TransportContext;
use crate::error::{SetupError, TransportError};
use crate::pipeline::{DeliveryPipeline, MessageHandler};

/// Registry entry for a running stream.
///
/// Dropping `stop_tx` disconnects the worker's stop channel, which ends a
/// backoff sleep early.
pub(crate) struct ActiveStream {
    pub(crate) generation: u64,
    pub(crate) handle: StreamHandle,
    pub(crate) pull: Arc<dyn StreamingPull>,
    pub(crate) thread: Option<JoinHandle<()>>,
    stop_tx: Sender<()>,
}

impl ActiveStream {
    /// Signal the worker, cancel its pull and join it.
    ///
    /// Returns `false` when the worker could not be joined, e.g. when called
    /// from the worker itself.
    pub(crate) fn shutdown(self) -> bool {
        let ActiveStream {
            pull,
            thread,
            stop_tx,
            ..
        } = self;
        drop(stop_tx);
        pull.cancel();
        match thread {
            Some(thread) if thread.thread().id() != thread::current().id() => thread.join().is_ok(),
            _ => false,
        }
    }
}

/// Open the first pull, register the stream and spawn its worker.
///
/// Must run under `TransportContext::exclusive`.
pub(super) fn spawn_stream(
    context: Arc<TransportContext>,
    config: SupervisorConfig,
    handle: StreamHandle,
    subscription: SubscriptionRef,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), SetupError> {
    let key = handle.key.clone();
    let pipeline = DeliveryPipeline::new(
        subscription.name.name.clone(),
        handler,
        context.config().max_delivery_retries,
    );
    let flow = context.config().flow_control.clone();
    let stream_error = |source| SetupError::Stream {
        key: key.to_string(),
        source,
    };

    let pull = open_pull(&context, &subscription, &flow, &pipeline).map_err(stream_error)?;
    let generation = context.next_generation();
    let (stop_tx, stop_rx) = mpsc::channel();
    let registered = context.register_stream(
        key.clone(),
        ActiveStream {
            generation,
            handle: handle.clone(),
            pull: Arc::clone(&pull),
            thread: None,
            stop_tx,
        },
    );
    if let Err(err) = registered {
        pull.cancel();
        return Err(err);
    }
    handle.status.set(StreamState::Streaming);
    info!(
        stream = %key,
        subscription = %subscription.name,
        "stream started"
    );

    let worker = StreamWorker {
        context: Arc::clone(&context),
        config,
        key: key.clone(),
        generation,
        subscription,
        flow,
        pipeline,
        handle,
        stop_rx,
    };
    match thread::Builder::new()
        .name(format!("stream-{key}"))
        .spawn(move || worker.run(pull))
    {
        Ok(thread) => {
            context.attach_thread(&key, generation, thread);
            Ok(())
        }
        Err(err) => {
            if let Some(stream) = context.remove_stream_if_current(&key, generation) {
                stream.pull.cancel();
            }
            Err(stream_error(TransportError::Other(err.to_string())))
        }
    }
}

fn open_pull(
    context: &TransportContext,
    subscription: &SubscriptionRef,
    flow: &FlowControl,
    pipeline: &DeliveryPipeline,
) -> Result<Arc<dyn StreamingPull>, TransportError> {
    let pipeline = pipeline.clone();
    context.transport().streaming_pull(
        subscription,
        flow,
        Arc::new(move |message: InboundMessage| {
            pipeline.deliver(message);
        }),
    )
}

struct StreamWorker {
    context: Arc<TransportContext>,
    config: SupervisorConfig,
    key: StreamKey,
    generation: u64,
    subscription: SubscriptionRef,
    flow: FlowControl,
    pipeline: DeliveryPipeline,
    handle: StreamHandle,
    stop_rx: Receiver<()>,
}

impl StreamWorker {
    fn is_current(&self) -> bool {
        self.context.is_current_stream(&self.key, self.generation)
    }

    fn run(self, mut pull: Arc<dyn StreamingPull>) {
        let status = &self.handle.status;
        let mut stats = StreamStats::default();
        let mut failures: u32 = 0;
        let mut backoff = self.config.initial_backoff;
        // A failed resubscribe is handled like a stream failure.
        let mut pending: Option<TransportError> = None;

        let reason = loop {
            let err = match pending.take() {
                Some(err) => err,
                None => {
                    if !self.is_current() {
                        break StopReason::Requested;
                    }
                    status.set(StreamState::Streaming);
                    stats.waits += 1;
                    match pull.wait(self.config.stream_wait) {
                        StreamWait::TimedOut => {
                            stats.timeouts += 1;
                            status.set(StreamState::TimedOut);
                            if failures > 0 {
                                debug!(stream = %self.key, failures, "stream recovered");
                                failures = 0;
                                backoff = self.config.initial_backoff;
                            }
                            continue;
                        }
                        StreamWait::Completed if self.is_current() => {
                            break StopReason::StreamEnded;
                        }
                        StreamWait::Completed => break StopReason::Requested,
                        StreamWait::Failed(err) => err,
                    }
                }
            };

            failures += 1;
            stats.failures += 1;
            status.set(StreamState::Failed);
            if failures >= self.config.max_failures {
                error!(
                    stream = %self.key,
                    failures,
                    error = %err,
                    "stream failed too many times, giving up"
                );
                break StopReason::RetriesExhausted;
            }
            warn!(
                stream = %self.key,
                failures,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "stream failed, resubscribing"
            );

            status.set(StreamState::Resubscribing);
            match self.stop_rx.recv_timeout(backoff) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break StopReason::Requested,
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
            if !self.is_current() {
                break StopReason::Requested;
            }

            match open_pull(&self.context, &self.subscription, &self.flow, &self.pipeline) {
                Ok(next) => {
                    if !self
                        .context
                        .replace_stream_pull(&self.key, self.generation, Arc::clone(&next))
                    {
                        next.cancel();
                        break StopReason::Requested;
                    }
                    pull = next;
                    stats.resubscribes += 1;
                    info!(stream = %self.key, "resubscribed");
                }
                Err(err) => pending = Some(err),
            }
        };

        pull.cancel();
        if reason != StopReason::Requested {
            // Detaches our own join handle.
            drop(self.context.remove_stream_if_current(&self.key, self.generation));
        }
        stats.deliveries = self.pipeline.counts();
        stats.stop_reason = Some(reason);
        info!(
            stream = %self.key,
            reason = ?reason,
            delivered = stats.deliveries.total(),
            "stream stopped"
        );
        status.finish(stats);
    }
}
