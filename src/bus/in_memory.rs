//! In-memory transport for testing and single-process scenarios.
//!
//! Implements the full `Transport` contract without a broker:
//! - topics fan out to every subscription bound to them
//! - each pull stream runs on its own thread and respects flow control
//! - un-acked deliveries are redelivered after the ack deadline with an
//!   incremented `retry_count` attribute
//! - faults can be injected into creates, publishes and streams

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    AckHandle, Attributes, Completion, DeliveryCallback, InboundMessage, OutboundMessage,
    PublishFuture, ResourceName, StreamWait, StreamingPull, SubscriptionRef, SubscriptionSpec,
    TopicRef, Transport, RETRY_COUNT_ATTRIBUTE,
};
use super::message::parse_retry_count;
use crate::config::{FlowControl, SubscriptionSettings};
use crate::error::TransportError;

const IDLE_POLL: Duration = Duration::from_millis(1);

/// In-memory pub/sub transport.
///
/// Cloning yields another handle to the same broker state.
///
/// ## Example
///
/// ```
/// use pubsub_relay::bus::{InMemoryTransport, OutboundMessage, ResourceName, Transport};
///
/// let transport = InMemoryTransport::new();
/// let topic = transport.create_topic(&ResourceName::new("test", "orders")).unwrap();
/// transport.publish(&topic, OutboundMessage::new(b"{}".to_vec())).unwrap();
///
/// assert_eq!(transport.published("orders").len(), 1);
/// assert_eq!(transport.create_topic_calls(), 1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    calls: CallCounts,
    next_message_id: AtomicU64,
}

#[derive(Default)]
struct State {
    topics: HashMap<ResourceName, TopicState>,
    subscriptions: HashMap<ResourceName, Arc<SubscriptionQueue>>,
}

struct TopicState {
    subscriptions: Vec<ResourceName>,
    log: Vec<OutboundMessage>,
}

#[derive(Default)]
struct Faults {
    round_trip: Duration,
    create_failures: VecDeque<TransportError>,
    publish_failures: VecDeque<TransportError>,
    open_failures: VecDeque<TransportError>,
    /// Subscription short name -> streams that will die right after opening.
    stream_failures: HashMap<String, usize>,
}

#[derive(Default)]
struct CallCounts {
    get_topic: AtomicUsize,
    create_topic: AtomicUsize,
    get_subscription: AtomicUsize,
    create_subscription: AtomicUsize,
    publish: AtomicUsize,
    streaming_pull: AtomicUsize,
}

#[derive(Clone)]
struct Stored {
    message_id: String,
    data: Vec<u8>,
    attributes: Attributes,
}

struct Outstanding {
    stored: Stored,
    delivery: u64,
    lease_expires: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    outstanding: HashMap<String, Outstanding>,
    acked: Vec<String>,
    next_delivery: u64,
}

struct SubscriptionQueue {
    name: ResourceName,
    settings: SubscriptionSettings,
    state: Mutex<QueueState>,
}

impl SubscriptionQueue {
    fn push(&self, stored: Stored) {
        self.state.lock().ready.push_back(stored);
    }

    /// Move expired leases back to the front of the queue, bumping their retry count.
    fn requeue_expired(state: &mut QueueState, now: Instant) {
        let expired: Vec<String> = state
            .outstanding
            .iter()
            .filter(|(_, o)| o.lease_expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(outstanding) = state.outstanding.remove(&id) {
                let mut stored = outstanding.stored;
                let retries = stored
                    .attributes
                    .get(RETRY_COUNT_ATTRIBUTE)
                    .map_or(0, |raw| parse_retry_count(raw));
                stored.attributes.insert(
                    RETRY_COUNT_ATTRIBUTE.to_string(),
                    retries.saturating_add(1).to_string(),
                );
                state.ready.push_front(stored);
            }
        }
    }

    /// Lease as many ready messages as flow control allows.
    ///
    /// Each lease lasts the ack deadline, capped by the stream's `max_lease`.
    fn next_batch(self: &Arc<Self>, flow: &FlowControl) -> Vec<InboundMessage> {
        let lease = self.settings.ack_deadline.min(flow.max_lease);
        let mut state = self.state.lock();
        Self::requeue_expired(&mut state, Instant::now());

        let mut held_bytes: usize = state
            .outstanding
            .values()
            .map(|o| o.stored.data.len())
            .sum();
        let mut batch = Vec::new();
        while let Some(front) = state.ready.front() {
            if state.outstanding.len() >= flow.max_messages {
                break;
            }
            // A single oversized message may still go out on an idle stream.
            if !state.outstanding.is_empty() && held_bytes + front.data.len() > flow.max_bytes {
                break;
            }
            let Some(stored) = state.ready.pop_front() else {
                break;
            };
            state.next_delivery += 1;
            let delivery = state.next_delivery;
            held_bytes += stored.data.len();

            let queue = Arc::downgrade(self);
            let id = stored.message_id.clone();
            let ack = AckHandle::new(move || ack_delivery(&queue, &id, delivery));
            batch.push(InboundMessage::new(
                stored.message_id.clone(),
                stored.data.clone(),
                stored.attributes.clone(),
                ack,
            ));
            state.outstanding.insert(
                stored.message_id.clone(),
                Outstanding {
                    stored,
                    delivery,
                    lease_expires: Instant::now() + lease,
                },
            );
        }
        batch
    }
}

fn ack_delivery(queue: &Weak<SubscriptionQueue>, message_id: &str, delivery: u64) {
    let Some(queue) = queue.upgrade() else {
        return;
    };
    let mut state = queue.state.lock();
    // A late ack for a delivery that was already leased out again is ignored.
    if state.outstanding.get(message_id).map(|o| o.delivery) == Some(delivery) {
        state.outstanding.remove(message_id);
        state.acked.push(message_id.to_string());
    }
}

struct InMemoryPull {
    done: Completion<Result<(), TransportError>>,
    cancelled: Arc<AtomicBool>,
}

impl StreamingPull for InMemoryPull {
    fn wait(&self, timeout: Duration) -> StreamWait {
        match self.done.wait(timeout) {
            None => StreamWait::TimedOut,
            Some(Ok(())) => StreamWait::Completed,
            Some(Err(err)) => StreamWait::Failed(err),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.done.complete(Ok(()));
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every admin call (get/create) take at least `latency`.
    pub fn with_round_trip(self, latency: Duration) -> Self {
        self.inner.faults.lock().round_trip = latency;
        self
    }

    /// The next create call (topic or subscription) fails with `err`.
    pub fn fail_next_create(&self, err: TransportError) {
        self.inner.faults.lock().create_failures.push_back(err);
    }

    /// The next publish submission fails with `err`.
    pub fn fail_next_publish(&self, err: TransportError) {
        self.inner.faults.lock().publish_failures.push_back(err);
    }

    /// The next `streaming_pull` call is refused with `err`.
    pub fn fail_next_stream_open(&self, err: TransportError) {
        self.inner.faults.lock().open_failures.push_back(err);
    }

    /// The next `count` streams opened on `subscription` die right after opening.
    pub fn fail_streams(&self, subscription: &str, count: usize) {
        *self
            .inner
            .faults
            .lock()
            .stream_failures
            .entry(subscription.to_string())
            .or_default() += count;
    }

    /// Publish to a topic by short name, bypassing the relay.
    pub fn publish_raw(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<String, TransportError> {
        let topic = self
            .find_topic(topic)
            .ok_or_else(|| TransportError::NotFound(topic.to_string()))?;
        self.deliver(&topic, message)
    }

    /// Every message published to `topic`, in order.
    pub fn published(&self, topic: &str) -> Vec<OutboundMessage> {
        let state = self.inner.state.lock();
        state
            .topics
            .iter()
            .find(|(name, _)| name.name == topic)
            .map(|(_, t)| t.log.clone())
            .unwrap_or_default()
    }

    /// Short names of every topic.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .state
            .lock()
            .topics
            .keys()
            .map(|n| n.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Short names of every subscription.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .state
            .lock()
            .subscriptions
            .keys()
            .map(|n| n.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Transport ids acknowledged on `subscription`, in ack order.
    pub fn acked(&self, subscription: &str) -> Vec<String> {
        self.find_queue(subscription)
            .map(|q| q.state.lock().acked.clone())
            .unwrap_or_default()
    }

    /// Deliveries leased out and not yet acked.
    pub fn outstanding(&self, subscription: &str) -> usize {
        self.find_queue(subscription)
            .map(|q| q.state.lock().outstanding.len())
            .unwrap_or(0)
    }

    /// Messages waiting to be delivered.
    pub fn backlog(&self, subscription: &str) -> usize {
        self.find_queue(subscription)
            .map(|q| q.state.lock().ready.len())
            .unwrap_or(0)
    }

    pub fn subscription_settings(&self, subscription: &str) -> Option<SubscriptionSettings> {
        self.find_queue(subscription).map(|q| q.settings.clone())
    }

    pub fn get_topic_calls(&self) -> usize {
        self.inner.calls.get_topic.load(Ordering::SeqCst)
    }

    pub fn create_topic_calls(&self) -> usize {
        self.inner.calls.create_topic.load(Ordering::SeqCst)
    }

    pub fn get_subscription_calls(&self) -> usize {
        self.inner.calls.get_subscription.load(Ordering::SeqCst)
    }

    pub fn create_subscription_calls(&self) -> usize {
        self.inner.calls.create_subscription.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.inner.calls.publish.load(Ordering::SeqCst)
    }

    pub fn streaming_pull_calls(&self) -> usize {
        self.inner.calls.streaming_pull.load(Ordering::SeqCst)
    }

    fn round_trip(&self) {
        let latency = self.inner.faults.lock().round_trip;
        if !latency.is_zero() {
            thread::sleep(latency);
        }
    }

    fn find_topic(&self, short_name: &str) -> Option<TopicRef> {
        self.inner
            .state
            .lock()
            .topics
            .keys()
            .find(|name| name.name == short_name)
            .cloned()
            .map(TopicRef::new)
    }

    fn find_queue(&self, short_name: &str) -> Option<Arc<SubscriptionQueue>> {
        self.inner
            .state
            .lock()
            .subscriptions
            .iter()
            .find(|(name, _)| name.name == short_name)
            .map(|(_, queue)| Arc::clone(queue))
    }

    fn take_stream_failure(inner: &Inner, subscription: &str) -> bool {
        let mut faults = inner.faults.lock();
        match faults.stream_failures.get_mut(subscription) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn deliver(&self, topic: &TopicRef, message: OutboundMessage) -> Result<String, TransportError> {
        let mut state = self.inner.state.lock();
        let targets: Vec<Arc<SubscriptionQueue>> = {
            let topic_state = state
                .topics
                .get(&topic.name)
                .ok_or_else(|| TransportError::NotFound(topic.path.clone()))?;
            topic_state
                .subscriptions
                .iter()
                .filter_map(|name| state.subscriptions.get(name).cloned())
                .collect()
        };

        let id = self.inner.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message_id = id.to_string();
        for queue in targets {
            queue.push(Stored {
                message_id: message_id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
            });
        }
        if let Some(topic_state) = state.topics.get_mut(&topic.name) {
            topic_state.log.push(message);
        }
        Ok(message_id)
    }
}

impl Transport for InMemoryTransport {
    fn get_topic(&self, name: &ResourceName) -> Result<TopicRef, TransportError> {
        self.inner.calls.get_topic.fetch_add(1, Ordering::SeqCst);
        self.round_trip();
        if self.inner.state.lock().topics.contains_key(name) {
            Ok(TopicRef::new(name.clone()))
        } else {
            Err(TransportError::NotFound(name.to_string()))
        }
    }

    fn create_topic(&self, name: &ResourceName) -> Result<TopicRef, TransportError> {
        self.inner.calls.create_topic.fetch_add(1, Ordering::SeqCst);
        self.round_trip();
        if let Some(err) = self.inner.faults.lock().create_failures.pop_front() {
            return Err(err);
        }
        let mut state = self.inner.state.lock();
        if state.topics.contains_key(name) {
            return Err(TransportError::AlreadyExists(name.to_string()));
        }
        state.topics.insert(
            name.clone(),
            TopicState {
                subscriptions: Vec::new(),
                log: Vec::new(),
            },
        );
        Ok(TopicRef::new(name.clone()))
    }

    fn get_subscription(&self, name: &ResourceName) -> Result<SubscriptionRef, TransportError> {
        self.inner.calls.get_subscription.fetch_add(1, Ordering::SeqCst);
        self.round_trip();
        let state = self.inner.state.lock();
        let topic = state
            .topics
            .iter()
            .find(|(_, t)| t.subscriptions.contains(name))
            .map(|(topic, _)| TopicRef::new(topic.clone()));
        match (state.subscriptions.contains_key(name), topic) {
            (true, Some(topic)) => Ok(SubscriptionRef::new(name.clone(), topic)),
            _ => Err(TransportError::NotFound(name.to_string())),
        }
    }

    fn create_subscription(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionRef, TransportError> {
        self.inner
            .calls
            .create_subscription
            .fetch_add(1, Ordering::SeqCst);
        self.round_trip();
        if let Some(err) = self.inner.faults.lock().create_failures.pop_front() {
            return Err(err);
        }
        let mut state = self.inner.state.lock();
        if state.subscriptions.contains_key(&spec.name) {
            return Err(TransportError::AlreadyExists(spec.name.to_string()));
        }
        let topic = state
            .topics
            .get_mut(&spec.topic.name)
            .ok_or_else(|| TransportError::NotFound(spec.topic.path.clone()))?;
        topic.subscriptions.push(spec.name.clone());
        state.subscriptions.insert(
            spec.name.clone(),
            Arc::new(SubscriptionQueue {
                name: spec.name.clone(),
                settings: spec.settings.clone(),
                state: Mutex::new(QueueState::default()),
            }),
        );
        Ok(SubscriptionRef::new(spec.name.clone(), spec.topic.clone()))
    }

    fn publish(
        &self,
        topic: &TopicRef,
        message: OutboundMessage,
    ) -> Result<PublishFuture, TransportError> {
        self.inner.calls.publish.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.inner.faults.lock().publish_failures.pop_front() {
            return Err(err);
        }
        let message_id = self.deliver(topic, message)?;
        Ok(PublishFuture::resolved(Ok(message_id)))
    }

    fn streaming_pull(
        &self,
        subscription: &SubscriptionRef,
        flow_control: &FlowControl,
        callback: DeliveryCallback,
    ) -> Result<Arc<dyn StreamingPull>, TransportError> {
        self.inner
            .calls
            .streaming_pull
            .fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.inner.faults.lock().open_failures.pop_front() {
            return Err(err);
        }
        let queue = self
            .inner
            .state
            .lock()
            .subscriptions
            .get(&subscription.name)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(subscription.path.clone()))?;

        let pull = Arc::new(InMemoryPull {
            done: Completion::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        });
        let done = pull.done.clone();
        let cancelled = Arc::clone(&pull.cancelled);
        let inner = Arc::clone(&self.inner);
        let flow = flow_control.clone();

        thread::Builder::new()
            .name(format!("pull-{}", queue.name.name))
            .spawn(move || loop {
                if cancelled.load(Ordering::SeqCst) || done.is_complete() {
                    break;
                }
                if Self::take_stream_failure(&inner, &queue.name.name) {
                    done.complete(Err(TransportError::Unavailable(format!(
                        "stream on {} reset",
                        queue.name
                    ))));
                    break;
                }
                let batch = queue.next_batch(&flow);
                if batch.is_empty() {
                    thread::sleep(IDLE_POLL);
                    continue;
                }
                for message in batch {
                    // Left un-acked on cancel; the lease brings it back.
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    callback(message);
                }
            })
            .map_err(|err| TransportError::Other(err.to_string()))?;

        Ok(pull)
    }
}
