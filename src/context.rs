//! Transport context: resource caches, provisioning and the stream registry.
//!
//! One `TransportContext` owns everything that used to be process-wide:
//! - the topic and subscription caches
//! - the registry of active streams, one per `StreamKey`
//!
//! Every mutation happens under a single reentrant lock, so
//! `ensure_subscription` can call `ensure_topic` while holding it.
//! Cache reads skip the lock and only touch the cache's own `RwLock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, info};

use crate::bus::{
    ResourceName, StreamingPull, SubscriptionRef, SubscriptionSpec, TopicRef, Transport,
};
use crate::config::RelayConfig;
use crate::error::{SetupError, TransportError};
use crate::supervisor::{ActiveStream, StreamHandle, StreamKey};

/// Shared transport state with an explicit `open` / `close` lifecycle.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use pubsub_relay::{InMemoryTransport, RelayConfig, TransportContext};
///
/// let transport = InMemoryTransport::new();
/// let context = TransportContext::open(Arc::new(transport.clone()), RelayConfig::new("test"));
///
/// let sub = context.ensure_subscription("orders", "orders_subscription").unwrap();
/// assert_eq!(sub.topic.name.name, "orders");
///
/// // Cached: no further round trips.
/// context.ensure_topic("orders").unwrap();
/// assert_eq!(transport.create_topic_calls(), 1);
///
/// context.close();
/// assert!(context.ensure_topic("orders").is_err());
/// ```
pub struct TransportContext {
    transport: Arc<dyn Transport>,
    config: RelayConfig,
    lock: ReentrantMutex<()>,
    topics: RwLock<HashMap<ResourceName, TopicRef>>,
    subscriptions: RwLock<HashMap<ResourceName, SubscriptionRef>>,
    streams: Mutex<HashMap<StreamKey, ActiveStream>>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl TransportContext {
    pub fn open(transport: Arc<dyn Transport>, config: RelayConfig) -> Arc<Self> {
        info!(namespace = %config.namespace, "opening transport context");
        Arc::new(Self {
            transport,
            config,
            lock: ReentrantMutex::new(()),
            topics: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make sure `name` exists and return its reference.
    ///
    /// Concurrent callers for the same name trigger at most one create call.
    pub fn ensure_topic(&self, name: &str) -> Result<TopicRef, SetupError> {
        self.check_open()?;
        let key = ResourceName::new(self.namespace(), name);
        if let Some(topic) = self.topics.read().get(&key) {
            return Ok(topic.clone());
        }

        let _guard = self.lock.lock();
        if let Some(topic) = self.topics.read().get(&key) {
            return Ok(topic.clone());
        }
        let topic = self.fetch_or_create_topic(&key)?;
        self.topics.write().insert(key, topic.clone());
        Ok(topic)
    }

    /// Make sure `subscription` exists, bound to `topic` (created first if needed).
    pub fn ensure_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<SubscriptionRef, SetupError> {
        self.check_open()?;
        let key = ResourceName::new(self.namespace(), subscription);
        if let Some(sub) = self.subscriptions.read().get(&key) {
            return Ok(sub.clone());
        }

        let _guard = self.lock.lock();
        if let Some(sub) = self.subscriptions.read().get(&key) {
            return Ok(sub.clone());
        }
        let topic = self.ensure_topic(topic)?;
        let sub = self.fetch_or_create_subscription(&key, topic)?;
        self.subscriptions.write().insert(key, sub.clone());
        Ok(sub)
    }

    /// Stop every registered stream and refuse further provisioning.
    ///
    /// Blocks until the supervising threads have exited.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<(StreamKey, ActiveStream)> = {
            let _guard = self.lock.lock();
            self.streams.lock().drain().collect()
        };
        info!(
            namespace = %self.config.namespace,
            streams = drained.len(),
            "closing transport context"
        );
        for (key, stream) in drained {
            debug!(stream = %key, "stopping stream on close");
            stream.shutdown();
        }
    }

    fn check_open(&self) -> Result<(), SetupError> {
        if self.is_closed() {
            Err(SetupError::ContextClosed)
        } else {
            Ok(())
        }
    }

    fn fetch_or_create_topic(&self, key: &ResourceName) -> Result<TopicRef, SetupError> {
        let setup_error = |source| SetupError::Topic {
            name: key.to_string(),
            source,
        };
        match self.transport.get_topic(key) {
            Ok(topic) => Ok(topic),
            Err(TransportError::NotFound(_)) => match self.transport.create_topic(key) {
                Ok(topic) => {
                    info!(topic = %key, "created topic");
                    Ok(topic)
                }
                Err(TransportError::AlreadyExists(_)) => {
                    debug!(topic = %key, "topic created concurrently");
                    Ok(TopicRef::new(key.clone()))
                }
                Err(source) => Err(setup_error(source)),
            },
            Err(source) => Err(setup_error(source)),
        }
    }

    fn fetch_or_create_subscription(
        &self,
        key: &ResourceName,
        topic: TopicRef,
    ) -> Result<SubscriptionRef, SetupError> {
        let setup_error = |source| SetupError::Subscription {
            name: key.to_string(),
            source,
        };
        match self.transport.get_subscription(key) {
            Ok(sub) => Ok(sub),
            Err(TransportError::NotFound(_)) => {
                let spec = SubscriptionSpec {
                    name: key.clone(),
                    topic: topic.clone(),
                    settings: self.config.subscription.clone(),
                };
                match self.transport.create_subscription(&spec) {
                    Ok(sub) => {
                        info!(subscription = %key, topic = %topic.name, "created subscription");
                        Ok(sub)
                    }
                    Err(TransportError::AlreadyExists(_)) => {
                        debug!(subscription = %key, "subscription created concurrently");
                        Ok(SubscriptionRef::new(key.clone(), topic))
                    }
                    Err(source) => Err(setup_error(source)),
                }
            }
            Err(source) => Err(setup_error(source)),
        }
    }
}

/// Stream registry, used by the supervisor.
impl TransportContext {
    /// Run `f` while holding the context lock.
    pub(crate) fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn active_stream(&self, key: &StreamKey) -> Option<StreamHandle> {
        self.streams.lock().get(key).map(|s| s.handle.clone())
    }

    pub(crate) fn active_stream_keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self.streams.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn register_stream(
        &self,
        key: StreamKey,
        stream: ActiveStream,
    ) -> Result<(), SetupError> {
        let _guard = self.lock.lock();
        self.check_open()?;
        self.streams.lock().insert(key, stream);
        Ok(())
    }

    /// Hand the supervising thread's join handle to its registry entry.
    pub(crate) fn attach_thread(&self, key: &StreamKey, generation: u64, thread: JoinHandle<()>) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(key).filter(|s| s.generation == generation) {
            stream.thread = Some(thread);
        }
    }

    pub(crate) fn is_current_stream(&self, key: &StreamKey, generation: u64) -> bool {
        self.streams
            .lock()
            .get(key)
            .map_or(false, |s| s.generation == generation)
    }

    /// Swap in a freshly opened pull. `false` if the stream was stopped meanwhile.
    pub(crate) fn replace_stream_pull(
        &self,
        key: &StreamKey,
        generation: u64,
        pull: Arc<dyn StreamingPull>,
    ) -> bool {
        let mut streams = self.streams.lock();
        match streams.get_mut(key).filter(|s| s.generation == generation) {
            Some(stream) => {
                stream.pull = pull;
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_stream(&self, key: &StreamKey) -> Option<ActiveStream> {
        let _guard = self.lock.lock();
        self.streams.lock().remove(key)
    }

    pub(crate) fn remove_stream_if_current(
        &self,
        key: &StreamKey,
        generation: u64,
    ) -> Option<ActiveStream> {
        let _guard = self.lock.lock();
        let mut streams = self.streams.lock();
        if streams.get(key).map_or(false, |s| s.generation == generation) {
            streams.remove(key)
        } else {
            None
        }
    }
}
