//! Shared fixtures for the relay integration tests.

#![allow(dead_code)]

use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use pubsub_relay::{
    HandlerError, InMemoryTransport, MessageHandler, Payload, RelayConfig, StreamSupervisor,
    SupervisorConfig, TransportContext,
};
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once. Filter with `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Millisecond-scale supervision so failure tests finish quickly.
pub fn fast_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        stream_wait: Duration::from_millis(20),
        max_failures: 5,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(8),
    }
}

pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::new("test").with_supervisor(fast_supervisor());
    config.subscription.ack_deadline = Duration::from_millis(200);
    config
}

/// In-memory transport, context and supervisor. Closes the context on drop.
pub struct Harness {
    pub transport: InMemoryTransport,
    pub context: Arc<TransportContext>,
    pub supervisor: StreamSupervisor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: RelayConfig) -> Self {
        Self::with_transport(InMemoryTransport::new(), config)
    }

    pub fn with_transport(transport: InMemoryTransport, config: RelayConfig) -> Self {
        init_tracing();
        let context = TransportContext::open(Arc::new(transport.clone()), config);
        let supervisor = StreamSupervisor::new(Arc::clone(&context));
        Self {
            transport,
            context,
            supervisor,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.context.close();
    }
}

/// A handler that forwards every payload to a channel.
pub fn collector() -> (impl MessageHandler, Receiver<Payload>) {
    let (tx, rx) = channel();
    let tx = Mutex::new(tx);
    let handler = move |payload: Payload| -> Result<bool, HandlerError> {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(payload);
        }
        Ok(true)
    };
    (handler, rx)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
