//! Single-shot completion slots.
//!
//! A `Completion<T>` is resolved once and can be waited on from any number of
//! threads, or observed through callbacks. Transports use it for publish
//! confirmations and for the end of a pull stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::TransportError;

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

struct State<T> {
    value: Option<T>,
    callbacks: Vec<Callback<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// A value that becomes available exactly once.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    value: None,
                    callbacks: Vec::new(),
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// A slot that is already resolved.
    pub fn ready(value: T) -> Self {
        let completion = Self::new();
        completion.complete(value);
        completion
    }

    /// Resolve the slot. Returns `false` if it was already resolved.
    ///
    /// Callbacks run on the completing thread, after the lock is released.
    pub fn complete(&self, value: T) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.inner.ready.notify_all();
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().value.is_some()
    }

    pub fn try_get(&self) -> Option<T> {
        self.inner.state.lock().value.clone()
    }

    /// Block until resolved or until `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.value.is_none() {
            if self.inner.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.value.clone()
    }

    /// Run `callback` once the slot resolves, immediately if it already has.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let value = {
            let mut state = self.inner.state.lock();
            match &state.value {
                Some(value) => value.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&value);
    }
}

/// Outcome of a publish: the transport-assigned message id, or why it failed.
pub type PublishOutcome = Result<String, TransportError>;

/// Handle to a submitted publish whose persistence is confirmed later.
#[derive(Clone, Default)]
pub struct PublishFuture {
    completion: Completion<PublishOutcome>,
}

impl std::fmt::Debug for PublishFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishFuture").finish_non_exhaustive()
    }
}

impl PublishFuture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved(outcome: PublishOutcome) -> Self {
        Self {
            completion: Completion::ready(outcome),
        }
    }

    /// Called by the transport once the publish is persisted or has failed.
    pub fn resolve(&self, outcome: PublishOutcome) -> bool {
        self.completion.complete(outcome)
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_complete()
    }

    /// Wait up to `timeout` for the outcome. `None` means still pending.
    pub fn result(&self, timeout: Duration) -> Option<PublishOutcome> {
        self.completion.wait(timeout)
    }

    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&PublishOutcome) + Send + 'static,
    {
        self.completion.on_complete(callback);
    }
}
