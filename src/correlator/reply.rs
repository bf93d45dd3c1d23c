//! Inbound reply routing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use super::pending::{PendingTable, Reply};
use crate::config::ReplyMatching;
use crate::error::HandlerError;
use crate::payload::Payload;
use crate::pipeline::MessageHandler;

/// Bounded queue of replies that matched no pending request.
pub(crate) struct ReplyInbox {
    queue: Mutex<VecDeque<Payload>>,
    capacity: usize,
}

impl ReplyInbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, payload: Payload) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(payload);
    }

    /// Drop everything queued. Returns how many replies were discarded.
    pub(crate) fn purge(&self) -> usize {
        let mut queue = self.queue.lock();
        let purged = queue.len();
        queue.clear();
        purged
    }

    pub(crate) fn snapshot(&self) -> Vec<Payload> {
        self.queue.lock().iter().cloned().collect()
    }
}

pub(crate) struct RouterState {
    pub(crate) pending: PendingTable,
    pub(crate) inbox: ReplyInbox,
    pub(crate) matching: ReplyMatching,
}

/// Message handler that hands decoded replies to waiting requests.
///
/// Register it on the reply subscription, or let `Connector::listen` do it.
#[derive(Clone)]
pub struct ReplyRouter {
    state: Arc<RouterState>,
}

impl ReplyRouter {
    pub(crate) fn new(matching: ReplyMatching, inbox_capacity: usize) -> Self {
        Self {
            state: Arc::new(RouterState {
                pending: PendingTable::default(),
                inbox: ReplyInbox::new(inbox_capacity),
                matching,
            }),
        }
    }

    pub(crate) fn state(&self) -> &RouterState {
        &self.state
    }

    /// Route one reply. Returns the correlation id it resolved, if any.
    pub fn route(&self, payload: Payload) -> Option<String> {
        let reply = Reply {
            payload,
            received_at: Instant::now(),
        };
        let state = &self.state;

        if let Some(id) = reply.payload.correlation_id().map(str::to_owned) {
            if state.pending.resolve(&id, reply.clone()) {
                debug!(correlation_id = %id, "reply matched");
                return Some(id);
            }
        }
        if state.matching == ReplyMatching::NextAvailable {
            if let Some(id) = state.pending.resolve_oldest(reply.clone()) {
                debug!(correlation_id = %id, "reply handed to oldest request");
                return Some(id);
            }
        }

        debug!(
            correlation_id = reply.payload.correlation_id().unwrap_or("-"),
            "reply matched no pending request"
        );
        state.inbox.push(reply.payload);
        None
    }
}

impl MessageHandler for ReplyRouter {
    fn handle(&self, payload: Payload) -> Result<bool, HandlerError> {
        self.route(payload);
        Ok(true)
    }
}
