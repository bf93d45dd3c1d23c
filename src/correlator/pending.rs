//! In-flight requests keyed by correlation id.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;

use crate::bus::Completion;
use crate::error::CorrelatorError;
use crate::payload::Payload;

/// A decoded reply, stamped when the router saw it.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub(crate) payload: Payload,
    pub(crate) received_at: Instant,
}

/// Checkpoints recorded while a request is in flight.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timings {
    pub(crate) started: Instant,
    /// Wall-clock time matching `started`.
    pub(crate) started_at: SystemTime,
    pub(crate) send_started: Option<Instant>,
    pub(crate) send_completed: Option<Instant>,
}

struct PendingEntry {
    slot: Completion<Reply>,
    timings: Timings,
    seq: u64,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, PendingEntry>,
    next_seq: u64,
}

/// Correlation id -> private result slot and timings.
///
/// Written from the requesting thread and from the reply router; every
/// update is a keyed insert or modify under one lock.
#[derive(Default)]
pub(crate) struct PendingTable {
    table: Mutex<Table>,
}

impl PendingTable {
    pub(crate) fn register(
        &self,
        correlation_id: &str,
        started: Instant,
    ) -> Result<Completion<Reply>, CorrelatorError> {
        let mut table = self.table.lock();
        if table.entries.contains_key(correlation_id) {
            return Err(CorrelatorError::DuplicateCorrelationId(
                correlation_id.to_string(),
            ));
        }
        table.next_seq += 1;
        let seq = table.next_seq;
        let slot = Completion::new();
        table.entries.insert(
            correlation_id.to_string(),
            PendingEntry {
                slot: slot.clone(),
                timings: Timings {
                    started,
                    started_at: SystemTime::now(),
                    send_started: None,
                    send_completed: None,
                },
                seq,
            },
        );
        Ok(slot)
    }

    pub(crate) fn mark_send_started(&self, correlation_id: &str) {
        if let Some(entry) = self.table.lock().entries.get_mut(correlation_id) {
            entry.timings.send_started = Some(Instant::now());
        }
    }

    pub(crate) fn mark_sent(&self, correlation_id: &str) {
        if let Some(entry) = self.table.lock().entries.get_mut(correlation_id) {
            entry.timings.send_completed = Some(Instant::now());
        }
    }

    /// Fill the slot for `correlation_id`. `false` if nothing is waiting on it.
    pub(crate) fn resolve(&self, correlation_id: &str, reply: Reply) -> bool {
        let slot = match self.table.lock().entries.get(correlation_id) {
            Some(entry) => entry.slot.clone(),
            None => return false,
        };
        slot.complete(reply)
    }

    /// Fill the slot of the oldest request still waiting. Returns its id.
    pub(crate) fn resolve_oldest(&self, reply: Reply) -> Option<String> {
        let (id, slot) = {
            let table = self.table.lock();
            table
                .entries
                .iter()
                .filter(|(_, entry)| !entry.slot.is_complete())
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, entry)| (id.clone(), entry.slot.clone()))?
        };
        slot.complete(reply).then_some(id)
    }

    /// Remove a request, returning its timings if it was still registered.
    pub(crate) fn finish(&self, correlation_id: &str) -> Option<Timings> {
        self.table
            .lock()
            .entries
            .remove(correlation_id)
            .map(|entry| entry.timings)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Finish `correlation_id` when the returned guard is dropped.
    pub(crate) fn guard<'a>(&'a self, correlation_id: &'a str) -> PendingGuard<'a> {
        PendingGuard {
            table: self,
            correlation_id,
        }
    }
}

/// Releases a pending entry on drop, including when its caller is abandoned.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.finish(self.correlation_id);
    }
}
