//! Request correlator: matches responses to outstanding calls.
//!
//! Each call registers a [`PendingCall`] under a fresh id. The entry is
//! removed exactly once: by [`Correlator::take`] when the response arrives, or
//! by the guard's `Drop` when the caller stops waiting (timeout, error, or the
//! future being dropped). A response that finds no entry is discarded.

use crate::mirror::Mirrored;
use crate::registry::base36;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use tether_types::{CallError, CallResult};
use tokio::sync::oneshot;
use tracing::debug;

/// Bookkeeping for one outstanding call.
pub(crate) struct PendingEntry {
    pub(crate) name: String,
    tx: oneshot::Sender<CallResult<Mirrored>>,
}

impl PendingEntry {
    /// Deliver the outcome. The caller may already have stopped listening.
    pub(crate) fn settle(self, outcome: CallResult<Mirrored>) {
        let _ = self.tx.send(outcome);
    }
}

/// Table of outstanding calls for one endpoint.
pub struct Correlator {
    pending: DashMap<String, PendingEntry>,
    rng: Mutex<StdRng>,
}

/// Caller-side handle of a registered call. Dropping it removes the entry.
pub(crate) struct PendingCall<'a> {
    pub(crate) id: String,
    pub(crate) rx: oneshot::Receiver<CallResult<Mirrored>>,
    table: &'a Correlator,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.table.pending.remove(&self.id).is_some() {
            debug!(call_id = %self.id, "Pending call abandoned");
        }
    }
}

impl Correlator {
    /// An empty table with a freshly seeded id generator.
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Register a new call for handler `name` under an id not currently in use.
    pub(crate) fn register(&self, name: &str) -> PendingCall<'_> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            name: name.to_string(),
            tx,
        };
        loop {
            let id = self.random_id();
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.pending.entry(id.clone()) {
                slot.insert(entry);
                return PendingCall {
                    id,
                    rx,
                    table: self,
                };
            }
        }
    }

    /// Remove and return the entry for `id`, if it is still outstanding.
    pub(crate) fn take(&self, id: &str) -> Option<PendingEntry> {
        self.pending.remove(id).map(|(_, entry)| entry)
    }

    /// Settle every outstanding call with `error`.
    pub fn reject_all(&self, error: CallError) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some(entry) = self.take(&id) {
                entry.settle(Err(error.clone()));
                rejected += 1;
            }
        }
        rejected
    }

    /// Whether call `id` is still waiting.
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn random_id(&self) -> String {
        let n: u64 = self.rng.lock().unwrap_or_else(|e| e.into_inner()).gen();
        base36(n)
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
