//! Table of requests awaiting a response from the worker.
//!
//! Each entry owns a oneshot completion handle. An entry leaves the table
//! exactly once: resolved by a matching response, removed on timeout or
//! write failure, or dropped when the channel closes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// A request waiting for its response.
#[derive(Debug)]
struct PendingEntry {
    responder: oneshot::Sender<Value>,
    created_at: Instant,
}

/// Returned by [`PendingTable::register`] when the id is already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateId(pub u64);

/// Id-keyed table of outstanding requests.
///
/// The lock is only held for map operations, never across an `.await`.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<u64, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingEntry>> {
        // Entries are inserted and removed whole, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new request and return the receiving half of its handle.
    pub fn register(&self, id: u64) -> Result<oneshot::Receiver<Value>, DuplicateId> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(DuplicateId(id));
        }

        let (responder, receiver) = oneshot::channel();
        entries.insert(
            id,
            PendingEntry {
                responder,
                created_at: Instant::now(),
            },
        );
        Ok(receiver)
    }

    /// Deliver a response to the request registered under `id`.
    ///
    /// Returns `false` when no such request is pending (already expired,
    /// duplicate response, or never sent); that case is not an error.
    pub fn resolve(&self, id: u64, message: Value) -> bool {
        let entry = self.lock().remove(&id);
        match entry {
            Some(entry) => {
                debug!(
                    "Resolved request {} after {:?}",
                    id,
                    entry.created_at.elapsed()
                );
                // The caller may have given up between removal and send.
                let _ = entry.responder.send(message);
                true
            }
            None => {
                debug!("Discarding response for unknown request id {}", id);
                false
            }
        }
    }

    /// Remove a request without resolving it.
    ///
    /// Returns the time the entry had been pending, or `None` if it was no
    /// longer in the table.
    pub fn remove(&self, id: u64) -> Option<Duration> {
        self.lock()
            .remove(&id)
            .map(|entry| entry.created_at.elapsed())
    }

    /// Drop every pending handle, failing all waiting callers.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }
}
