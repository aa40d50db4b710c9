use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::warn;

use crate::error::{ChannelError, Result};
use crate::method::Method;

/// Outcome delivered to a waiting caller.
pub type Completion = Result<Option<Value>>;

/// An in-flight request awaiting exactly one completion.
///
/// Only the party that removed the entry from the [`PendingTable`] holds it,
/// and completing consumes it, so a request can never complete twice.
#[derive(Debug)]
pub struct PendingRequest {
    id: u32,
    method: Method,
    slot: Sender<Completion>,
}

impl PendingRequest {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Resolve with the response data.
    pub fn resolve(self, data: Option<Value>) {
        self.complete(Ok(data));
    }

    /// Reject with a request-scoped error.
    pub fn reject(self, err: ChannelError) {
        self.complete(Err(err));
    }

    /// Fail because the channel is going away.
    pub fn cancel(self) {
        self.complete(Err(ChannelError::ChannelClosed));
    }

    fn complete(self, completion: Completion) {
        // The caller may already have given up; nothing to do then.
        let _ = self.slot.send(completion);
    }
}

/// Concurrent table of in-flight requests keyed by request id.
#[derive(Debug, Clone, Default)]
pub struct PendingTable {
    entries: Arc<DashMap<u32, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return the caller's side of its completion slot.
    ///
    /// Fails with `DuplicateRequestId` if `id` is still in flight; the
    /// outstanding request is left untouched.
    pub fn insert(&self, id: u32, method: Method) -> Result<Waiter> {
        let (slot, rx) = mpsc::channel();
        match self.entries.entry(id) {
            Entry::Occupied(occupied) => {
                // Only reachable once the id counter has wrapped onto a
                // request that is still outstanding.
                warn!(
                    id,
                    pending = %occupied.get().method,
                    %method,
                    "request id still in flight"
                );
                return Err(ChannelError::DuplicateRequestId { method, id });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingRequest { id, method, slot });
            }
        }
        Ok(Waiter {
            id,
            method,
            rx,
            table: self.clone(),
        })
    }

    /// Remove an entry; the remover becomes responsible for completing it.
    pub fn remove(&self, id: u32) -> Option<PendingRequest> {
        self.entries.remove(&id).map(|(_, pending)| pending)
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<PendingRequest> {
        let ids: Vec<u32> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The caller's side of a pending request.
#[derive(Debug)]
pub struct Waiter {
    id: u32,
    method: Method,
    rx: Receiver<Completion>,
    table: PendingTable,
}

impl Waiter {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Block until the request completes or `timeout` elapses.
    ///
    /// On timeout the entry is withdrawn from the table. If a response won the
    /// race and already withdrew it, that response is returned instead.
    pub fn wait(self, timeout: Duration) -> Completion {
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => completion,
            Err(RecvTimeoutError::Timeout) => {
                if self.table.remove(self.id).is_some() {
                    Err(ChannelError::RequestTimeout {
                        method: self.method,
                        id: self.id,
                        timeout,
                    })
                } else {
                    self.rx.recv().unwrap_or(Err(ChannelError::ChannelClosed))
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::ChannelClosed),
        }
    }

    /// Withdraw the request without waiting. Used when it never reached the wire.
    pub fn abandon(self) -> bool {
        self.table.remove(self.id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolve_reaches_waiter() {
        let table = PendingTable::new();
        let waiter = table.insert(1, Method::WorkerDump).unwrap();
        assert_eq!(table.len(), 1);

        table.remove(1).unwrap().resolve(Some(json!({ "ok": true })));
        let data = waiter.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(data, Some(json!({ "ok": true })));
        assert!(table.is_empty());
    }

    #[test]
    fn timeout_withdraws_entry() {
        let table = PendingTable::new();
        let waiter = table.insert(9, Method::RouterDump).unwrap();

        let err = waiter.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::RequestTimeout {
                method: Method::RouterDump,
                id: 9,
                ..
            }
        ));
        assert!(table.remove(9).is_none());
    }

    #[test]
    fn completion_after_removal_wins_over_timeout() {
        let table = PendingTable::new();
        let waiter = table.insert(2, Method::WorkerDump).unwrap();

        // Removed by the response path but not yet completed when the deadline
        // passes: the waiter must still get the response.
        let pending = table.remove(2).unwrap();
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            pending.resolve(Some(json!(1)));
        });

        let data = waiter.wait(Duration::from_millis(5)).unwrap();
        assert_eq!(data, Some(json!(1)));
        completer.join().unwrap();
    }

    #[test]
    fn drain_cancels_everything() {
        let table = PendingTable::new();
        let waiters: Vec<_> = (1..=3)
            .map(|id| table.insert(id, Method::WorkerDump).unwrap())
            .collect();

        for pending in table.drain() {
            pending.cancel();
        }
        assert!(table.is_empty());
        for waiter in waiters {
            assert!(waiter.wait(Duration::from_secs(1)).unwrap_err().is_closed());
        }
    }

    #[test]
    fn dropped_entry_reports_closed() {
        let table = PendingTable::new();
        let waiter = table.insert(5, Method::WorkerDump).unwrap();
        drop(table.remove(5));
        assert!(waiter.wait(Duration::from_secs(1)).unwrap_err().is_closed());
    }

    #[test]
    fn reused_id_is_refused_and_leaves_first_request_alone() {
        let table = PendingTable::new();
        let first = table.insert(7, Method::WorkerDump).unwrap();

        let err = table.insert(7, Method::RouterDump).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::DuplicateRequestId {
                method: Method::RouterDump,
                id: 7
            }
        ));
        assert!(!err.is_closed());
        assert_eq!(table.len(), 1);

        table.remove(7).unwrap().resolve(Some(json!("first")));
        assert_eq!(first.wait(Duration::from_secs(1)).unwrap(), Some(json!("first")));
    }
}
