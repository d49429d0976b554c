//! Request correlator: one pending completion per outbound request id.
//!
//! The sender half of a oneshot is moved out of the table on resolution, so
//! resolving twice is structurally impossible. Late or duplicate responses
//! find no entry and are dropped by the caller with a log line.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::GatewayError;

type Completion = oneshot::Sender<Result<Value, GatewayError>>;

#[derive(Default)]
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, Completion>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and park a completion handle for it.
    ///
    /// Ids are monotonic for the life of the process; wraparound of a u64
    /// counter is not reachable before process death.
    pub fn register(&self) -> (String, oneshot::Receiver<Result<Value, GatewayError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);
        (id, rx)
    }

    /// Allocate a fresh id with no parked completion. Used for requests
    /// whose responses the engine intercepts itself instead of routing
    /// through the table.
    pub fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Resolve a pending request. Returns false when `id` has no pending
    /// entry (duplicate response, or a caller that already timed out).
    pub fn resolve(&self, id: &str, result: Result<Value, GatewayError>) -> bool {
        let completion = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match completion {
            Some(tx) => {
                // A dropped receiver just means the caller gave up first.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the pending entry for `id` without resolving it. Used by callers
    /// cleaning up after their own timeout.
    pub fn forget(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Fail every still-pending request. Called on transport close.
    pub fn fail_all(&self, err: GatewayError) {
        let drained: Vec<(String, Completion)> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
