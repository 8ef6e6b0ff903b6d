//! Per-tunnel table of in-flight request identifiers.
//!
//! Each entry holds the sending half of a oneshot completion handle. The
//! forwarder inserts an entry before transmitting `http:request` and waits on
//! the receiving half with a deadline; the channel receiver loop resolves it
//! when the matching `http:response` / `http:error` arrives. Exactly one of
//! {response, error} is ever delivered — the oneshot enforces single-shot
//! resolution even when completion and timeout race.
//!
//! Removal is idempotent. A completion for an id that is no longer present
//! is dropped by the caller (late reply after timeout or cancellation).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::protocol::HttpResponsePayload;

/// Terminal outcome of one forwarded exchange.
#[derive(Debug)]
pub enum Completion {
    /// The agent answered with the local server's response.
    Response(HttpResponsePayload),
    /// The agent (or the gateway on teardown) reported a failure.
    Error { code: String, message: String },
}

/// In-flight request ids and their completion handles. One per tunnel.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<String, oneshot::Sender<Completion>>>,
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable").finish_non_exhaustive()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an entry and hand back the receiving half.
    ///
    /// The caller guarantees `request_id` is not already present (it owns
    /// the generate-test-retry loop against this table).
    pub fn insert(&self, request_id: &str) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(request_id.to_string(), tx);
        rx
    }

    /// Resolve an entry, removing it. Returns `false` when no entry exists
    /// (already resolved, timed out, or cancelled) — the completion is
    /// dropped in that case.
    pub fn complete(&self, request_id: &str, completion: Completion) -> bool {
        let Some(tx) = self.lock().remove(request_id) else {
            return false;
        };
        // The receiver may have been dropped in the same instant; either
        // way the entry is gone and resolution happened at most once.
        tx.send(completion).is_ok()
    }

    /// Remove an entry without resolving it. Idempotent.
    pub fn remove(&self, request_id: &str) -> bool {
        self.lock().remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drain every entry, resolving each with the given error. Used when the
    /// owning tunnel closes.
    pub fn fail_all(&self, code: &str, message: &str) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Completion::Error {
                code: code.to_string(),
                message: message.to_string(),
            });
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Completion>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
