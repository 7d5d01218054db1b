//! Pending-call table.
//!
//! Owned exclusively by the connection actor, so it needs no locking.
//! Ids are integers allocated from a counter that skips any id still in
//! flight; an id is reusable only after its call resolved, was cancelled,
//! or was swept.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::wire::message::RequestId;
use crate::{AppError, Result};

/// Bookkeeping for one in-flight request.
#[derive(Debug)]
pub struct PendingCall {
    /// Method, kept for diagnostics.
    pub method: String,
    /// When the sweep fails this call.
    pub deadline: Instant,
    reply: oneshot::Sender<Result<Value>>,
}

impl PendingCall {
    fn complete(self, outcome: Result<Value>) {
        // The caller may have stopped waiting; that is not an error.
        let _ = self.reply.send(outcome);
    }
}

/// In-flight requests keyed by id.
#[derive(Debug)]
pub struct PendingTable {
    next_id: i64,
    calls: HashMap<RequestId, PendingCall>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    /// Empty table; the first id is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            calls: HashMap::new(),
        }
    }

    /// Allocate a fresh id and record a call expiring at `deadline`.
    pub fn register(
        &mut self,
        method: &str,
        deadline: Instant,
    ) -> (RequestId, oneshot::Receiver<Result<Value>>) {
        let id = self.allocate_id();
        let (reply, rx) = oneshot::channel();
        self.calls.insert(
            id.clone(),
            PendingCall {
                method: method.to_owned(),
                deadline,
                reply,
            },
        );
        (id, rx)
    }

    /// Resolve the call with `id`. Returns `false` for an unknown id.
    pub fn resolve(&mut self, id: &RequestId, outcome: Result<Value>) -> bool {
        match self.calls.remove(id) {
            Some(call) => {
                call.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove a call without completing it; the waiter sees `Cancelled`.
    pub fn cancel(&mut self, id: &RequestId) -> Option<String> {
        self.calls.remove(id).map(|call| {
            let method = call.method.clone();
            call.complete(Err(AppError::Cancelled(format!("request {id} cancelled"))));
            method
        })
    }

    /// Fail every call whose deadline is at or before `now`.
    ///
    /// Returns the ids that were swept.
    pub fn sweep(&mut self, now: Instant) -> Vec<RequestId> {
        let expired: Vec<RequestId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(call) = self.calls.remove(id) {
                let msg = format!("request {id} ({}) got no response before its deadline", call.method);
                call.complete(Err(AppError::Timeout(msg)));
            }
        }
        expired
    }

    /// Fail every call with `err` and empty the table.
    pub fn fail_all(&mut self, err: &AppError) -> usize {
        let count = self.calls.len();
        for (_, call) in self.calls.drain() {
            call.complete(Err(err.clone()));
        }
        count
    }

    /// Whether `id` is in flight.
    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.calls.contains_key(id)
    }

    /// Calls in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// `true` when nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn allocate_id(&mut self) -> RequestId {
        loop {
            let candidate = RequestId::Int(self.next_id);
            self.next_id = match self.next_id.checked_add(1) {
                Some(next) => next,
                None => 1,
            };
            if !self.calls.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}
