//! Request/reply correlation for one editor connection.
//!
//! Each outstanding request owns a single-assignment `oneshot` slot. Whoever
//! removes the entry from the table (a matching reply, the timeout, or the
//! connection going away) is the only party allowed to fulfil it, so a
//! request resolves exactly once no matter how those events interleave.

use crate::error::BrokerError;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tracing::debug;
use vimlink_core::ReplyFrame;

pub type ReplySlot = oneshot::Receiver<Result<Value, BrokerError>>;

struct PendingRequest {
    method: &'static str,
    created_at: Instant,
    slot: oneshot::Sender<Result<Value, BrokerError>>,
}

#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic per-connection request id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn register(&self, method: &'static str) -> (u64, ReplySlot) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.table().insert(
            id,
            PendingRequest {
                method,
                created_at: Instant::now(),
                slot: tx,
            },
        );
        (id, rx)
    }

    /// Routes a reply to its request. Returns false when nothing was waiting
    /// for that id, e.g. the request already timed out.
    pub fn resolve(&self, reply: ReplyFrame) -> bool {
        let Some(pending) = self.take(reply.id) else {
            debug!(event = "broker_reply_discarded", request_id = reply.id);
            return false;
        };
        debug!(
            event = "broker_reply_matched",
            request_id = reply.id,
            method = pending.method,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64
        );
        let outcome = reply
            .into_result()
            .map_err(|fault| BrokerError::RemoteError(fault.message));
        let _ = pending.slot.send(outcome);
        true
    }

    /// Gives up on a request. Returns false if it was already resolved.
    pub fn abandon(&self, id: u64) -> bool {
        self.take(id).is_some()
    }

    /// Fails every outstanding request, used when the connection goes away.
    pub fn fail_all(&self, error: BrokerError) -> usize {
        let drained = self.table().drain().collect::<Vec<_>>();
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.slot.send(Err(error.clone()));
        }
        count
    }

    /// Abandons `id` when dropped unless disarmed. Covers callers whose
    /// future is cancelled while the request is still outstanding.
    pub fn guard(&self, id: u64) -> PendingGuard<'_> {
        PendingGuard {
            pending: self,
            id,
            armed: true,
        }
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Suspends until the request identified by `id` resolves or `timeout`
    /// elapses.
    pub async fn wait(
        &self,
        id: u64,
        mut slot: ReplySlot,
        method: &'static str,
        timeout: Duration,
    ) -> Result<Value, BrokerError> {
        let _guard = self.guard(id);
        tokio::select! {
            outcome = &mut slot => flatten(outcome),
            _ = tokio::time::sleep(timeout) => {
                if self.abandon(id) {
                    debug!(event = "broker_request_timeout", request_id = id, method);
                    Err(BrokerError::Timeout {
                        method,
                        waited_ms: timeout.as_millis() as u64,
                    })
                } else {
                    // lost the race: the slot has already been filled
                    flatten(slot.await)
                }
            }
        }
    }

    fn take(&self, id: u64) -> Option<PendingRequest> {
        self.table().remove(&id)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.abandon(self.id) {
            debug!(event = "broker_request_cancelled", request_id = self.id);
        }
    }
}

fn flatten(
    outcome: Result<Result<Value, BrokerError>, oneshot::error::RecvError>,
) -> Result<Value, BrokerError> {
    outcome.unwrap_or_else(|_| Err(BrokerError::SocketError("request dropped".to_string())))
}
