//! Pending-call table.
//!
//! Every call expecting a reply is registered here under its message id
//! before it is sent. Exactly one of three things settles it: the reply
//! (or a transport failure) arrives, the deadline passes, or the table is
//! shut down. Whichever takes the entry out of the map first decides the
//! outcome; the loser finds the entry gone.

use meshact_common::protocol::error::{MeshError, Result};
use meshact_common::transport::ReplySink;
use meshact_common::{Envelope, MessageId, Meta, Pattern, TxId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

type Outcome = Result<Envelope>;

struct PendingCall {
    tx: TxId,
    pattern: Pattern,
    completion: oneshot::Sender<Outcome>,
}

/// Outstanding calls of one client, keyed by message id.
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<MessageId, PendingCall>>,
    closed: AtomicBool,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call and starts its deadline.
    ///
    /// # Errors
    ///
    /// [`MeshError::Closed`] after [`PendingCalls::fail_all`], and
    /// [`MeshError::Config`] when the id is already pending.
    pub fn register(
        self: &Arc<Self>,
        meta: &Meta,
        pattern: &Pattern,
        timeout: Duration,
    ) -> Result<PendingHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Closed);
        }
        let (completion, receiver) = oneshot::channel();
        {
            let mut calls = self.calls.lock();
            if calls.contains_key(&meta.id) {
                return Err(MeshError::Config(format!(
                    "message id {} is already pending",
                    meta.id
                )));
            }
            calls.insert(
                meta.id.clone(),
                PendingCall {
                    tx: meta.tx.clone(),
                    pattern: pattern.clone(),
                    completion,
                },
            );
        }

        Ok(PendingHandle {
            table: self.clone(),
            id: meta.id.clone(),
            tx: meta.tx.clone(),
            pattern: pattern.clone(),
            timeout,
            deadline: Instant::now() + timeout,
            receiver,
        })
    }

    /// Settles the call answered by `reply`.
    ///
    /// Returns false, and drops the reply, when no call with that id is
    /// pending: it timed out already or was never sent from here.
    pub fn complete(&self, reply: Envelope) -> bool {
        let id = reply.meta.id.clone();
        self.settle(&id, Ok(reply))
    }

    /// Settles the call `id` with an error.
    pub fn fail(&self, id: &str, error: MeshError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: &str, outcome: Outcome) -> bool {
        let entry = self.calls.lock().remove(id);
        match entry {
            Some(call) => {
                // the waiter may have gone away; nothing left to tell it
                let _ = call.completion.send(outcome);
                true
            }
            None => {
                debug!(id, "discarding reply with no pending call");
                false
            }
        }
    }

    /// Fails every pending call with [`MeshError::Closed`] and refuses new
    /// registrations.
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let calls: Vec<_> = self.calls.lock().drain().collect();
        for (id, call) in calls {
            debug!(%id, tx = %call.tx, pattern = %call.pattern, "failing pending call on close");
            let _ = call.completion.send(Err(MeshError::Closed));
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(&self, id: &str) -> bool {
        self.calls.lock().remove(id).is_some()
    }
}

impl ReplySink for PendingCalls {
    fn deliver(&self, reply: Envelope) -> bool {
        self.complete(reply)
    }

    fn fail(&self, id: &str, error: MeshError) -> bool {
        PendingCalls::fail(self, id, error)
    }

    fn is_waiting(&self, id: &str) -> bool {
        self.calls.lock().contains_key(id)
    }
}

/// The caller's side of one pending call.
///
/// Dropping the handle without waiting unregisters the call.
pub struct PendingHandle {
    table: Arc<PendingCalls>,
    id: MessageId,
    tx: TxId,
    pattern: Pattern,
    timeout: Duration,
    deadline: Instant,
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingHandle {
    /// Waits for the reply until the deadline.
    ///
    /// # Errors
    ///
    /// [`MeshError::Timeout`] when the deadline passes first, otherwise
    /// whatever error the call was settled with.
    pub async fn wait(mut self) -> Result<Envelope> {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MeshError::Closed),
            Err(_) => {
                if self.table.expire(&self.id) {
                    warn!(
                        id = %self.id,
                        tx = %self.tx,
                        pattern = %self.pattern,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "call timed out"
                    );
                    Err(MeshError::Timeout {
                        pattern: self.pattern.to_string(),
                        tx: self.tx.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    })
                } else {
                    // settled between the deadline and our lock
                    self.receiver.try_recv().unwrap_or(Err(MeshError::Closed))
                }
            }
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.table.expire(&self.id);
    }
}
