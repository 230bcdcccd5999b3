//! Pending-request bookkeeping
//!
//! A [`CorrelationTable`] maps in-flight correlation ids to single-assignment
//! response slots. Every mutating operation is one atomic table operation:
//! the first of `complete`, `cancel` or `remove` to take an id out of the
//! table decides how the waiting caller is resolved, and every later attempt
//! on that id is a no-op returning `false`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::protocol::{CorrelationId, ToolResult};

/// Why a pending request was resolved without a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's deadline elapsed
    Timeout(Duration),
    /// The caller cancelled
    Cancelled,
    /// The connection carrying the request dropped
    ConnectionLost,
    /// The entry was removed without being resolved
    Abandoned,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout(d) => write!(f, "timed out after {d:?}"),
            CancelReason::Cancelled => write!(f, "cancelled"),
            CancelReason::ConnectionLost => write!(f, "connection lost"),
            CancelReason::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Bookkeeping failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("Correlation id {0} is already pending")]
    DuplicateId(CorrelationId),
}

type Outcome = Result<ToolResult, CancelReason>;

struct PendingRequest {
    slot: oneshot::Sender<Outcome>,
    registered_at: Instant,
}

/// Awaitable side of a pending request, handed to exactly one caller
#[derive(Debug)]
pub struct ResponseHandle {
    id: CorrelationId,
    rx: oneshot::Receiver<Outcome>,
}

impl ResponseHandle {
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Future for ResponseHandle {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the entry was removed without completion
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(CancelReason::Abandoned)))
    }
}

/// Concurrent map from correlation id to pending response slot
pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a fresh id. Never returns the same value twice.
    pub fn next_id(&self) -> CorrelationId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create the response slot for `id`
    pub fn register(&self, id: CorrelationId) -> Result<ResponseHandle, CorrelationError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(CorrelationError::DuplicateId(id));
        }
        pending.insert(
            id,
            PendingRequest {
                slot: tx,
                registered_at: Instant::now(),
            },
        );
        trace!("Registered correlation id {} ({} pending)", id, pending.len());
        Ok(ResponseHandle { id, rx })
    }

    /// Take `id` out of the table. The removal is the single point of truth.
    fn take(&self, id: CorrelationId) -> Option<PendingRequest> {
        self.lock().remove(&id)
    }

    /// Resolve `id` with a response. Returns false if the id is not pending
    /// (already timed out, cancelled or never issued).
    pub fn complete(&self, id: CorrelationId, response: ToolResult) -> bool {
        match self.take(id) {
            Some(entry) => {
                trace!(
                    "Completing correlation id {} after {:?}",
                    id,
                    entry.registered_at.elapsed()
                );
                // The receiver may be gone if the caller's future was dropped
                let _ = entry.slot.send(Ok(response));
                true
            }
            None => {
                debug!("No pending request for correlation id {}, dropping late response", id);
                false
            }
        }
    }

    /// Resolve `id` with a failure reason
    pub fn cancel(&self, id: CorrelationId, reason: CancelReason) -> bool {
        match self.take(id) {
            Some(entry) => {
                debug!("Cancelling correlation id {}: {}", id, reason);
                let _ = entry.slot.send(Err(reason));
                true
            }
            None => false,
        }
    }

    /// Drop `id` without resolving it
    pub fn remove(&self, id: CorrelationId) -> bool {
        self.take(id).is_some()
    }

    /// Cancel every pending request. Returns how many were cancelled.
    pub fn clear_all(&self, reason: CancelReason) -> usize {
        let drained: Vec<(CorrelationId, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            trace!("Cancelling correlation id {}: {}", id, reason);
            let _ = entry.slot.send(Err(reason.clone()));
        }
        if count > 0 {
            debug!("Cancelled {} pending requests: {}", count, reason);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
