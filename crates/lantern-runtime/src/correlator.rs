//! Ticket-based correlation for multi-hop requests.
//!
//! Requests that traverse the mesh come back as notification frames, not as
//! in-band responses, so the caller's future has to be parked until a frame
//! carrying the matching ticket arrives. Pending entries live in an explicit
//! map with one timeout task each; tearing the runtime down drains the map so
//! no future is left hanging.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use lantern_link::ConnectorKind;

/// Correlation id for one outstanding multi-hop request.
pub type Ticket = u32;

/// One hop on a connection path through the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopDescriptor {
    pub address: u32,
    pub connector_kind: ConnectorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("invalid connection path")]
    InvalidPath,
    #[error("hop unreachable")]
    HopUnreachable,
    #[error("request timed out")]
    Timeout,
    #[error("connector not found on remote hop")]
    ConnectorNotFound,
    #[error("send failed")]
    SendFailed,
    #[error("remote failure, code {0}")]
    Failure(u8),
    #[error("request initiation failed: {0}")]
    InitiationFailed(String),
    #[error("request canceled")]
    Canceled,
}

impl CorrelatorError {
    /// Map a response status byte onto a failure reason. Zero is success and
    /// never reaches this.
    fn from_code(code: u8) -> Self {
        match code {
            1 => CorrelatorError::InvalidPath,
            2 => CorrelatorError::HopUnreachable,
            3 => CorrelatorError::Timeout,
            4 => CorrelatorError::ConnectorNotFound,
            5 => CorrelatorError::SendFailed,
            other => CorrelatorError::Failure(other),
        }
    }
}

struct PendingRequest {
    done: oneshot::Sender<Result<Bytes, CorrelatorError>>,
    timeout_task: JoinHandle<()>,
}

struct Inner {
    next_ticket: AtomicU32,
    pending: DashMap<Ticket, PendingRequest>,
}

/// Shared map of outstanding tickets. Cheap to clone.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_ticket: AtomicU32::new(1),
                pending: DashMap::new(),
            }),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.pending.len()
    }

    /// Register a pending entry, run `send` with the allocated ticket, and
    /// wait for the matching response.
    ///
    /// The entry exists before `send` runs so a response racing the send path
    /// cannot be dropped. If `send` fails synchronously the entry is removed
    /// again and no ticket is consumed by a response.
    pub async fn request<F>(
        &self,
        timeout: Duration,
        send: F,
    ) -> Result<Bytes, CorrelatorError>
    where
        F: FnOnce(Ticket) -> Result<(), CorrelatorError>,
    {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                if let Some((_, entry)) = inner.pending.remove(&ticket) {
                    debug!(ticket, "multi-hop request timed out");
                    let _ = entry.done.send(Err(CorrelatorError::Timeout));
                }
            }
        });

        self.inner.pending.insert(
            ticket,
            PendingRequest {
                done: tx,
                timeout_task,
            },
        );

        if let Err(e) = send(ticket) {
            if let Some((_, entry)) = self.inner.pending.remove(&ticket) {
                entry.timeout_task.abort();
            }
            return Err(e);
        }

        trace!(ticket, "multi-hop request in flight");
        rx.await.unwrap_or(Err(CorrelatorError::Canceled))
    }

    /// Resolve a ticket from a decoded response. Returns false when the
    /// ticket is unknown, already resolved or timed out.
    pub fn resolve(&self, ticket: Ticket, code: u8, payload: Bytes) -> bool {
        match self.inner.pending.remove(&ticket) {
            Some((_, entry)) => {
                let result = if code == 0 {
                    Ok(payload)
                } else {
                    Err(CorrelatorError::from_code(code))
                };
                let _ = entry.done.send(result);
                entry.timeout_task.abort();
                true
            }
            None => {
                trace!(ticket, "dropping response for unknown ticket");
                false
            }
        }
    }

    /// Reject a ticket whose physical send failed after registration.
    pub fn fail(&self, ticket: Ticket, error: CorrelatorError) {
        if let Some((_, entry)) = self.inner.pending.remove(&ticket) {
            let _ = entry.done.send(Err(error));
            entry.timeout_task.abort();
        }
    }

    /// Reject every outstanding ticket. Called on runtime teardown.
    pub fn cancel_all(&self) {
        let tickets: Vec<Ticket> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for ticket in tickets {
            self.fail(ticket, CorrelatorError::Canceled);
        }
    }
}
