//! Correlation table: in-flight requests keyed by request id.
//!
//! The client registers an entry before writing a request; the reader loop
//! routes inbound messages to it. An entry leaves the table exactly once:
//! terminal delivery, drain on connection teardown, or caller detach.

use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::protocol::RequestId;
use crate::error::ClientError;

/// Value delivered to a request's result slot.
pub type ResponseResult = Result<Value, ClientError>;

/// Single-assignment result slot. The reader loop is the only sender.
pub(crate) type ResultSlot = oneshot::Sender<ResponseResult>;

/// Receives progress updates for one request, in peer order, before its
/// terminal response. Invoked on the reader task, so it must not block.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(Value) + Send + Sync>);

impl ProgressSink {
    pub fn new(f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Sink that forwards every update into an unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |update| {
            let _ = tx.send(update);
        });
        (sink, rx)
    }

    pub(crate) fn emit(&self, update: Value) {
        (self.0)(update);
    }
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressSink")
    }
}

struct PendingRequest {
    slot: ResultSlot,
    progress: ProgressSink,
}

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// The entry existed but its handle was already dropped.
    Detached,
    /// No entry for this id; the message was dropped.
    UnknownId,
}

/// Concurrency-safe map of pending requests plus a drain gate.
///
/// `register` holds the gate for reading, `drain_all` for writing, so a
/// registration either lands before the drain (and is failed by it) or sees
/// the closed gate and fails with [`ClientError::ConnectionClosed`].
pub struct PendingTable {
    entries: DashMap<RequestId, PendingRequest>,
    draining: RwLock<bool>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            draining: RwLock::new(false),
        }
    }

    pub(crate) fn register(
        &self,
        id: RequestId,
        slot: ResultSlot,
        progress: ProgressSink,
    ) -> Result<(), ClientError> {
        let draining = self.draining.read().unwrap_or_else(PoisonError::into_inner);
        if *draining {
            return Err(ClientError::ConnectionClosed);
        }

        match self.entries.entry(id) {
            Entry::Occupied(_) => {
                debug_assert!(false, "request id {id} registered twice");
                tracing::error!(request_id = %id, "Bug: request id registered twice");
                Err(ClientError::ProtocolViolation(format!(
                    "request id {id} is already in flight"
                )))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingRequest { slot, progress });
                Ok(())
            }
        }
    }

    /// Remove the entry and fulfil its slot. No-op for unknown ids.
    pub fn route_terminal(&self, id: RequestId, result: ResponseResult) -> RouteOutcome {
        match self.entries.remove(&id) {
            Some((_, pending)) => {
                if pending.slot.send(result).is_ok() {
                    RouteOutcome::Delivered
                } else {
                    RouteOutcome::Detached
                }
            }
            None => RouteOutcome::UnknownId,
        }
    }

    /// Invoke the entry's progress sink without removing it.
    pub fn route_progress(&self, id: RequestId, update: Value) -> RouteOutcome {
        // Clone the sink out so no shard lock is held while user code runs.
        let sink = match self.entries.get(&id) {
            Some(entry) if entry.slot.is_closed() => return RouteOutcome::Detached,
            Some(entry) => entry.progress.clone(),
            None => return RouteOutcome::UnknownId,
        };
        sink.emit(update);
        RouteOutcome::Delivered
    }

    /// Drop an entry without fulfilling it. Returns whether it was present.
    pub fn forget(&self, id: RequestId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Close the gate and fail every remaining entry. Returns how many were failed.
    pub fn drain_all(&self, make_error: impl Fn() -> ClientError) -> usize {
        let mut draining = self.draining.write().unwrap_or_else(PoisonError::into_inner);
        *draining = true;
        drop(draining);

        let ids: Vec<RequestId> = self.entries.iter().map(|entry| *entry.key()).collect();
        let mut drained = 0;
        for id in ids {
            if let Some((_, pending)) = self.entries.remove(&id) {
                let _ = pending.slot.send(Err(make_error()));
                drained += 1;
            }
        }
        drained
    }

    pub fn is_draining(&self) -> bool {
        *self.draining.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
