//! The seam between the orchestrator and whatever performs network I/O.
//!
//! # Design
//! A `Transport` takes an `HttpRequest` plus a `RequestCallbacks` sink and
//! returns immediately. It later reports progress and exactly one completion
//! through the sink, from any thread it likes. Each sink is tagged with the
//! `DispatchId` of the submit that created it; the orchestrator drops
//! anything arriving for a dispatch that is no longer current, so a
//! transport never has to worry about late callbacks after a cancel.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::error::DispatchError;
use crate::http::{HttpRequest, Payload};

pub trait Transport: Send + Sync {
    /// Start sending `request` without blocking. Returning `Err` means the
    /// request was never started and no callback will fire.
    fn dispatch(
        &self,
        request: HttpRequest,
        callbacks: RequestCallbacks,
    ) -> Result<TransportHandle, DispatchError>;

    /// Best-effort cancellation. May take effect later or not at all.
    fn cancel(&self, handle: &TransportHandle) {
        handle.cancel();
    }
}

/// Generation token identifying one accepted submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchId(Uuid);

impl DispatchId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A transport's handle on one request, shared with its worker so the
/// worker can observe cancellation.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    id: Uuid,
    cancelled: Arc<AtomicBool>,
}

impl TransportHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for TransportHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw outcome of one request as the transport saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub payload: Payload,
    /// `false` for connection errors, timeouts and anything else that kept
    /// the exchange from finishing.
    pub succeeded: bool,
}

impl TransportResponse {
    pub fn ok(status: u16, payload: Payload) -> Self {
        Self {
            status,
            payload,
            succeeded: true,
        }
    }

    pub fn failed(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            payload: Payload::Text(reason.into()),
            succeeded: false,
        }
    }
}

pub(crate) trait DispatchSink: Send + Sync {
    fn on_progress(&self, id: DispatchId, sent: u64, received: u64);

    fn on_complete(&self, id: DispatchId, response: TransportResponse);
}

/// Where a transport reports progress and completion for one dispatch.
///
/// Holds only a weak reference to the orchestrator: callbacks arriving after
/// it has been dropped go nowhere.
#[derive(Clone)]
pub struct RequestCallbacks {
    id: DispatchId,
    sink: Weak<dyn DispatchSink>,
}

impl RequestCallbacks {
    pub(crate) fn new(id: DispatchId, sink: Weak<dyn DispatchSink>) -> Self {
        Self { id, sink }
    }

    pub fn dispatch_id(&self) -> DispatchId {
        self.id
    }

    /// Report cumulative bytes sent and received so far.
    pub fn progress(&self, sent: u64, received: u64) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_progress(self.id, sent, received);
        }
    }

    /// Report the outcome. Only the first call for a dispatch has any
    /// effect.
    pub fn complete(&self, response: TransportResponse) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_complete(self.id, response);
        }
    }
}

impl fmt::Debug for RequestCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCallbacks").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_clones_share_cancellation() {
        let handle = TransportHandle::new();
        let worker = handle.clone();
        assert!(!worker.is_cancelled());
        handle.cancel();
        assert!(worker.is_cancelled());
        assert_eq!(handle.id(), worker.id());
    }

    #[test]
    fn failed_response_carries_reason_as_text() {
        let r = TransportResponse::failed(0, "connection refused");
        assert!(!r.succeeded);
        assert_eq!(r.payload, Payload::Text("connection refused".into()));
    }

    #[test]
    fn callbacks_without_orchestrator_are_inert() {
        let sink: Weak<dyn DispatchSink> = Weak::<Noop>::new();
        let callbacks = RequestCallbacks::new(DispatchId::new(), sink);
        callbacks.progress(1, 2);
        callbacks.complete(TransportResponse::ok(200, Payload::default()));
    }

    struct Noop;

    impl DispatchSink for Noop {
        fn on_progress(&self, _: DispatchId, _: u64, _: u64) {}
        fn on_complete(&self, _: DispatchId, _: TransportResponse) {}
    }
}
