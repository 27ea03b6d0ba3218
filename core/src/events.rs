//! Lifecycle notifications.
//!
//! # Design
//! Each notification point is a `Listeners<A>` registry. Listeners run
//! synchronously, in registration order. "started" runs on the thread that
//! called `submit`; the rest run on whichever thread is delivering at the
//! time, usually the transport's.
//! Every listener runs under `catch_unwind`; a panicking listener is logged
//! and the remaining listeners still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

use crate::body::ResponseBodyRef;

type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Cumulative transfer counters for the request in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub sent: u64,
    pub received: u64,
}

pub struct Listeners<A> {
    name: &'static str,
    slots: Mutex<Vec<Listener<A>>>,
}

impl<A> Listeners<A> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&A) + Send + Sync + 'static) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    pub(crate) fn emit(&self, arg: &A) {
        // Snapshot so listeners may subscribe more listeners.
        let listeners: Vec<_> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(arg))).is_err() {
                error!(event = self.name, listener = index, "listener panicked");
            }
        }
    }
}

/// The five notification points a `WebApi` exposes.
pub struct Events {
    pub started: Listeners<()>,
    pub succeeded: Listeners<ResponseBodyRef>,
    pub failed: Listeners<ResponseBodyRef>,
    pub completed: Listeners<ResponseBodyRef>,
    pub progress: Listeners<Progress>,
}

impl Default for Events {
    fn default() -> Self {
        Self {
            started: Listeners::new("started"),
            succeeded: Listeners::new("succeeded"),
            failed: Listeners::new("failed"),
            completed: Listeners::new("completed"),
            progress: Listeners::new("progress"),
        }
    }
}
