//! # Driver Queue
//!
//! The subsystem runs on one driver thread. Background workers (installers,
//! loaders, pausers held by hooks) never touch a state machine directly; they
//! post a [`DriverEvent`] into the shared [`DriverQueue`], and the driver
//! drains it on its next [`tick`](crate::UnitSubsystem::tick).
//!
//! [`Completer`] / [`PendingResult`] form a one-shot slot for a single async
//! result. Completing it stores the value and posts an update for the unit
//! that is waiting on it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unitlc_core::{BundleId, UnitId};

/// Which installer operation a [`BundleEvent`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleOp {
    /// Download and optionally mount.
    Install,
    /// Release or uninstall.
    Release,
    /// Asset dependency streaming.
    Stream,
}

/// Why a bundle operation did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleFailure {
    /// The operation was canceled before completing.
    #[error("canceled")]
    Canceled,
    /// The operation failed with an installer-specific code.
    #[error("failed: {0}")]
    Failed(String),
}

impl BundleFailure {
    /// Short code used in transition error codes.
    pub fn code(&self) -> &str {
        match self {
            Self::Canceled => "Canceled",
            Self::Failed(code) => code,
        }
    }
}

/// Completion of one bundle within an installer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEvent {
    /// Operation kind.
    pub op: BundleOp,
    /// Bundle that finished.
    pub bundle: BundleId,
    /// Outcome.
    pub result: Result<(), BundleFailure>,
}

/// An event posted to the driver thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Re-evaluate one unit.
    Update(UnitId),
    /// A bundle operation finished. Delivered to every live unit.
    Bundle(BundleEvent),
}

/// Thread-safe handle for posting events to the driver.
#[derive(Debug, Clone, Default)]
pub struct DriverQueue {
    events: Arc<Mutex<VecDeque<DriverEvent>>>,
}

impl DriverQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Post an event.
    pub fn post(&self, event: DriverEvent) {
        self.events.lock().push_back(event);
    }

    /// Ask the driver to re-evaluate `unit` on its next tick.
    pub fn request_update(&self, unit: UnitId) {
        self.post(DriverEvent::Update(unit));
    }

    /// Remove and return every queued event in posting order.
    pub fn drain(&self) -> Vec<DriverEvent> {
        self.events.lock().drain(..).collect()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// A sink that installers use to report bundle completions.
    pub fn bundle_sink(&self) -> BundleEventSink {
        BundleEventSink {
            queue: self.clone(),
        }
    }

    /// A one-shot result slot owned by `unit`.
    pub fn pending<T>(&self, unit: UnitId) -> (PendingResult<T>, Completer<T>) {
        let slot = Arc::new(Mutex::new(None));
        (
            PendingResult { slot: slot.clone() },
            Completer {
                slot,
                queue: self.clone(),
                unit,
            },
        )
    }
}

/// Where installers report per-bundle completion.
#[derive(Debug, Clone)]
pub struct BundleEventSink {
    queue: DriverQueue,
}

impl BundleEventSink {
    /// Report that `bundle` finished `op` with `result`.
    pub fn complete(&self, op: BundleOp, bundle: BundleId, result: Result<(), BundleFailure>) {
        self.queue
            .post(DriverEvent::Bundle(BundleEvent { op, bundle, result }));
    }
}

/// The waiting side of a one-shot result.
#[derive(Debug)]
pub struct PendingResult<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> PendingResult<T> {
    /// Take the value if it has arrived.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Whether the value has arrived and not been taken.
    pub fn is_ready(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// The producing side of a one-shot result.
#[derive(Debug)]
pub struct Completer<T> {
    slot: Arc<Mutex<Option<T>>>,
    queue: DriverQueue,
    unit: UnitId,
}

impl<T> Completer<T> {
    /// Store the value and wake the owning unit.
    pub fn complete(self, value: T) {
        *self.slot.lock() = Some(value);
        self.queue.request_update(self.unit);
    }

    /// The unit waiting on this result.
    pub fn unit(&self) -> UnitId {
        self.unit
    }
}
