//! # Batch Coordinator
//!
//! A unit entering a batchable state parks a request here instead of doing
//! its per-unit work. Once per tick the subsystem takes every request,
//! groups them by state, runs the state's batch processor once for the whole
//! group, and wakes each unit so it finishes the state normally.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use unitlc_core::{UnitId, UnitState};

use crate::ports::Services;

/// Identifies one parked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchHandle(u64);

/// One unit handed to a batch processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Unit.
    pub unit: UnitId,
    /// Unit name.
    pub name: String,
}

/// Shared work run once for a group of units in the same state.
pub type BatchProcessor = fn(&Services, &[BatchItem]);

/// Per-unit batching status, kept in the unit's properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchState {
    /// The unit's parked request, if any.
    pub handle: Option<BatchHandle>,
    /// The batch for the current state already ran for this unit.
    pub was_processed: bool,
}

/// Parked requests, grouped by state.
#[derive(Debug, Default)]
pub struct BatchCoordinator {
    next_handle: u64,
    requests: BTreeMap<UnitState, Vec<(BatchHandle, UnitId)>>,
}

impl BatchCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `unit` at `state`.
    pub fn add_request(&mut self, state: UnitState, unit: UnitId) -> BatchHandle {
        self.next_handle += 1;
        let handle = BatchHandle(self.next_handle);
        self.requests.entry(state).or_default().push((handle, unit));
        handle
    }

    /// Withdraw a parked request. Returns `false` if it was not parked.
    pub fn cancel(&mut self, state: UnitState, handle: BatchHandle) -> bool {
        let Some(list) = self.requests.get_mut(&state) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != handle);
        let removed = list.len() != before;
        if list.is_empty() {
            self.requests.remove(&state);
        }
        removed
    }

    /// Take every parked request, grouped by state in ordinal order.
    pub fn take_all(&mut self) -> Vec<(UnitState, Vec<(BatchHandle, UnitId)>)> {
        std::mem::take(&mut self.requests).into_iter().collect()
    }

    /// Requests parked at `state`.
    pub fn pending(&self, state: UnitState) -> usize {
        self.requests.get(&state).map(Vec::len).unwrap_or(0)
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_by_state() {
        let mut batches = BatchCoordinator::new();
        batches.add_request(UnitState::Activating, UnitId(1));
        batches.add_request(UnitState::Activating, UnitId(2));
        assert_eq!(batches.pending(UnitState::Activating), 2);

        let groups = batches.take_all();
        assert_eq!(groups.len(), 1);
        let (state, requests) = &groups[0];
        assert_eq!(*state, UnitState::Activating);
        let units: Vec<_> = requests.iter().map(|(_, u)| *u).collect();
        assert_eq!(units, vec![UnitId(1), UnitId(2)]);
        assert!(batches.is_empty());
    }

    #[test]
    fn cancel_withdraws_only_that_request() {
        let mut batches = BatchCoordinator::new();
        let a = batches.add_request(UnitState::Activating, UnitId(1));
        let b = batches.add_request(UnitState::Activating, UnitId(2));
        assert_ne!(a, b);

        assert!(batches.cancel(UnitState::Activating, a));
        assert!(!batches.cancel(UnitState::Activating, a));
        assert!(!batches.cancel(UnitState::Loading, b));
        assert_eq!(batches.pending(UnitState::Activating), 1);

        assert!(batches.cancel(UnitState::Activating, b));
        assert!(batches.is_empty());
    }
}
