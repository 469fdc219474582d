//! # Completion Callbacks and Broadcasts
//!
//! Each machine keeps a callback list per Destination/Error state plus one
//! list of cancel callbacks. A broadcast detaches the list first, so a
//! callback that registers new work on the same unit lands in the fresh
//! list and is never invoked twice.
//!
//! The detached registrations are pushed as a frame onto the subsystem's
//! [`BroadcastStack`] and invoked one at a time. While a frame is live,
//! [`BroadcastStack::scrub_transition`] and
//! [`BroadcastStack::scrub_cancel`] can still remove entries from it, which
//! is how a dependent withdraws its callbacks from a broadcast that is
//! already running further up the call stack.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use unitlc_core::{OwnerId, TransitionResult, UnitId, UnitState};

use crate::subsystem::UnitSubsystem;

/// Identifies one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackHandle(pub(crate) u64);

/// What a completion callback receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    /// Unit that finished.
    pub unit: UnitId,
    /// State it stopped in.
    pub state: UnitState,
    /// Success, the error that stopped it, or the cancellation result.
    pub result: TransitionResult,
}

/// Invoked when a destination request finishes.
pub type TransitionCallback = Box<dyn FnOnce(&mut UnitSubsystem, &TransitionOutcome)>;

/// Invoked when a cancel request finishes. Receives the canceled unit.
pub type CancelCallback = Box<dyn FnOnce(&mut UnitSubsystem, UnitId)>;

/// A callback with its handle and optional owner token.
pub struct Registration<C> {
    /// Handle returned to the caller.
    pub handle: CallbackHandle,
    /// Owner token for bulk removal.
    pub owner: Option<OwnerId>,
    /// The callback.
    pub callback: C,
}

impl<C> std::fmt::Debug for Registration<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("handle", &self.handle)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Selects registrations to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// One registration.
    Handle(CallbackHandle),
    /// Every registration carrying this owner.
    Owner(OwnerId),
}

impl Removal {
    fn matches<C>(&self, registration: &Registration<C>) -> bool {
        match self {
            Removal::Handle(handle) => registration.handle == *handle,
            Removal::Owner(owner) => registration.owner == Some(*owner),
        }
    }
}

fn remove_matching<C>(list: &mut Vec<Registration<C>>, removal: Removal) -> usize {
    let before = list.len();
    list.retain(|r| !removal.matches(r));
    before - list.len()
}

// ─── Per-machine lists ───────────────────────────────────────────────

/// Pending callbacks of one machine.
#[derive(Default)]
pub struct CallbackLists {
    per_state: BTreeMap<UnitState, Vec<Registration<TransitionCallback>>>,
    cancel: Vec<Registration<CancelCallback>>,
}

impl CallbackLists {
    pub(crate) fn push_transition(&mut self, state: UnitState, registration: Registration<TransitionCallback>) {
        self.per_state.entry(state).or_default().push(registration);
    }

    pub(crate) fn push_cancel(&mut self, registration: Registration<CancelCallback>) {
        self.cancel.push(registration);
    }

    pub(crate) fn remove_transition(&mut self, removal: Removal) -> usize {
        let removed = self
            .per_state
            .values_mut()
            .map(|list| remove_matching(list, removal))
            .sum();
        self.per_state.retain(|_, list| !list.is_empty());
        removed
    }

    pub(crate) fn remove_cancel(&mut self, removal: Removal) -> usize {
        remove_matching(&mut self.cancel, removal)
    }

    /// Detach the list of one state.
    pub(crate) fn take_state(&mut self, state: UnitState) -> Vec<Registration<TransitionCallback>> {
        self.per_state.remove(&state).unwrap_or_default()
    }

    /// Detach every state list, in state order.
    pub(crate) fn take_all_states(&mut self) -> Vec<Registration<TransitionCallback>> {
        std::mem::take(&mut self.per_state)
            .into_values()
            .flatten()
            .collect()
    }

    /// Detach the cancel list.
    pub(crate) fn take_cancel(&mut self) -> Vec<Registration<CancelCallback>> {
        std::mem::take(&mut self.cancel)
    }

    /// Registered transition callbacks.
    pub fn pending_transitions(&self) -> usize {
        self.per_state.values().map(Vec::len).sum()
    }

    /// Registered cancel callbacks.
    pub fn pending_cancels(&self) -> usize {
        self.cancel.len()
    }
}

impl std::fmt::Debug for CallbackLists {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLists")
            .field("transitions", &self.pending_transitions())
            .field("cancels", &self.pending_cancels())
            .finish()
    }
}

// ─── Broadcast stack ─────────────────────────────────────────────────

enum Frame {
    Transition {
        pending: VecDeque<Registration<TransitionCallback>>,
        outcome: TransitionOutcome,
    },
    Cancel {
        pending: VecDeque<Registration<CancelCallback>>,
        unit: UnitId,
    },
}

/// Broadcasts currently running, innermost last.
#[derive(Default)]
pub(crate) struct BroadcastStack {
    frames: Vec<Frame>,
}

impl BroadcastStack {
    pub(crate) fn push_transition(
        &mut self,
        registrations: Vec<Registration<TransitionCallback>>,
        outcome: TransitionOutcome,
    ) -> usize {
        self.frames.push(Frame::Transition {
            pending: registrations.into(),
            outcome,
        });
        self.frames.len() - 1
    }

    pub(crate) fn push_cancel(&mut self, registrations: Vec<Registration<CancelCallback>>, unit: UnitId) -> usize {
        self.frames.push(Frame::Cancel {
            pending: registrations.into(),
            unit,
        });
        self.frames.len() - 1
    }

    /// Next transition callback of the frame at `depth`.
    pub(crate) fn next_transition(&mut self, depth: usize) -> Option<(TransitionCallback, TransitionOutcome)> {
        match self.frames.get_mut(depth) {
            Some(Frame::Transition { pending, outcome }) => pending
                .pop_front()
                .map(|registration| (registration.callback, outcome.clone())),
            _ => None,
        }
    }

    /// Next cancel callback of the frame at `depth`.
    pub(crate) fn next_cancel(&mut self, depth: usize) -> Option<(CancelCallback, UnitId)> {
        match self.frames.get_mut(depth) {
            Some(Frame::Cancel { pending, unit }) => pending
                .pop_front()
                .map(|registration| (registration.callback, *unit)),
            _ => None,
        }
    }

    /// Drop the frame at `depth` and anything above it.
    pub(crate) fn pop(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    /// Remove matching transition callbacks from every running broadcast.
    pub(crate) fn scrub_transition(&mut self, removal: Removal) -> usize {
        let mut removed = 0;
        for frame in &mut self.frames {
            if let Frame::Transition { pending, .. } = frame {
                let before = pending.len();
                pending.retain(|r| !removal.matches(r));
                removed += before - pending.len();
            }
        }
        removed
    }

    /// Remove matching cancel callbacks from every running broadcast.
    pub(crate) fn scrub_cancel(&mut self, removal: Removal) -> usize {
        let mut removed = 0;
        for frame in &mut self.frames {
            if let Frame::Cancel { pending, .. } = frame {
                let before = pending.len();
                pending.retain(|r| !removal.matches(r));
                removed += before - pending.len();
            }
        }
        removed
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(handle: u64, owner: Option<OwnerId>) -> Registration<TransitionCallback> {
        Registration {
            handle: CallbackHandle(handle),
            owner,
            callback: Box::new(|_, _| {}),
        }
    }

    fn outcome() -> TransitionOutcome {
        TransitionOutcome {
            unit: UnitId(1),
            state: UnitState::Registered,
            result: Ok(()),
        }
    }

    #[test]
    fn take_detaches_list() {
        let mut lists = CallbackLists::default();
        lists.push_transition(UnitState::Registered, registration(1, None));
        lists.push_transition(UnitState::Active, registration(2, None));
        assert_eq!(lists.take_state(UnitState::Registered).len(), 1);
        assert_eq!(lists.pending_transitions(), 1);
        assert!(lists.take_state(UnitState::Registered).is_empty());
        assert_eq!(lists.take_all_states().len(), 1);
        assert_eq!(lists.pending_transitions(), 0);
    }

    #[test]
    fn removal_by_owner_and_handle() {
        let owner = OwnerId::new();
        let mut lists = CallbackLists::default();
        lists.push_transition(UnitState::Registered, registration(1, Some(owner)));
        lists.push_transition(UnitState::Active, registration(2, Some(owner)));
        lists.push_transition(UnitState::Active, registration(3, None));

        assert_eq!(lists.remove_transition(Removal::Owner(owner)), 2);
        assert_eq!(lists.remove_transition(Removal::Handle(CallbackHandle(3))), 1);
        assert_eq!(lists.pending_transitions(), 0);
    }

    #[test]
    fn scrub_reaches_running_frames() {
        let owner = OwnerId::new();
        let mut stack = BroadcastStack::default();
        let outer = stack.push_transition(
            vec![registration(1, None), registration(2, Some(owner))],
            outcome(),
        );
        let inner = stack.push_transition(vec![registration(3, Some(owner))], outcome());
        assert_eq!(stack.depth(), 2);

        assert_eq!(stack.scrub_transition(Removal::Owner(owner)), 2);
        assert!(stack.next_transition(inner).is_none());
        stack.pop(inner);

        assert!(stack.next_transition(outer).is_some());
        assert!(stack.next_transition(outer).is_none());
        stack.pop(outer);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn cancel_frames_are_separate() {
        let mut stack = BroadcastStack::default();
        let depth = stack.push_cancel(
            vec![Registration {
                handle: CallbackHandle(1),
                owner: None,
                callback: Box::new(|_: &mut UnitSubsystem, _: UnitId| {}) as CancelCallback,
            }],
            UnitId(4),
        );
        assert!(stack.next_transition(depth).is_none());
        let (_, unit) = stack.next_cancel(depth).unwrap();
        assert_eq!(unit, UnitId(4));
        assert_eq!(stack.scrub_cancel(Removal::Handle(CallbackHandle(1))), 0);
    }
}
