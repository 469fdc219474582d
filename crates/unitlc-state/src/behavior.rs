//! # State Behaviors
//!
//! Each of the 37 states has one [`StateBehavior`] object per machine, held
//! in a [`BehaviorTable`] indexed by ordinal. The drive loop calls:
//!
//! 1. `begin_state` when the state is entered (reset per-attempt fields),
//! 2. `update_state` until it returns something other than [`StateStep::Hold`],
//! 3. `end_state` when the state is left (release handles and subscriptions).
//!
//! `try_cancel` is a best-effort request to abort outstanding async work;
//! the work still has to report back before the state advances.
//!
//! Behaviors receive a [`StateContext`] that exposes the unit's properties
//! and the owning subsystem. The machine is checked out of the subsystem
//! while its behavior runs, so a behavior may freely drive other units.

use unitlc_core::{
    ErrorKind, LifecycleConfig, ProtocolOptions, StateRange, TransitionError, UnitId, UnitState,
};

use crate::batch::BatchProcessor;
use crate::bundles::SharedBundleTracker;
use crate::machine::UnitProperties;
use crate::ports::{PauseContext, Services};
use crate::queue::{BundleEvent, BundleEventSink, Completer, PendingResult};
use crate::subsystem::UnitSubsystem;

/// What `update_state` decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateStep {
    /// Work is outstanding; stop driving until woken.
    Hold,
    /// Move to the given state with a success result.
    Advance(UnitState),
    /// Move to an Error state with a failure result.
    Fail {
        /// Error state to land in.
        to: UnitState,
        /// The failure.
        error: TransitionError,
        /// Log the failure at info instead of error.
        suppress_log: bool,
    },
}

impl StateStep {
    /// A logged failure.
    pub fn fail(to: UnitState, error: TransitionError) -> Self {
        StateStep::Fail {
            to,
            error,
            suppress_log: false,
        }
    }
}

/// Everything a behavior may touch while it runs.
pub struct StateContext<'a> {
    /// Unit being driven.
    pub unit: UnitId,
    /// State whose behavior is running.
    pub state: UnitState,
    /// The unit's properties.
    pub props: &'a mut UnitProperties,
    /// The owning subsystem. The unit itself is checked out.
    pub subsystem: &'a mut UnitSubsystem,
}

impl<'a> StateContext<'a> {
    /// Injected configuration.
    pub fn config(&self) -> &LifecycleConfig {
        self.subsystem.config()
    }

    /// Collaborators, cloned so they can be used while the subsystem is borrowed.
    pub fn services(&self) -> Services {
        self.subsystem.services().clone()
    }

    /// A failure raised in the running state.
    pub fn error(&self, kind: ErrorKind, code: impl AsRef<str>) -> TransitionError {
        TransitionError::new(self.state, kind, code)
    }

    /// Re-evaluate this unit on the current tick.
    pub fn request_update(&mut self) {
        self.subsystem.request_update(self.unit);
    }

    /// Re-evaluate this unit on the next tick.
    pub fn defer_update(&mut self) {
        self.subsystem.defer_update(self.unit);
    }

    /// Re-run `update_state` as soon as the running call returns.
    pub fn update_immediate(&mut self) {
        self.subsystem.update_immediate(self.unit);
    }

    /// Sink for installer completions.
    pub fn bundle_sink(&self) -> BundleEventSink {
        self.subsystem.queue().bundle_sink()
    }

    /// A one-shot result slot that wakes this unit when completed.
    pub fn pending<T>(&self) -> (PendingResult<T>, Completer<T>) {
        self.subsystem.queue().pending(self.unit)
    }

    /// A fresh pause context for hooks.
    pub fn pause_context(&self) -> PauseContext {
        PauseContext::new(self.subsystem.queue().clone(), self.unit)
    }

    /// The process-wide bundle tracker.
    pub fn bundles(&mut self) -> &mut SharedBundleTracker {
        self.subsystem.bundles_mut()
    }

    /// Record and report progress of the running state.
    pub fn report_progress(&mut self, fraction: f32) {
        self.props.progress = fraction.clamp(0.0, 1.0);
        self.subsystem
            .services()
            .progress
            .on_progress(self.unit, self.state, self.props.progress);
    }

    /// Report that a named phase began.
    pub fn status_event(&self, phase: &str) {
        self.subsystem.services().progress.on_status_event(phase, self.unit);
    }

    /// Current destination range.
    pub fn destination(&self) -> StateRange {
        self.props.destination
    }
}

/// Per-state lifecycle contract.
#[allow(unused_variables)]
pub trait StateBehavior {
    /// Entered the state.
    fn begin_state(&mut self, ctx: &mut StateContext<'_>) {}

    /// Do the state's work and decide where to go.
    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep;

    /// Leaving the state.
    fn end_state(&mut self, ctx: &mut StateContext<'_>) {}

    /// Abort outstanding async work, if any.
    fn try_cancel(&mut self, ctx: &mut StateContext<'_>) {}

    /// Whether this state's per-unit work can be batched for `props`.
    fn can_batch_process(&self, props: &UnitProperties, config: &LifecycleConfig) -> bool {
        false
    }

    /// Shared work run once per batch.
    fn batch_processor(&self) -> Option<BatchProcessor> {
        None
    }

    /// A bundle operation finished somewhere. Returns `true` when the unit
    /// should be re-evaluated.
    fn on_bundle_event(&mut self, ctx: &mut StateContext<'_>, event: &BundleEvent) -> bool {
        false
    }

    /// Replace the unit's protocol options. Returns whether they changed.
    fn try_update_protocol_options(
        &mut self,
        ctx: &mut StateContext<'_>,
        options: &ProtocolOptions,
    ) -> Result<bool, TransitionError> {
        apply_protocol_options(ctx, options)
    }
}

/// Validate `options` and store them on the unit.
pub fn apply_protocol_options(
    ctx: &mut StateContext<'_>,
    options: &ProtocolOptions,
) -> Result<bool, TransitionError> {
    let protocol = ctx.props.identifier.protocol();
    if !options.matches(protocol) {
        return Err(ctx.error(ErrorKind::Options, "ProtocolOptions.Invalid_Protocol"));
    }
    if ctx.props.options.validate_update(protocol, options).is_err() {
        return Err(ctx.error(ErrorKind::Options, "ProtocolOptions.Invalid_Update"));
    }
    if ctx.props.options == *options {
        return Ok(false);
    }
    ctx.props.options = options.clone();
    Ok(true)
}

/// One behavior per state, indexed by ordinal.
pub struct BehaviorTable {
    slots: [Box<dyn StateBehavior>; UnitState::COUNT],
}

impl BehaviorTable {
    /// Build a table from a per-state constructor.
    pub fn from_fn(mut make: impl FnMut(UnitState) -> Box<dyn StateBehavior>) -> Self {
        Self {
            slots: std::array::from_fn(|i| make(UnitState::ALL[i])),
        }
    }

    /// The standard lifecycle behaviors.
    pub fn standard() -> Self {
        Self::from_fn(crate::states::behavior_for)
    }

    /// The behavior for `state`.
    pub fn get(&self, state: UnitState) -> &dyn StateBehavior {
        &*self.slots[state.index()]
    }

    /// The behavior for `state`, mutably.
    pub fn get_mut(&mut self, state: UnitState) -> &mut dyn StateBehavior {
        &mut *self.slots[state.index()]
    }
}

impl std::fmt::Debug for BehaviorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorTable").finish_non_exhaustive()
    }
}
