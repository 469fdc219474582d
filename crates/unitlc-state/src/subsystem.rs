//! # Unit Subsystem
//!
//! The registry of live units and the driver that moves them.
//!
//! ## Drive loop
//!
//! [`UnitSubsystem::update_immediate`] latches the unit and repeatedly calls
//! the current behavior's `update_state`:
//!
//! - [`StateStep::Hold`]: stop until woken, unless a rerun was requested
//!   while the behavior ran.
//! - Advance or Fail: run `end_state`, withdraw any batch request, switch
//!   state, run `begin_state`, then
//!   - a pending cancel landing on a non-Transition state collapses the
//!     destination and broadcasts `Canceled` to every list, then runs the
//!     cancel callbacks;
//!   - a failure collapses the destination to the Error state and
//!     broadcasts the error to every list;
//!   - a success is broadcast to the reached state's list only, and driving
//!     continues while the state is a Transition state or outside the
//!     destination.
//!
//! More than [`MAX_TRANSITIONS`] iterations in one drive, a self-transition,
//! or a failure that lands outside an Error state is a fatal invariant
//! violation and panics.
//!
//! ## Check-out
//!
//! A machine is removed from the registry while its behavior runs and put
//! back afterwards. Behaviors therefore get `&mut UnitSubsystem` and may
//! drive other units. Requests that target a checked-out unit are either
//! recorded for later (updates, callback removals) or rejected (destination
//! and cancel requests), which also rejects dependency cycles.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use unitlc_core::{
    CoreError, ErrorKind, LifecycleConfig, OptionsError, ProtocolOptions, StateRange, TransitionError,
    UnitId, UnitIdentifier, UnitState,
};

use crate::batch::{BatchCoordinator, BatchItem};
use crate::behavior::{BehaviorTable, StateBehavior, StateContext, StateStep};
use crate::broadcast::{
    BroadcastStack, CallbackHandle, CancelCallback, Registration, Removal, TransitionCallback,
    TransitionOutcome,
};
use crate::bundles::SharedBundleTracker;
use crate::machine::{UnitProperties, UnitSnapshot, UnitStateMachine};
use crate::ports::Services;
use crate::queue::{BundleEvent, DriverEvent, DriverQueue};

/// Iteration cap for one drive of one unit.
pub const MAX_TRANSITIONS: usize = 10_000;

/// Passes over coalesced updates within one tick.
const MAX_UPDATE_PASSES: usize = 64;

/// Answer to a destination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationRequest {
    /// Refused; the callback was dropped uncalled.
    Rejected,
    /// Already there; the callback ran before returning.
    CompletedImmediately,
    /// Queued; the callback runs when the request finishes.
    Queued(CallbackHandle),
}

impl DestinationRequest {
    /// Whether the request was accepted.
    pub fn accepted(&self) -> bool {
        !matches!(self, DestinationRequest::Rejected)
    }

    /// Handle of a queued callback.
    pub fn handle(&self) -> Option<CallbackHandle> {
        match self {
            DestinationRequest::Queued(handle) => Some(*handle),
            _ => None,
        }
    }
}

/// What one [`UnitSubsystem::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    /// Queue events drained.
    pub events: usize,
    /// Units driven.
    pub driven: usize,
    /// Batches run.
    pub batches: usize,
}

enum PendingRemoval {
    Transition(Removal),
    Cancel(Removal),
}

enum Finish {
    Canceled {
        lists: Vec<Registration<TransitionCallback>>,
        cancels: Vec<Registration<CancelCallback>>,
    },
    Failed {
        lists: Vec<Registration<TransitionCallback>>,
        error: TransitionError,
    },
    Reached {
        lists: Vec<Registration<TransitionCallback>>,
    },
}

/// Registry and driver for every live unit.
pub struct UnitSubsystem {
    config: LifecycleConfig,
    services: Services,
    queue: DriverQueue,
    behavior_factory: fn() -> BehaviorTable,
    machines: BTreeMap<UnitId, UnitStateMachine>,
    checked_out: BTreeMap<UnitId, UnitState>,
    by_url: HashMap<String, UnitId>,
    next_unit: u64,
    next_callback: u64,
    reruns: BTreeSet<UnitId>,
    transitioning: BTreeSet<UnitId>,
    pending_updates: BTreeSet<UnitId>,
    deferred_updates: BTreeSet<UnitId>,
    deferred_removals: BTreeMap<UnitId, Vec<PendingRemoval>>,
    batches: BatchCoordinator,
    bundles: SharedBundleTracker,
    broadcasts: BroadcastStack,
}

impl UnitSubsystem {
    /// A subsystem with the standard lifecycle behaviors.
    pub fn new(config: LifecycleConfig, services: Services) -> Self {
        Self::with_behaviors(config, services, BehaviorTable::standard)
    }

    /// A subsystem whose machines use `behavior_factory` for their tables.
    pub fn with_behaviors(
        config: LifecycleConfig,
        services: Services,
        behavior_factory: fn() -> BehaviorTable,
    ) -> Self {
        Self {
            config,
            services,
            queue: DriverQueue::new(),
            behavior_factory,
            machines: BTreeMap::new(),
            checked_out: BTreeMap::new(),
            by_url: HashMap::new(),
            next_unit: 0,
            next_callback: 0,
            reruns: BTreeSet::new(),
            transitioning: BTreeSet::new(),
            pending_updates: BTreeSet::new(),
            deferred_updates: BTreeSet::new(),
            deferred_removals: BTreeMap::new(),
            batches: BatchCoordinator::new(),
            bundles: SharedBundleTracker::new(),
            broadcasts: BroadcastStack::default(),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────

    /// Injected configuration.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Mutable configuration, for runtime flags such as `loading_startup_units`.
    pub fn config_mut(&mut self) -> &mut LifecycleConfig {
        &mut self.config
    }

    /// Collaborators.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Handle for posting events from other threads.
    pub fn queue(&self) -> &DriverQueue {
        &self.queue
    }

    /// The bundle reference table.
    pub fn bundles(&self) -> &SharedBundleTracker {
        &self.bundles
    }

    pub(crate) fn bundles_mut(&mut self) -> &mut SharedBundleTracker {
        &mut self.bundles
    }

    /// Parked batch requests.
    pub fn batches(&self) -> &BatchCoordinator {
        &self.batches
    }

    // ─── Registry ────────────────────────────────────────────────────

    /// The unit for `url`, creating it in UnknownStatus if needed.
    ///
    /// `options` default to the protocol's defaults and are ignored when the
    /// unit already exists.
    pub fn find_or_create(&mut self, url: &str, options: Option<ProtocolOptions>) -> Result<UnitId, CoreError> {
        let identifier = UnitIdentifier::new(url)?;
        if let Some(unit) = self.by_url.get(identifier.identifying_str()) {
            return Ok(*unit);
        }
        let protocol = identifier.protocol();
        let options = options.unwrap_or_else(|| ProtocolOptions::for_protocol(protocol));
        if !options.matches(protocol) {
            return Err(OptionsError::ProtocolMismatch(protocol).into());
        }

        self.next_unit += 1;
        let unit = UnitId(self.next_unit);
        let key = identifier.identifying_str().to_string();
        let props = UnitProperties::new(unit, identifier, options);
        let mut machine = UnitStateMachine::new(props, (self.behavior_factory)());
        machine.current = UnitState::UnknownStatus;
        self.checked_out.insert(unit, UnitState::UnknownStatus);
        self.run_behavior(&mut machine, |behavior, ctx| behavior.begin_state(ctx));
        self.check_in(machine);
        self.by_url.insert(key, unit);
        tracing::debug!(unit = %unit, url = %url, "created unit");
        Ok(unit)
    }

    /// The live unit for `url`.
    pub fn find(&self, url: &str) -> Option<UnitId> {
        let identifier = UnitIdentifier::new(url).ok()?;
        self.by_url.get(identifier.identifying_str()).copied()
    }

    /// Current state of a live unit.
    pub fn state_of(&self, unit: UnitId) -> Option<UnitState> {
        self.machines
            .get(&unit)
            .map(UnitStateMachine::current)
            .or_else(|| self.checked_out.get(&unit).copied())
    }

    /// Destination range of a live unit.
    pub fn destination_of(&self, unit: UnitId) -> Option<StateRange> {
        self.machines.get(&unit).map(|m| m.props.destination)
    }

    /// Progress of a live unit's current work state.
    pub fn progress_of(&self, unit: UnitId) -> Option<f32> {
        self.machines.get(&unit).map(|m| m.props.progress)
    }

    /// Options of a live unit.
    pub fn options_of(&self, unit: UnitId) -> Option<&ProtocolOptions> {
        self.machines.get(&unit).map(|m| &m.props.options)
    }

    /// Name of a live unit.
    pub fn name_of(&self, unit: UnitId) -> Option<&str> {
        self.machines.get(&unit).map(|m| m.props.name.as_str())
    }

    /// Whether the unit refuses forward progress.
    pub fn is_unrecoverable(&self, unit: UnitId) -> bool {
        self.machines
            .get(&unit)
            .map(|m| m.props.unrecoverable)
            .unwrap_or(false)
    }

    /// Whether the unit's availability has been determined.
    pub fn is_status_known(&self, unit: UnitId) -> bool {
        self.state_of(unit)
            .map(|s| {
                matches!(
                    s,
                    UnitState::ErrorUnavailable | UnitState::Uninstalling | UnitState::ErrorUninstalling
                ) || s >= UnitState::StatusKnown
            })
            .unwrap_or(false)
    }

    /// Whether the unit's content is available.
    pub fn is_available(&self, unit: UnitId) -> bool {
        self.state_of(unit)
            .map(|s| s >= UnitState::StatusKnown)
            .unwrap_or(false)
    }

    /// Whether the unit streams asset dependencies.
    pub fn has_asset_streaming_dependencies(&self, unit: UnitId) -> bool {
        self.machines
            .get(&unit)
            .and_then(|m| m.props.metadata.as_ref())
            .map(|meta| !meta.asset_stream_bundles().is_empty())
            .unwrap_or(false)
    }

    /// Record that the host loaded the unit as part of its built-in set.
    pub fn mark_loaded_as_builtin(&mut self, unit: UnitId) {
        if let Some(machine) = self.machines.get_mut(&unit) {
            machine.props.loaded_as_builtin = true;
        }
    }

    /// Whether the unit was loaded as built-in.
    pub fn was_loaded_as_builtin(&self, unit: UnitId) -> bool {
        self.machines
            .get(&unit)
            .map(|m| m.props.loaded_as_builtin)
            .unwrap_or(false)
    }

    /// Every live unit.
    pub fn active_units(&self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = self.machines.keys().copied().collect();
        units.extend(self.checked_out.keys().copied());
        units.sort();
        units.dedup();
        units
    }

    /// Snapshot of a live unit.
    pub fn snapshot(&self, unit: UnitId) -> Option<UnitSnapshot> {
        self.machines.get(&unit).map(UnitStateMachine::snapshot)
    }

    /// Whether any unit is still moving toward its destination.
    pub fn has_running_units(&self) -> bool {
        !self.transitioning.is_empty()
    }

    // ─── Requests ────────────────────────────────────────────────────

    /// Ask `unit` to move into `range`. `on_complete` runs exactly once when
    /// the request finishes, unless the request is rejected.
    pub fn set_destination(
        &mut self,
        unit: UnitId,
        range: StateRange,
        on_complete: impl FnOnce(&mut UnitSubsystem, &TransitionOutcome) + 'static,
    ) -> DestinationRequest {
        self.set_destination_with_owner(unit, range, None, on_complete)
    }

    /// [`Self::set_destination`] with an owner token for bulk removal.
    pub fn set_destination_with_owner(
        &mut self,
        unit: UnitId,
        range: StateRange,
        owner: Option<unitlc_core::OwnerId>,
        on_complete: impl FnOnce(&mut UnitSubsystem, &TransitionOutcome) + 'static,
    ) -> DestinationRequest {
        if range.min() > range.max() {
            tracing::warn!(unit = %unit, range = %range, "destination range is inverted");
            return DestinationRequest::Rejected;
        }
        if !range.has_valid_endpoints() {
            tracing::warn!(unit = %unit, range = %range, "destination endpoints must be destination states");
            return DestinationRequest::Rejected;
        }
        if self.checked_out.contains_key(&unit) {
            tracing::warn!(unit = %unit, range = %range, "unit is updating; destination refused");
            return DestinationRequest::Rejected;
        }
        let handle = self.next_handle();
        let Some(machine) = self.machines.get_mut(&unit) else {
            return DestinationRequest::Rejected;
        };
        let current = machine.current;
        if current == UnitState::Terminal && !range.contains(UnitState::Terminal) {
            tracing::warn!(unit = %unit, range = %range, "unit is terminal; destination refused");
            return DestinationRequest::Rejected;
        }
        if machine.props.unrecoverable && range.is_above(current) {
            tracing::warn!(unit = %unit, range = %range, "unit is unrecoverable; forward destination refused");
            return DestinationRequest::Rejected;
        }

        let registration = Registration {
            handle,
            owner,
            callback: Box::new(on_complete) as TransitionCallback,
        };

        if !machine.is_running() {
            if range.contains(current) {
                let outcome = TransitionOutcome {
                    unit,
                    state: current,
                    result: Ok(()),
                };
                (registration.callback)(self, &outcome);
                return DestinationRequest::CompletedImmediately;
            }
            let target = if range.is_above(current) {
                range.min()
            } else {
                range.max()
            };
            machine.callbacks.push_transition(target, registration);
            machine.props.destination = range;
            tracing::debug!(unit = %unit, range = %range, "destination set");
            self.update_immediate(unit);
            return DestinationRequest::Queued(handle);
        }

        let old = machine.props.destination;
        let Some(narrowed) = old.intersect(&range) else {
            tracing::warn!(unit = %unit, current = %old, requested = %range, "destination does not overlap the running request");
            return DestinationRequest::Rejected;
        };
        machine.props.destination = narrowed;
        if narrowed.contains(current) {
            let outcome = TransitionOutcome {
                unit,
                state: current,
                result: Ok(()),
            };
            (registration.callback)(self, &outcome);
            return DestinationRequest::CompletedImmediately;
        }
        let target = if old.is_above(current) {
            narrowed.min()
        } else {
            narrowed.max()
        };
        machine.callbacks.push_transition(target, registration);
        tracing::debug!(unit = %unit, range = %narrowed, "destination narrowed");
        DestinationRequest::Queued(handle)
    }

    /// Ask a running unit to stop where it can. `on_canceled` runs once the
    /// cancel lands. Returns `false` if the unit is not running.
    pub fn try_cancel(&mut self, unit: UnitId, on_canceled: impl FnOnce(&mut UnitSubsystem, UnitId) + 'static) -> bool {
        self.try_cancel_with_owner(unit, None, on_canceled)
    }

    /// [`Self::try_cancel`] with an owner token for bulk removal.
    pub fn try_cancel_with_owner(
        &mut self,
        unit: UnitId,
        owner: Option<unitlc_core::OwnerId>,
        on_canceled: impl FnOnce(&mut UnitSubsystem, UnitId) + 'static,
    ) -> bool {
        if self.checked_out.contains_key(&unit) {
            tracing::warn!(unit = %unit, "unit is updating; cancel refused");
            return false;
        }
        let handle = self.next_handle();
        let Some(machine) = self.machines.get_mut(&unit) else {
            return false;
        };
        if !machine.is_running() {
            return false;
        }
        machine.props.try_cancel = true;
        machine.callbacks.push_cancel(Registration {
            handle,
            owner,
            callback: Box::new(on_canceled) as CancelCallback,
        });
        metrics::counter!("unitlc_cancellations_total").increment(1);
        tracing::debug!(unit = %unit, state = %machine.current, "cancel requested");

        if let Some(mut machine) = self.check_out(unit) {
            self.run_behavior(&mut machine, |behavior, ctx| behavior.try_cancel(ctx));
            self.check_in(machine);
        }
        self.request_update(unit);
        true
    }

    /// Remove destination callbacks registered on `unit`.
    pub fn remove_pending_transition_callback(&mut self, unit: UnitId, removal: Removal) -> usize {
        if self.checked_out.contains_key(&unit) {
            self.deferred_removals
                .entry(unit)
                .or_default()
                .push(PendingRemoval::Transition(removal));
            return 0;
        }
        self.machines
            .get_mut(&unit)
            .map(|m| m.callbacks.remove_transition(removal))
            .unwrap_or(0)
    }

    /// Remove cancel callbacks registered on `unit`.
    pub fn remove_pending_cancel_callback(&mut self, unit: UnitId, removal: Removal) -> usize {
        if self.checked_out.contains_key(&unit) {
            self.deferred_removals
                .entry(unit)
                .or_default()
                .push(PendingRemoval::Cancel(removal));
            return 0;
        }
        self.machines
            .get_mut(&unit)
            .map(|m| m.callbacks.remove_cancel(removal))
            .unwrap_or(0)
    }

    /// Remove matching callbacks from every broadcast currently running.
    pub fn scrub_broadcasts(&mut self, removal: Removal) -> usize {
        self.broadcasts.scrub_transition(removal) + self.broadcasts.scrub_cancel(removal)
    }

    /// Replace a unit's protocol options through its current behavior.
    pub fn try_update_protocol_options(
        &mut self,
        unit: UnitId,
        options: ProtocolOptions,
    ) -> Result<bool, TransitionError> {
        if let Some(state) = self.checked_out.get(&unit) {
            return Err(TransitionError::new(*state, ErrorKind::Options, "ProtocolOptions.Unit_Busy"));
        }
        let Some(mut machine) = self.check_out(unit) else {
            return Err(TransitionError::new(
                UnitState::Uninitialized,
                ErrorKind::Options,
                "ProtocolOptions.Unknown_Unit",
            ));
        };
        let result = self.run_behavior(&mut machine, |behavior, ctx| {
            behavior.try_update_protocol_options(ctx, &options)
        });
        self.check_in(machine);
        result
    }

    /// Take `unit` out of batching for good and withdraw any parked request.
    pub fn exclude_from_batch_processing(&mut self, unit: UnitId) -> bool {
        let Some(options) = self.options_of(unit).cloned() else {
            return false;
        };
        if options.batch_process {
            let updated = ProtocolOptions {
                batch_process: false,
                ..options
            };
            if let Err(error) = self.try_update_protocol_options(unit, updated) {
                tracing::warn!(unit = %unit, error = %error, "could not exclude unit from batching");
                return false;
            }
        }
        let withdrawn = match self.machines.get_mut(&unit) {
            Some(machine) => match machine.props.batch.handle.take() {
                Some(handle) => self.batches.cancel(machine.current, handle),
                None => false,
            },
            None => false,
        };
        if withdrawn {
            self.request_update(unit);
        }
        true
    }

    // ─── Scheduling ──────────────────────────────────────────────────

    /// Drive `unit` on this tick.
    pub fn request_update(&mut self, unit: UnitId) {
        self.pending_updates.insert(unit);
    }

    /// Drive `unit` on the next tick.
    pub fn defer_update(&mut self, unit: UnitId) {
        self.deferred_updates.insert(unit);
    }

    /// Drive `unit` now. A unit that is already being driven is re-run by
    /// the active drive once its current step returns.
    pub fn update_immediate(&mut self, unit: UnitId) {
        if self.checked_out.contains_key(&unit) {
            self.reruns.insert(unit);
            return;
        }
        let Some(machine) = self.machines.get_mut(&unit) else {
            return;
        };
        if machine.in_update {
            tracing::trace!(unit = %unit, "drive already active; rerun recorded");
            self.reruns.insert(unit);
            return;
        }
        machine.in_update = true;
        self.transitioning.insert(unit);
        self.drive(unit);
    }

    /// Run one scheduling step on the driver thread.
    pub fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary::default();
        for event in self.queue.drain() {
            summary.events += 1;
            match event {
                DriverEvent::Update(unit) => {
                    self.pending_updates.insert(unit);
                }
                DriverEvent::Bundle(event) => self.dispatch_bundle_event(&event),
            }
        }

        for _ in 0..MAX_UPDATE_PASSES {
            if self.pending_updates.is_empty() {
                break;
            }
            for unit in std::mem::take(&mut self.pending_updates) {
                if self.machines.contains_key(&unit) {
                    summary.driven += 1;
                    self.update_immediate(unit);
                }
            }
        }

        summary.batches = self.process_batches();

        let deferred = std::mem::take(&mut self.deferred_updates);
        self.pending_updates.extend(deferred);
        metrics::gauge!("unitlc_running_units").set(self.transitioning.len() as f64);
        summary
    }

    /// Whether a tick would have nothing to do.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.pending_updates.is_empty()
            && self.deferred_updates.is_empty()
            && self.batches.is_empty()
    }

    /// Tick until idle or `max_ticks` ran. Returns the ticks run.
    pub fn run_until_idle(&mut self, max_ticks: usize) -> usize {
        for ran in 0..max_ticks {
            if self.is_idle() {
                return ran;
            }
            self.tick();
        }
        max_ticks
    }

    fn dispatch_bundle_event(&mut self, event: &BundleEvent) {
        let units: Vec<UnitId> = self.machines.keys().copied().collect();
        for unit in units {
            let Some(mut machine) = self.check_out(unit) else {
                continue;
            };
            let wake = self.run_behavior(&mut machine, |behavior, ctx| behavior.on_bundle_event(ctx, event));
            self.check_in(machine);
            if wake {
                self.pending_updates.insert(unit);
            }
        }
    }

    fn process_batches(&mut self) -> usize {
        let mut processed = 0;
        for (state, requests) in self.batches.take_all() {
            let mut items = Vec::new();
            let mut processor = None;
            for (handle, unit) in requests {
                let Some(machine) = self.machines.get(&unit) else {
                    continue;
                };
                if machine.current != state || machine.props.batch.handle != Some(handle) {
                    continue;
                }
                if processor.is_none() {
                    processor = machine.behaviors.get(state).batch_processor();
                }
                items.push(BatchItem {
                    unit,
                    name: machine.props.name.clone(),
                });
            }
            if items.is_empty() {
                continue;
            }
            if let Some(processor) = processor {
                processor(&self.services, &items);
            }
            for item in &items {
                if let Some(machine) = self.machines.get_mut(&item.unit) {
                    machine.props.batch.handle = None;
                    machine.props.batch.was_processed = true;
                }
            }
            tracing::debug!(state = %state, units = items.len(), "batch processed");
            metrics::counter!("unitlc_batches_total", "state" => state.name()).increment(1);
            processed += 1;
            for item in items {
                self.update_immediate(item.unit);
            }
        }
        processed
    }

    // ─── Drive loop ──────────────────────────────────────────────────

    fn drive(&mut self, unit: UnitId) {
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            if iterations > MAX_TRANSITIONS {
                panic!("{unit} exceeded {MAX_TRANSITIONS} drive iterations without settling");
            }
            self.reruns.remove(&unit);

            let Some(mut machine) = self.check_out(unit) else {
                return;
            };
            let from = machine.current;
            let step = self.run_behavior(&mut machine, |behavior, ctx| behavior.update_state(ctx));

            let (to, result, suppress_log) = match step {
                StateStep::Hold => {
                    self.check_in(machine);
                    if self.reruns.remove(&unit) {
                        continue;
                    }
                    self.release_latch(unit);
                    return;
                }
                StateStep::Advance(to) => (to, Ok(()), false),
                StateStep::Fail {
                    to,
                    error,
                    suppress_log,
                } => (to, Err(error), suppress_log),
            };
            if to == from {
                panic!("{unit} attempted to transition from {from} to itself");
            }

            tracing::debug!(unit = %unit, from = %from, to = %to, "unit state transition");
            metrics::counter!("unitlc_transitions_total", "from" => from.name(), "to" => to.name())
                .increment(1);

            self.run_behavior(&mut machine, |behavior, ctx| behavior.end_state(ctx));
            self.cancel_batch_request(&mut machine.props, from);
            machine.current = to;
            self.checked_out.insert(unit, to);
            if self.config.can_batch_process(&machine.props.options)
                && machine.behaviors.get(to).can_batch_process(&machine.props, &self.config)
            {
                machine.props.batch.handle = Some(self.batches.add_request(to, unit));
            }
            self.run_behavior(&mut machine, |behavior, ctx| behavior.begin_state(ctx));
            if to == UnitState::Terminal {
                self.unregister_url(&machine.props);
            }

            self.apply_deferred_removals(&mut machine);
            let mut keep_going = false;
            let finish = if machine.props.try_cancel && !to.is_transition() {
                machine.props.destination = StateRange::single(to);
                machine.props.try_cancel = false;
                Finish::Canceled {
                    lists: machine.callbacks.take_all_states(),
                    cancels: machine.callbacks.take_cancel(),
                }
            } else {
                match result {
                    Err(error) => {
                        if !to.is_valid_error_state() {
                            panic!("{unit} failed from {from} into {to}, which is not an error state");
                        }
                        machine.props.destination = StateRange::single(to);
                        Finish::Failed {
                            lists: machine.callbacks.take_all_states(),
                            error,
                        }
                    }
                    Ok(()) => {
                        keep_going = to.is_transition() || !machine.props.destination.contains(to);
                        Finish::Reached {
                            lists: machine.callbacks.take_state(to),
                        }
                    }
                }
            };
            let destination = machine.props.destination;
            if !keep_going {
                machine.in_update = false;
            }
            self.check_in(machine);
            if !keep_going {
                self.transitioning.remove(&unit);
            }

            match finish {
                Finish::Canceled { lists, cancels } => {
                    tracing::info!(unit = %unit, state = %to, "unit transition canceled");
                    let outcome = TransitionOutcome {
                        unit,
                        state: to,
                        result: Err(TransitionError::canceled()),
                    };
                    self.broadcast_transition(lists, outcome);
                    self.broadcast_cancel(cancels, unit);
                }
                Finish::Failed { lists, error } => {
                    metrics::counter!("unitlc_transition_failures_total", "state" => to.name()).increment(1);
                    if suppress_log {
                        tracing::info!(unit = %unit, state = %to, error = %error, "unit transition failed");
                    } else {
                        tracing::error!(unit = %unit, state = %to, error = %error, "unit transition failed");
                    }
                    let outcome = TransitionOutcome {
                        unit,
                        state: to,
                        result: Err(error),
                    };
                    self.broadcast_transition(lists, outcome);
                }
                Finish::Reached { lists } => {
                    if !keep_going && destination.contains(to) {
                        tracing::info!(unit = %unit, state = %to, "unit reached destination");
                    }
                    let outcome = TransitionOutcome {
                        unit,
                        state: to,
                        result: Ok(()),
                    };
                    self.broadcast_transition(lists, outcome);
                }
            }

            if to == UnitState::Terminal {
                self.destroy(unit);
                return;
            }
            if !keep_going {
                return;
            }
        }
    }

    fn release_latch(&mut self, unit: UnitId) {
        if let Some(machine) = self.machines.get_mut(&unit) {
            machine.in_update = false;
            if !machine.is_running() {
                self.transitioning.remove(&unit);
            }
        }
    }

    fn cancel_batch_request(&mut self, props: &mut UnitProperties, state: UnitState) {
        props.batch.was_processed = false;
        if let Some(handle) = props.batch.handle.take() {
            self.batches.cancel(state, handle);
        }
    }

    fn unregister_url(&mut self, props: &UnitProperties) {
        let key = props.identifier.identifying_str();
        if self.by_url.get(key) == Some(&props.unit) {
            self.by_url.remove(key);
        }
    }

    fn destroy(&mut self, unit: UnitId) {
        let Some(mut machine) = self.machines.remove(&unit) else {
            return;
        };
        self.pending_updates.remove(&unit);
        self.deferred_updates.remove(&unit);
        self.reruns.remove(&unit);
        self.transitioning.remove(&unit);
        self.deferred_removals.remove(&unit);
        if let Some(handle) = machine.props.batch.handle.take() {
            self.batches.cancel(machine.current, handle);
        }
        tracing::debug!(unit = %unit, "unit destroyed");

        let leftover = machine.callbacks.take_all_states();
        if !leftover.is_empty() {
            let outcome = TransitionOutcome {
                unit,
                state: UnitState::Terminal,
                result: Err(TransitionError::new(
                    UnitState::Terminal,
                    ErrorKind::Canceled,
                    "Destroyed_Before_Finish",
                )),
            };
            self.broadcast_transition(leftover, outcome);
        }
        let cancels = machine.callbacks.take_cancel();
        self.broadcast_cancel(cancels, unit);
    }

    // ─── Broadcasts ──────────────────────────────────────────────────

    fn broadcast_transition(&mut self, registrations: Vec<Registration<TransitionCallback>>, outcome: TransitionOutcome) {
        if registrations.is_empty() {
            return;
        }
        let depth = self.broadcasts.push_transition(registrations, outcome);
        while let Some((callback, outcome)) = self.broadcasts.next_transition(depth) {
            callback(self, &outcome);
        }
        self.broadcasts.pop(depth);
    }

    fn broadcast_cancel(&mut self, registrations: Vec<Registration<CancelCallback>>, unit: UnitId) {
        if registrations.is_empty() {
            return;
        }
        let depth = self.broadcasts.push_cancel(registrations, unit);
        while let Some((callback, unit)) = self.broadcasts.next_cancel(depth) {
            callback(self, unit);
        }
        self.broadcasts.pop(depth);
    }

    // ─── Check-out ───────────────────────────────────────────────────

    pub(crate) fn check_out(&mut self, unit: UnitId) -> Option<UnitStateMachine> {
        let machine = self.machines.remove(&unit)?;
        self.checked_out.insert(unit, machine.current);
        Some(machine)
    }

    pub(crate) fn check_in(&mut self, mut machine: UnitStateMachine) {
        let unit = machine.props.unit;
        self.checked_out.remove(&unit);
        self.apply_deferred_removals(&mut machine);
        self.machines.insert(unit, machine);
    }

    fn apply_deferred_removals(&mut self, machine: &mut UnitStateMachine) {
        let Some(removals) = self.deferred_removals.remove(&machine.props.unit) else {
            return;
        };
        for removal in removals {
            match removal {
                PendingRemoval::Transition(removal) => {
                    machine.callbacks.remove_transition(removal);
                }
                PendingRemoval::Cancel(removal) => {
                    machine.callbacks.remove_cancel(removal);
                }
            }
        }
    }

    pub(crate) fn run_behavior<R>(
        &mut self,
        machine: &mut UnitStateMachine,
        f: impl FnOnce(&mut dyn StateBehavior, &mut StateContext<'_>) -> R,
    ) -> R {
        let state = machine.current;
        let UnitStateMachine {
            props, behaviors, ..
        } = machine;
        let mut ctx = StateContext {
            unit: props.unit,
            state,
            props,
            subsystem: self,
        };
        f(behaviors.get_mut(state), &mut ctx)
    }

    fn next_handle(&mut self) -> CallbackHandle {
        self.next_callback += 1;
        CallbackHandle(self.next_callback)
    }
}

impl std::fmt::Debug for UnitSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitSubsystem")
            .field("config", &self.config)
            .field("units", &self.machines.len())
            .field("checked_out", &self.checked_out)
            .field("transitioning", &self.transitioning)
            .field("broadcast_depth", &self.broadcasts.depth())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::sim::SimHost;
    use crate::states::behavior_for;

    const A: &str = "file:/units/A/A.unit";

    fn subsystem() -> (UnitSubsystem, SimHost) {
        let host = SimHost::default();
        (UnitSubsystem::new(LifecycleConfig::default(), host.services()), host)
    }

    fn record() -> (Rc<RefCell<Vec<TransitionOutcome>>>, impl FnOnce(&mut UnitSubsystem, &TransitionOutcome)) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |_: &mut UnitSubsystem, outcome: &TransitionOutcome| {
            sink.borrow_mut().push(outcome.clone())
        })
    }

    struct Advance(UnitState);

    impl StateBehavior for Advance {
        fn update_state(&mut self, _ctx: &mut StateContext<'_>) -> StateStep {
            StateStep::Advance(self.0)
        }
    }

    struct FailInto(UnitState);

    impl StateBehavior for FailInto {
        fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
            StateStep::fail(self.0, ctx.error(ErrorKind::Installer, "Broken"))
        }
    }

    fn ping_pong() -> BehaviorTable {
        BehaviorTable::from_fn(|state| match state {
            UnitState::CheckingStatus => Box::new(Advance(UnitState::Downloading)),
            UnitState::Downloading => Box::new(Advance(UnitState::CheckingStatus)),
            other => behavior_for(other),
        })
    }

    fn self_loop() -> BehaviorTable {
        BehaviorTable::from_fn(|state| match state {
            UnitState::CheckingStatus => Box::new(Advance(UnitState::CheckingStatus)),
            other => behavior_for(other),
        })
    }

    fn fail_outside_error_state() -> BehaviorTable {
        BehaviorTable::from_fn(|state| match state {
            UnitState::CheckingStatus => Box::new(FailInto(UnitState::Installed)),
            other => behavior_for(other),
        })
    }

    #[test]
    fn destination_already_reached_completes_synchronously() {
        let (mut sub, host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        let (seen, callback) = record();

        let answer = sub.set_destination(unit, StateRange::single(UnitState::UnknownStatus), callback);
        assert_eq!(answer, DestinationRequest::CompletedImmediately);
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].result.is_ok());
        assert!(host.installer.calls().is_empty());
        assert!(sub.is_idle());
    }

    #[test]
    fn file_unit_reaches_active_in_one_drive() {
        let (mut sub, host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        let (seen, callback) = record();

        let answer = sub.set_destination(unit, StateRange::single(UnitState::Active), callback);
        assert!(answer.handle().is_some());
        assert_eq!(sub.state_of(unit), Some(UnitState::Active));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].state, UnitState::Active);
        assert!(host.mounter.is_mounted("A"));
        assert!(!sub.has_running_units());
    }

    #[test]
    fn repeated_request_in_range_delivers_once_each() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        sub.set_destination(unit, StateRange::single(UnitState::Installed), |_, _| {});
        assert_eq!(sub.state_of(unit), Some(UnitState::Installed));

        let (seen, first) = record();
        let (seen_again, second) = record();
        let range = StateRange::single(UnitState::Installed);
        assert_eq!(sub.set_destination(unit, range, first), DestinationRequest::CompletedImmediately);
        assert_eq!(sub.set_destination(unit, range, second), DestinationRequest::CompletedImmediately);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen_again.borrow().len(), 1);
    }

    #[test]
    fn invalid_endpoints_are_rejected() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        let range = StateRange::single(UnitState::Mounting);
        assert_eq!(sub.set_destination(unit, range, |_, _| {}), DestinationRequest::Rejected);
    }

    #[test]
    fn decoded_destinations_keep_their_bounds_ordered() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        assert!(serde_json::from_str::<StateRange>(r#"{"min":"Active","max":"Registered"}"#).is_err());

        let range: StateRange = serde_json::from_str(r#"{"min":"Registered","max":"Active"}"#).unwrap();
        let (seen, callback) = record();
        assert!(sub.set_destination(unit, range, callback).accepted());
        assert_eq!(sub.state_of(unit), Some(UnitState::Registered));
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].result.is_ok());
    }

    #[test]
    fn unrecoverable_unit_refuses_forward_progress_only() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        sub.set_destination(unit, StateRange::single(UnitState::Installed), |_, _| {});
        if let Some(machine) = sub.machines.get_mut(&unit) {
            machine.props.unrecoverable = true;
        }

        let up = StateRange::single(UnitState::Active);
        assert_eq!(sub.set_destination(unit, up, |_, _| {}), DestinationRequest::Rejected);
        let down = StateRange::single(UnitState::StatusKnown);
        assert!(sub.set_destination(unit, down, |_, _| {}).accepted());
        assert_eq!(sub.state_of(unit), Some(UnitState::StatusKnown));
    }

    #[test]
    fn terminal_unit_is_replaced_on_next_lookup() {
        let (mut sub, host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        sub.set_destination(unit, StateRange::single(UnitState::Active), |_, _| {});

        let (seen, callback) = record();
        sub.set_destination(unit, StateRange::single(UnitState::Terminal), callback);
        // Unregistering yields one tick.
        assert!(seen.borrow().is_empty());
        sub.run_until_idle(10);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].state, UnitState::Terminal);
        assert_eq!(sub.state_of(unit), None);
        assert!(sub.find(A).is_none());
        assert!(!host.mounter.is_mounted("A"));

        let replacement = sub.find_or_create(A, None).unwrap();
        assert_ne!(replacement, unit);
        assert_eq!(sub.state_of(replacement), Some(UnitState::UnknownStatus));
    }

    #[test]
    fn find_ignores_url_options() {
        let (mut sub, _host) = subsystem();
        let unit = sub
            .find_or_create("installbundle:/dlc/B.unit?Bundles=B", None)
            .unwrap();
        assert_eq!(sub.find("installbundle:/dlc/B.unit?Bundles=B,C"), Some(unit));
        assert!(sub.find("not-a-url").is_none());
    }

    #[test]
    fn mismatched_options_are_refused() {
        let (mut sub, _host) = subsystem();
        let options = ProtocolOptions::for_protocol(unitlc_core::Protocol::InstallBundle);
        assert!(sub.find_or_create(A, Some(options)).is_err());
    }

    #[test]
    fn cancel_of_idle_unit_is_refused() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        assert!(!sub.try_cancel(unit, |_, _| {}));
    }

    #[test]
    fn deferred_update_waits_one_tick() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        sub.defer_update(unit);
        assert!(!sub.is_idle());
        assert_eq!(sub.tick().driven, 0);
        assert_eq!(sub.tick().driven, 1);
        assert!(sub.is_idle());
    }

    #[test]
    fn builtin_flag_round_trips() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        assert!(!sub.was_loaded_as_builtin(unit));
        sub.mark_loaded_as_builtin(unit);
        assert!(sub.was_loaded_as_builtin(unit));
    }

    #[test]
    fn status_known_covers_unavailable_and_uninstall_states() {
        let (mut sub, host) = subsystem();
        host.mounter.mark_descriptor_missing("/units/A/A.unit");
        let unit = sub.find_or_create(A, None).unwrap();
        let (seen, callback) = record();
        sub.set_destination(unit, StateRange::single(UnitState::Installed), callback);

        assert_eq!(sub.state_of(unit), Some(UnitState::ErrorUnavailable));
        assert_eq!(seen.borrow()[0].result.as_ref().unwrap_err().short_code(), "Unit_Unavailable");
        assert!(sub.is_status_known(unit));
        assert!(!sub.is_available(unit));
    }

    #[test]
    fn snapshot_reports_state_and_destination() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        sub.set_destination(unit, StateRange::single(UnitState::Registered), |_, _| {});
        let snapshot = sub.snapshot(unit).unwrap();
        assert_eq!(snapshot.name, "A");
        assert_eq!(snapshot.state, UnitState::Registered);
        assert_eq!(snapshot.destination, StateRange::single(UnitState::Registered));
        assert_eq!(snapshot.pending_callbacks, 0);
    }

    #[test]
    #[should_panic(expected = "drive iterations")]
    fn endless_advances_hit_the_iteration_cap() {
        let host = SimHost::default();
        let mut sub = UnitSubsystem::with_behaviors(LifecycleConfig::default(), host.services(), ping_pong);
        let unit = sub.find_or_create(A, None).unwrap();
        sub.set_destination(unit, StateRange::single(UnitState::Active), |_, _| {});
    }

    #[test]
    #[should_panic(expected = "to itself")]
    fn self_transition_is_fatal() {
        let host = SimHost::default();
        let mut sub = UnitSubsystem::with_behaviors(LifecycleConfig::default(), host.services(), self_loop);
        let unit = sub.find_or_create(A, None).unwrap();
        sub.set_destination(unit, StateRange::single(UnitState::Active), |_, _| {});
    }

    #[test]
    #[should_panic(expected = "not an error state")]
    fn failure_outside_an_error_state_is_fatal() {
        let host = SimHost::default();
        let mut sub =
            UnitSubsystem::with_behaviors(LifecycleConfig::default(), host.services(), fail_outside_error_state);
        let unit = sub.find_or_create(A, None).unwrap();
        sub.set_destination(unit, StateRange::single(UnitState::Active), |_, _| {});
    }

    #[test]
    #[should_panic(expected = "entered Terminal more than once")]
    fn terminal_reentry_is_fatal() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        let mut machine = sub.check_out(unit).unwrap();
        machine.current = UnitState::Terminal;
        sub.run_behavior(&mut machine, |behavior, ctx| behavior.begin_state(ctx));
        sub.run_behavior(&mut machine, |behavior, ctx| behavior.begin_state(ctx));
    }

    #[test]
    #[should_panic(expected = "updated while uninitialized")]
    fn updating_uninitialized_is_fatal() {
        let (mut sub, _host) = subsystem();
        let unit = sub.find_or_create(A, None).unwrap();
        let mut machine = sub.check_out(unit).unwrap();
        machine.current = UnitState::Uninitialized;
        sub.run_behavior(&mut machine, |behavior, ctx| behavior.update_state(ctx));
    }
}
