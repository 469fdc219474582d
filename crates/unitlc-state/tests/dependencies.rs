//! # Dependency Tests
//!
//! Units that depend on other units: dependencies are created and brought
//! up before the dependent registers, activated before it activates, and
//! taken down when it deactivates. Also covers failure propagation, cycles,
//! replacement of destroyed dependencies (including one destroyed while a
//! dependent waits on it), and the cancel-and-retry path.

use std::cell::RefCell;
use std::rc::Rc;

use unitlc_core::{LifecycleConfig, StateRange, UnitId, UnitState};
use unitlc_state::sim::{CompletionMode, SimHost};
use unitlc_state::states::behavior_for;
use unitlc_state::{BehaviorTable, StateBehavior, StateContext, StateStep, TransitionOutcome, UnitSubsystem};

const A: &str = "file:/units/A/A.unit";
const B: &str = "file:/units/B/B.unit";
const C: &str = "file:/units/C/C.unit";

fn setup(config: LifecycleConfig) -> (UnitSubsystem, SimHost) {
    let host = SimHost::new(CompletionMode::Immediate);
    let sub = UnitSubsystem::new(config, host.services());
    (sub, host)
}

fn request(
    sub: &mut UnitSubsystem,
    unit: UnitId,
    state: UnitState,
) -> Rc<RefCell<Vec<TransitionOutcome>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    sub.set_destination(unit, StateRange::single(state), move |_, outcome| {
        sink.borrow_mut().push(outcome.clone())
    });
    seen
}

fn short_code(seen: &Rc<RefCell<Vec<TransitionOutcome>>>) -> String {
    let outcomes = seen.borrow();
    let error = outcomes[0].result.as_ref().unwrap_err();
    error.short_code().to_string()
}

#[test]
fn dependency_is_created_and_activated_first() {
    let (mut sub, host) = setup(LifecycleConfig::default());
    host.resolver.add(A, B);
    let a = sub.find_or_create(A, None).unwrap();
    assert_eq!(sub.find(B), None);

    let seen = request(&mut sub, a, UnitState::Active);
    let b = sub.find(B).expect("dependency created");
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
    assert_eq!(sub.state_of(b), Some(UnitState::Active));
    assert!(seen.borrow()[0].result.is_ok());
    assert!(!sub.has_running_units());
}

#[test]
fn registered_dependency_is_pulled_up_to_active() {
    let (mut sub, host) = setup(LifecycleConfig::default());
    host.resolver.add(A, B);
    let b = sub.find_or_create(B, None).unwrap();
    request(&mut sub, b, UnitState::Registered);
    assert_eq!(sub.state_of(b), Some(UnitState::Registered));

    let a = sub.find_or_create(A, None).unwrap();
    request(&mut sub, a, UnitState::Active);
    assert_eq!(sub.state_of(b), Some(UnitState::Active));
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
}

#[test]
fn dependency_query_failure_fails_waiting() {
    let (mut sub, host) = setup(LifecycleConfig::default());
    host.resolver.fail_query(A);
    let a = sub.find_or_create(A, None).unwrap();
    let seen = request(&mut sub, a, UnitState::Active);

    assert_eq!(sub.state_of(a), Some(UnitState::ErrorWaitingForDependencies));
    assert_eq!(short_code(&seen), "Failed_Dependency_Query");
    assert!(!sub.is_unrecoverable(a));
}

#[test]
fn dependency_lookup_of_bad_url_fails_waiting() {
    let (mut sub, host) = setup(LifecycleConfig::default());
    host.resolver.add(A, "ftp:/units/B/B.unit");
    let a = sub.find_or_create(A, None).unwrap();
    let seen = request(&mut sub, a, UnitState::Active);
    assert_eq!(short_code(&seen), "Failed_Dependency_Query");
}

#[test]
fn unrecoverable_dependency_propagates() {
    let (mut sub, host) = setup(LifecycleConfig::default());
    host.resolver.add(A, B);
    host.resolver.add(C, B);
    host.loader.mark_missing("/B/B");

    let a = sub.find_or_create(A, None).unwrap();
    let seen = request(&mut sub, a, UnitState::Active);
    let b = sub.find(B).unwrap();
    assert_eq!(sub.state_of(b), Some(UnitState::ErrorRegistering));
    assert!(sub.is_unrecoverable(b));
    assert_eq!(sub.state_of(a), Some(UnitState::ErrorWaitingForDependencies));
    assert_eq!(short_code(&seen), "Failed_Dependency_Transition");
    assert!(sub.is_unrecoverable(a));

    // A later dependent sees the stuck dependency during its query.
    let c = sub.find_or_create(C, None).unwrap();
    request(&mut sub, c, UnitState::Active);
    assert_eq!(sub.state_of(c), Some(UnitState::ErrorWaitingForDependencies));
    assert!(sub.is_unrecoverable(c));
}

#[test]
fn dependency_cycle_fails_both_units() {
    let (mut sub, host) = setup(LifecycleConfig::default());
    host.resolver.add(A, B);
    host.resolver.add(B, A);
    let a = sub.find_or_create(A, None).unwrap();
    let seen = request(&mut sub, a, UnitState::Active);
    let b = sub.find(B).unwrap();

    assert_eq!(sub.state_of(a), Some(UnitState::ErrorWaitingForDependencies));
    assert_eq!(sub.state_of(b), Some(UnitState::ErrorWaitingForDependencies));
    assert_eq!(short_code(&seen), "Failed_Dependency_Transition");
    assert!(!sub.is_unrecoverable(a));
    assert!(!sub.has_running_units());
}

fn both_active(config: LifecycleConfig) -> (UnitSubsystem, SimHost, UnitId, UnitId) {
    let (mut sub, host) = setup(config);
    host.resolver.add(A, B);
    let a = sub.find_or_create(A, None).unwrap();
    request(&mut sub, a, UnitState::Active);
    let b = sub.find(B).unwrap();
    assert_eq!(sub.state_of(b), Some(UnitState::Active));
    (sub, host, a, b)
}

#[test]
fn deactivation_does_not_wait_by_default() {
    let (mut sub, host, a, b) = both_active(LifecycleConfig::default());
    host.hooks.hold_deactivating("B");

    request(&mut sub, a, UnitState::Loaded);
    sub.run_until_idle(10);
    assert_eq!(sub.state_of(a), Some(UnitState::Loaded));
    assert_eq!(sub.state_of(b), Some(UnitState::Deactivating));

    host.hooks.release_pausers();
    sub.run_until_idle(10);
    assert_eq!(sub.state_of(b), Some(UnitState::Loaded));
}

#[test]
fn deactivation_waits_when_configured() {
    let config = LifecycleConfig {
        wait_for_dependency_deactivation: true,
        ..LifecycleConfig::default()
    };
    let (mut sub, host, a, b) = both_active(config);
    host.hooks.hold_deactivating("B");

    request(&mut sub, a, UnitState::Loaded);
    sub.run_until_idle(10);
    assert_eq!(sub.state_of(a), Some(UnitState::DeactivatingDependencies));
    assert_eq!(sub.state_of(b), Some(UnitState::Deactivating));

    host.hooks.release_pausers();
    sub.run_until_idle(10);
    assert_eq!(sub.state_of(b), Some(UnitState::Loaded));
    assert_eq!(sub.state_of(a), Some(UnitState::Loaded));
}

#[test]
fn destroyed_dependency_is_recreated_on_next_visit() {
    let (mut sub, _host, a, b) = both_active(LifecycleConfig::default());

    request(&mut sub, b, UnitState::Terminal);
    sub.run_until_idle(10);
    assert_eq!(sub.state_of(b), None);
    assert_eq!(sub.find(B), None);
    assert_eq!(sub.state_of(a), Some(UnitState::Active));

    request(&mut sub, a, UnitState::Installed);
    sub.run_until_idle(10);
    assert_eq!(sub.state_of(a), Some(UnitState::Installed));

    request(&mut sub, a, UnitState::Active);
    let replacement = sub.find(B).expect("dependency recreated");
    assert_ne!(replacement, b);
    assert_eq!(sub.state_of(replacement), Some(UnitState::Active));
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
}

#[test]
fn conflicting_dependency_is_canceled_and_retried() {
    let (mut sub, host) = setup(LifecycleConfig::default());
    let b = sub.find_or_create(B, None).unwrap();
    request(&mut sub, b, UnitState::Active);

    // Unregistering holds for a tick, leaving B mid-way to Terminal.
    let teardown = request(&mut sub, b, UnitState::Terminal);
    assert_eq!(sub.state_of(b), Some(UnitState::Unregistering));

    host.resolver.add(A, B);
    let a = sub.find_or_create(A, None).unwrap();
    let seen = request(&mut sub, a, UnitState::Active);
    assert_eq!(sub.state_of(a), Some(UnitState::WaitingForDependencies));

    sub.run_until_idle(10);
    assert!(teardown.borrow()[0].result.as_ref().unwrap_err().is_canceled());
    assert_eq!(sub.find(B), Some(b));
    assert_eq!(sub.state_of(b), Some(UnitState::Active));
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
    assert!(seen.borrow()[0].result.is_ok());
}

/// Unmounting that tears the unit down completely instead of stopping at
/// Installed.
struct UnmountToTerminal(Box<dyn StateBehavior>);

impl StateBehavior for UnmountToTerminal {
    fn begin_state(&mut self, ctx: &mut StateContext<'_>) {
        self.0.begin_state(ctx)
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        match self.0.update_state(ctx) {
            StateStep::Advance(UnitState::Installed) => StateStep::Advance(UnitState::Terminal),
            step => step,
        }
    }

    fn end_state(&mut self, ctx: &mut StateContext<'_>) {
        self.0.end_state(ctx)
    }

    fn try_cancel(&mut self, ctx: &mut StateContext<'_>) {
        self.0.try_cancel(ctx)
    }
}

fn unmount_destroys() -> BehaviorTable {
    BehaviorTable::from_fn(|state| match state {
        UnitState::Unmounting => Box::new(UnmountToTerminal(behavior_for(state))),
        other => behavior_for(other),
    })
}

#[test]
fn dependency_destroyed_by_cancel_is_replaced_for_the_waiter() {
    let host = SimHost::new(CompletionMode::Immediate);
    let mut sub = UnitSubsystem::with_behaviors(LifecycleConfig::default(), host.services(), unmount_destroys);
    let b = sub.find_or_create(B, None).unwrap();
    request(&mut sub, b, UnitState::Active);

    // Unregistering holds for a tick; the cancel then lands in Terminal.
    let teardown = request(&mut sub, b, UnitState::Terminal);
    assert_eq!(sub.state_of(b), Some(UnitState::Unregistering));

    host.resolver.add(A, B);
    let a = sub.find_or_create(A, None).unwrap();
    let seen = request(&mut sub, a, UnitState::Registered);
    assert_eq!(sub.state_of(a), Some(UnitState::WaitingForDependencies));

    sub.run_until_idle(10);
    assert_eq!(sub.state_of(b), None);
    assert_eq!(teardown.borrow().len(), 1);
    assert!(teardown.borrow()[0].result.as_ref().unwrap_err().is_canceled());

    let replacement = sub.find(B).expect("dependency recreated");
    assert_ne!(replacement, b);
    assert_eq!(sub.state_of(replacement), Some(UnitState::Registered));
    assert_eq!(sub.state_of(a), Some(UnitState::Registered));
    assert_eq!(seen.borrow().len(), 1);
    assert!(seen.borrow()[0].result.is_ok());
    assert!(!sub.has_running_units());
}

#[test]
fn activation_skips_dependencies_that_are_gone() {
    let (mut sub, _host, a, b) = both_active(LifecycleConfig::default());
    request(&mut sub, a, UnitState::Loaded);
    sub.run_until_idle(10);

    request(&mut sub, b, UnitState::Terminal);
    sub.run_until_idle(10);
    assert_eq!(sub.find(B), None);

    request(&mut sub, a, UnitState::Active);
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
    assert_eq!(sub.find(B), None);
}
