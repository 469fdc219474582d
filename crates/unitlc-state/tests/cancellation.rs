//! # Cancellation and Destination Change Tests
//!
//! Cancels land on the first state that is not a Transition state, deliver
//! the cancellation result to every pending destination callback exactly
//! once, and then run the cancel callbacks. Destination changes on a running
//! unit narrow the running request or are refused.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use unitlc_core::{BundleId, ErrorKind, LifecycleConfig, StateRange, UnitId, UnitState};
use unitlc_state::sim::{CompletionMode, InstallerCall, SimBundle, SimHost};
use unitlc_state::{DestinationRequest, Removal, TransitionOutcome, UnitSubsystem};

const FILE_UNIT: &str = "file:/units/Weather/Weather.unit";
const MAPS: &str = "installbundle:/dlc/Maps/Maps.unit?Bundles=Maps";

type Seen = Rc<RefCell<Vec<TransitionOutcome>>>;

fn setup(mode: CompletionMode) -> (UnitSubsystem, SimHost) {
    let host = SimHost::new(mode);
    host.installer.add_bundle(BundleId::from("Maps"), SimBundle::default());
    let sub = UnitSubsystem::new(LifecycleConfig::default(), host.services());
    (sub, host)
}

fn request_range(sub: &mut UnitSubsystem, unit: UnitId, range: StateRange) -> (Seen, DestinationRequest) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let answer = sub.set_destination(unit, range, move |_, outcome| sink.borrow_mut().push(outcome.clone()));
    (seen, answer)
}

fn request(sub: &mut UnitSubsystem, unit: UnitId, state: UnitState) -> Seen {
    request_range(sub, unit, StateRange::single(state)).0
}

fn cancel(sub: &mut UnitSubsystem, unit: UnitId) -> (Rc<Cell<usize>>, bool) {
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let accepted = sub.try_cancel(unit, move |_, canceled| {
        assert_eq!(canceled, unit);
        counter.set(counter.get() + 1);
    });
    (calls, accepted)
}

#[test]
fn canceled_download_lands_in_error_managing_data() {
    let (mut sub, host) = setup(CompletionMode::Manual);
    let unit = sub.find_or_create(MAPS, None).unwrap();
    let seen = request(&mut sub, unit, UnitState::Active);
    assert_eq!(sub.state_of(unit), Some(UnitState::Downloading));
    assert_eq!(host.installer.pending_ops(), 1);

    let (cancels, accepted) = cancel(&mut sub, unit);
    assert!(accepted);
    assert!(host
        .installer
        .calls()
        .contains(&InstallerCall::CancelInstall(vec![BundleId::from("Maps")])));
    assert_eq!(host.installer.pending_ops(), 0);
    assert_eq!(cancels.get(), 0);

    sub.run_until_idle(10);
    assert_eq!(sub.state_of(unit), Some(UnitState::ErrorManagingData));
    assert_eq!(sub.destination_of(unit), Some(StateRange::single(UnitState::ErrorManagingData)));
    assert_eq!(seen.borrow().len(), 1);
    let outcome = seen.borrow()[0].clone();
    assert_eq!(outcome.state, UnitState::ErrorManagingData);
    assert!(outcome.result.unwrap_err().is_canceled());
    assert_eq!(cancels.get(), 1);
    assert!(!sub.has_running_units());
}

#[test]
fn canceled_unit_accepts_new_requests() {
    let (mut sub, host) = setup(CompletionMode::Manual);
    let unit = sub.find_or_create(MAPS, None).unwrap();
    request(&mut sub, unit, UnitState::Installed);
    cancel(&mut sub, unit);
    sub.run_until_idle(10);
    assert_eq!(sub.state_of(unit), Some(UnitState::ErrorManagingData));

    host.installer.set_mode(CompletionMode::Immediate);
    let seen = request(&mut sub, unit, UnitState::Installed);
    sub.run_until_idle(10);
    assert_eq!(sub.state_of(unit), Some(UnitState::Installed));
    assert!(seen.borrow()[0].result.is_ok());
}

#[test]
fn canceled_feature_data_load_lands_in_error_registering() {
    let (mut sub, host) = setup(CompletionMode::Manual);
    let unit = sub.find_or_create(FILE_UNIT, None).unwrap();
    let seen = request(&mut sub, unit, UnitState::Active);
    assert_eq!(sub.state_of(unit), Some(UnitState::Registering));
    assert_eq!(host.loader.outstanding(), 1);

    let (cancels, accepted) = cancel(&mut sub, unit);
    assert!(accepted);
    assert_eq!(host.loader.outstanding(), 0);

    sub.run_until_idle(10);
    assert_eq!(sub.state_of(unit), Some(UnitState::ErrorRegistering));
    assert!(seen.borrow()[0].result.as_ref().unwrap_err().is_canceled());
    assert_eq!(cancels.get(), 1);
    assert!(!sub.is_unrecoverable(unit));
}

#[test]
fn cancel_rides_through_transition_states() {
    let (mut sub, host) = setup(CompletionMode::Immediate);
    host.hooks.hold_post_mount("Weather");
    let unit = sub.find_or_create(FILE_UNIT, None).unwrap();
    let seen = request(&mut sub, unit, UnitState::Active);
    assert_eq!(sub.state_of(unit), Some(UnitState::Mounting));

    let (cancels, _) = cancel(&mut sub, unit);
    sub.run_until_idle(5);
    assert_eq!(sub.state_of(unit), Some(UnitState::Mounting));
    assert_eq!(cancels.get(), 0);

    host.hooks.release_pausers();
    sub.run_until_idle(5);
    assert_eq!(sub.state_of(unit), Some(UnitState::Registered));
    assert_eq!(sub.destination_of(unit), Some(StateRange::single(UnitState::Registered)));
    let outcome = seen.borrow()[0].clone();
    assert_eq!(outcome.state, UnitState::Registered);
    assert_eq!(outcome.result.unwrap_err().kind, ErrorKind::Canceled);
    assert_eq!(cancels.get(), 1);
}

#[test]
fn running_destination_is_narrowed_or_refused() {
    let (mut sub, host) = setup(CompletionMode::Immediate);
    host.hooks.hold_post_mount("Weather");
    let unit = sub.find_or_create(FILE_UNIT, None).unwrap();

    let (wide, answer) = request_range(
        &mut sub,
        unit,
        StateRange::spanning(UnitState::Registered, UnitState::Active),
    );
    assert!(answer.handle().is_some());
    assert_eq!(sub.state_of(unit), Some(UnitState::Mounting));

    let (narrow, answer) = request_range(&mut sub, unit, StateRange::single(UnitState::Registered));
    assert!(answer.handle().is_some());
    assert_eq!(sub.destination_of(unit), Some(StateRange::single(UnitState::Registered)));

    let (_, answer) = request_range(&mut sub, unit, StateRange::single(UnitState::Installed));
    assert_eq!(answer, DestinationRequest::Rejected);

    host.hooks.release_pausers();
    sub.run_until_idle(5);
    assert_eq!(sub.state_of(unit), Some(UnitState::Registered));
    assert_eq!(wide.borrow().len(), 1);
    assert_eq!(narrow.borrow().len(), 1);
    assert!(wide.borrow()[0].result.is_ok());
}

#[test]
fn removed_callback_is_never_invoked() {
    let (mut sub, host) = setup(CompletionMode::Immediate);
    host.hooks.hold_post_mount("Weather");
    let unit = sub.find_or_create(FILE_UNIT, None).unwrap();

    let (kept, _) = request_range(&mut sub, unit, StateRange::single(UnitState::Active));
    let (dropped, answer) = request_range(&mut sub, unit, StateRange::single(UnitState::Active));
    let handle = answer.handle().expect("queued");
    assert_eq!(sub.remove_pending_transition_callback(unit, Removal::Handle(handle)), 1);

    host.hooks.release_pausers();
    sub.run_until_idle(5);
    assert_eq!(sub.state_of(unit), Some(UnitState::Active));
    assert_eq!(kept.borrow().len(), 1);
    assert!(dropped.borrow().is_empty());
}

#[test]
fn callbacks_may_issue_new_requests() {
    let (mut sub, _host) = setup(CompletionMode::Immediate);
    let unit = sub.find_or_create(FILE_UNIT, None).unwrap();
    let follow_up: Seen = Rc::new(RefCell::new(Vec::new()));
    let sink = follow_up.clone();

    sub.set_destination(unit, StateRange::single(UnitState::Registered), move |sub, outcome| {
        assert!(outcome.result.is_ok());
        let sink = sink.clone();
        sub.set_destination(outcome.unit, StateRange::single(UnitState::Active), move |_, outcome| {
            sink.borrow_mut().push(outcome.clone())
        });
    });

    assert_eq!(sub.state_of(unit), Some(UnitState::Active));
    assert_eq!(follow_up.borrow().len(), 1);
    assert_eq!(follow_up.borrow()[0].state, UnitState::Active);
}

#[test]
fn each_pending_request_sees_one_cancellation() {
    let (mut sub, host) = setup(CompletionMode::Immediate);
    host.hooks.hold_post_mount("Weather");
    let unit = sub.find_or_create(FILE_UNIT, None).unwrap();

    let (wide, answer) = request_range(
        &mut sub,
        unit,
        StateRange::spanning(UnitState::Registered, UnitState::Active),
    );
    assert!(answer.handle().is_some());
    let (upper, answer) = request_range(
        &mut sub,
        unit,
        StateRange::spanning(UnitState::Loaded, UnitState::Active),
    );
    assert!(answer.handle().is_some());
    assert_eq!(sub.state_of(unit), Some(UnitState::Mounting));

    let (cancels, accepted) = cancel(&mut sub, unit);
    assert!(accepted);
    host.hooks.release_pausers();
    sub.run_until_idle(5);
    assert_eq!(sub.state_of(unit), Some(UnitState::Registered));

    for seen in [&wide, &upper] {
        let outcomes = seen.borrow();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].state, UnitState::Registered);
        assert!(outcomes[0].result.as_ref().unwrap_err().is_canceled());
    }
    assert_eq!(cancels.get(), 1);

    // Later requests leave the delivered outcomes alone.
    request(&mut sub, unit, UnitState::Active);
    sub.run_until_idle(5);
    assert_eq!(sub.state_of(unit), Some(UnitState::Active));
    assert_eq!(wide.borrow().len(), 1);
    assert_eq!(upper.borrow().len(), 1);
    assert_eq!(cancels.get(), 1);
}
