//! # Batch Processing Tests
//!
//! With batching enabled, units entering Activating park a request and hold.
//! The next tick initialises configuration once for the whole group and
//! wakes every unit in it.

use unitlc_core::{LifecycleConfig, ProtocolOptions, StateRange, UnitState};
use unitlc_state::sim::{CompletionMode, HookEvent, SimHost};
use unitlc_state::UnitSubsystem;

const A: &str = "file:/units/A/A.unit";
const B: &str = "file:/units/B/B.unit";

fn setup(enable_batch_processing: bool) -> (UnitSubsystem, SimHost) {
    let host = SimHost::new(CompletionMode::Immediate);
    let config = LifecycleConfig {
        enable_batch_processing,
        ..LifecycleConfig::default()
    };
    let sub = UnitSubsystem::new(config, host.services());
    (sub, host)
}

fn activate(sub: &mut UnitSubsystem, url: &str, options: Option<ProtocolOptions>) -> unitlc_core::UnitId {
    let unit = sub.find_or_create(url, options).unwrap();
    sub.set_destination(unit, StateRange::single(UnitState::Active), |_, _| {});
    unit
}

fn config_events(host: &SimHost) -> Vec<HookEvent> {
    host.hooks
        .events()
        .into_iter()
        .filter(|e| matches!(e, HookEvent::ConfigInitialized(_) | HookEvent::ConfigBatch(_)))
        .collect()
}

#[test]
fn units_in_activating_share_one_batch() {
    let (mut sub, host) = setup(true);
    let a = activate(&mut sub, A, None);
    let b = activate(&mut sub, B, None);
    assert_eq!(sub.state_of(a), Some(UnitState::Activating));
    assert_eq!(sub.state_of(b), Some(UnitState::Activating));
    assert_eq!(sub.batches().pending(UnitState::Activating), 2);

    let summary = sub.tick();
    assert_eq!(summary.batches, 1);
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
    assert_eq!(sub.state_of(b), Some(UnitState::Active));
    assert_eq!(
        config_events(&host),
        vec![HookEvent::ConfigBatch(vec!["A".into(), "B".into()])]
    );
    assert!(sub.is_idle());
}

#[test]
fn batching_disabled_initialises_each_unit() {
    let (mut sub, host) = setup(false);
    let a = activate(&mut sub, A, None);
    let b = activate(&mut sub, B, None);
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
    assert_eq!(sub.state_of(b), Some(UnitState::Active));
    assert_eq!(
        config_events(&host),
        vec![
            HookEvent::ConfigInitialized("A".into()),
            HookEvent::ConfigInitialized("B".into()),
        ]
    );
}

#[test]
fn unit_can_opt_out_of_batching() {
    let (mut sub, host) = setup(true);
    let solo = ProtocolOptions {
        batch_process: false,
        ..ProtocolOptions::default()
    };
    let a = activate(&mut sub, A, Some(solo));
    let b = activate(&mut sub, B, None);
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
    assert_eq!(sub.state_of(b), Some(UnitState::Activating));

    sub.run_until_idle(5);
    assert_eq!(sub.state_of(b), Some(UnitState::Active));
    assert_eq!(
        config_events(&host),
        vec![
            HookEvent::ConfigInitialized("A".into()),
            HookEvent::ConfigBatch(vec!["B".into()]),
        ]
    );
}

#[test]
fn excluding_a_parked_unit_withdraws_its_request() {
    let (mut sub, host) = setup(true);
    let a = activate(&mut sub, A, None);
    let b = activate(&mut sub, B, None);

    assert!(sub.exclude_from_batch_processing(a));
    assert!(!sub.options_of(a).unwrap().batch_process);
    assert_eq!(sub.batches().pending(UnitState::Activating), 1);

    sub.run_until_idle(5);
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
    assert_eq!(sub.state_of(b), Some(UnitState::Active));
    assert_eq!(
        config_events(&host),
        vec![
            HookEvent::ConfigInitialized("A".into()),
            HookEvent::ConfigBatch(vec!["B".into()]),
        ]
    );
}

#[test]
fn activating_dependencies_takes_dependencies_out_of_batching() {
    let (mut sub, host) = setup(true);
    host.resolver.add(A, B);
    let a = activate(&mut sub, A, None);
    let b = sub.find(B).unwrap();

    assert_eq!(sub.state_of(b), Some(UnitState::Active));
    assert!(!sub.options_of(b).unwrap().batch_process);
    assert_eq!(sub.state_of(a), Some(UnitState::Activating));

    sub.run_until_idle(5);
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
    assert_eq!(
        config_events(&host),
        vec![
            HookEvent::ConfigInitialized("B".into()),
            HookEvent::ConfigBatch(vec!["A".into()]),
        ]
    );
}

#[test]
fn parked_batch_keeps_subsystem_busy() {
    let (mut sub, _host) = setup(true);
    let a = activate(&mut sub, A, None);
    assert_eq!(sub.state_of(a), Some(UnitState::Activating));
    assert!(!sub.is_idle());
    assert!(sub.has_running_units());

    let ticks = sub.run_until_idle(5);
    assert!(ticks >= 1);
    assert_eq!(sub.state_of(a), Some(UnitState::Active));
    assert!(sub.batches().is_empty());
    assert!(!sub.has_running_units());
}
