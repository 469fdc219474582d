//! # Per-State Behaviors
//!
//! One module per group of related states:
//!
//! | Module | States |
//! |---|---|
//! | [`anchors`] | every Destination and Error state, plus Uninitialized and Terminal |
//! | [`status`] | CheckingStatus |
//! | [`data`] | Downloading, Releasing, Uninstalling |
//! | [`mount`] | Mounting, Unmounting |
//! | [`streaming`] | AssetDependencyStreaming, AssetDependencyStreamOut |
//! | [`register`] | Registering, Unregistering |
//! | [`load`] | Loading, Unloading |
//! | [`activate`] | Activating, Deactivating |
//!
//! The three dependency phases are built from
//! [`DependencyCoordinator`](crate::dependency::DependencyCoordinator).

pub mod activate;
pub mod anchors;
pub mod data;
pub mod load;
pub mod mount;
pub mod register;
pub mod status;
pub mod streaming;

use unitlc_core::{BundleId, ErrorKind, TransitionError, UnitState};

use crate::behavior::{StateBehavior, StateContext};
use crate::dependency::{ActivatingPolicy, DeactivatingPolicy, DependencyCoordinator, WaitingPolicy};
use crate::ports::{InstallerError, RequestInfo};
use crate::queue::{BundleEvent, BundleFailure, BundleOp};

/// The standard behavior for `state`.
pub fn behavior_for(state: UnitState) -> Box<dyn StateBehavior> {
    use UnitState as S;
    match state {
        S::Uninitialized => Box::new(anchors::UninitializedState),
        S::Terminal => Box::new(anchors::TerminalState::default()),
        S::UnknownStatus => Box::new(anchors::Anchor::unknown_status()),
        S::Uninstalled => Box::new(anchors::Anchor::uninstalled()),
        S::Uninstalling => Box::new(data::ReleaseData::uninstalling()),
        S::ErrorUninstalling => Box::new(anchors::Anchor::error_uninstalling()),
        S::CheckingStatus => Box::new(status::CheckingStatus::default()),
        S::ErrorCheckingStatus => Box::new(anchors::Anchor::error_checking_status()),
        S::ErrorUnavailable => Box::new(anchors::Anchor::error_unavailable()),
        S::StatusKnown => Box::new(anchors::Anchor::status_known()),
        S::Releasing => Box::new(data::ReleaseData::releasing()),
        S::ErrorManagingData => Box::new(anchors::Anchor::error_managing_data()),
        S::Downloading => Box::new(data::Downloading::default()),
        S::Installed => Box::new(anchors::Anchor::installed()),
        S::ErrorMounting => Box::new(anchors::Anchor::error_mounting()),
        S::ErrorWaitingForDependencies => Box::new(anchors::Anchor::error_waiting_for_dependencies()),
        S::ErrorRegistering => Box::new(anchors::Anchor::error_registering()),
        S::Unmounting => Box::new(mount::Unmounting::default()),
        S::Mounting => Box::new(mount::Mounting::default()),
        S::WaitingForDependencies => Box::new(DependencyCoordinator::new(WaitingPolicy)),
        S::AssetDependencyStreamOut => Box::new(streaming::AssetStreamOut),
        S::ErrorAssetDependencyStreaming => Box::new(anchors::Anchor::error_asset_streaming()),
        S::AssetDependencyStreaming => Box::new(streaming::AssetStreaming::default()),
        S::Unregistering => Box::new(register::Unregistering::default()),
        S::Registering => Box::new(register::Registering::default()),
        S::Registered => Box::new(anchors::Anchor::registered()),
        S::ErrorLoading => Box::new(anchors::Anchor::error_loading()),
        S::Unloading => Box::new(load::Unloading),
        S::Loading => Box::new(load::Loading::default()),
        S::Loaded => Box::new(anchors::Anchor::loaded()),
        S::ErrorDeactivatingDependencies => Box::new(anchors::Anchor::error_deactivating_dependencies()),
        S::DeactivatingDependencies => Box::new(DependencyCoordinator::new(DeactivatingPolicy)),
        S::Deactivating => Box::new(activate::Deactivating::default()),
        S::ErrorActivatingDependencies => Box::new(anchors::Anchor::error_activating_dependencies()),
        S::ActivatingDependencies => Box::new(DependencyCoordinator::new(ActivatingPolicy)),
        S::Activating => Box::new(activate::Activating),
        S::Active => Box::new(anchors::Anchor::active()),
    }
}

/// In realtime mode, spend the first update of a visit waiting one tick.
/// Returns `true` when the caller should hold.
pub(crate) fn realtime_defer(ctx: &mut StateContext<'_>, deferred: &mut bool) -> bool {
    if !ctx.config().realtime_mode || *deferred {
        return false;
    }
    *deferred = true;
    ctx.defer_update();
    true
}

/// Turn an installer request answer into the bundles to wait for.
pub(crate) fn enqueued_bundles(
    ctx: &StateContext<'_>,
    answer: Result<RequestInfo, InstallerError>,
) -> Result<Vec<BundleId>, TransitionError> {
    match answer {
        Err(error) => Err(ctx.error(
            ErrorKind::BundleOperation,
            format!("BundleManager.Begin.{}", error.code()),
        )),
        Ok(info) if !info.skipped_unknown.is_empty() => {
            tracing::warn!(
                unit = %ctx.unit,
                skipped = ?info.skipped_unknown,
                "installer could not resolve bundles"
            );
            Err(ctx.error(ErrorKind::BundleOperation, "BundleManager.Begin.Resolve_Failed"))
        }
        Ok(info) => Ok(info.enqueued),
    }
}

/// Bundles a state is waiting on for one installer operation, and the first
/// failure reported for them.
#[derive(Debug, Default)]
pub(crate) struct BundleRequest {
    pending: Vec<BundleId>,
    total: usize,
    error: Option<TransitionError>,
}

impl BundleRequest {
    pub(crate) fn start(&mut self, enqueued: Vec<BundleId>) {
        self.total = enqueued.len();
        self.pending = enqueued;
        self.error = None;
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.total = 0;
        self.error = None;
    }

    pub(crate) fn pending(&self) -> &[BundleId] {
        &self.pending
    }

    pub(crate) fn is_waiting(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn fail(&mut self, error: TransitionError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn take_error(&mut self) -> Option<TransitionError> {
        self.error.take()
    }

    /// Fraction of the request already reported back.
    pub(crate) fn progress(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        1.0 - self.pending.len() as f32 / self.total as f32
    }

    /// Record `event` if it belongs to this request. Returns the event's
    /// failure, if any, as `Some(Err)`; `None` when the event is not ours.
    pub(crate) fn record(&mut self, op: BundleOp, event: &BundleEvent) -> Option<Result<(), BundleFailure>> {
        if event.op != op {
            return None;
        }
        let idx = self.pending.iter().position(|b| *b == event.bundle)?;
        self.pending.remove(idx);
        Some(event.result.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_has_a_behavior() {
        for state in UnitState::ALL {
            let _ = behavior_for(state);
        }
    }

    #[test]
    fn only_activating_batches_by_default() {
        let table = crate::behavior::BehaviorTable::standard();
        let config = unitlc_core::LifecycleConfig {
            enable_batch_processing: true,
            ..Default::default()
        };
        let id = unitlc_core::UnitIdentifier::new("file:/u/A.unit").unwrap();
        let props = crate::machine::UnitProperties::new(
            unitlc_core::UnitId(1),
            id,
            unitlc_core::ProtocolOptions::default(),
        );
        let batching: Vec<UnitState> = UnitState::ALL
            .into_iter()
            .filter(|s| table.get(*s).can_batch_process(&props, &config))
            .collect();
        assert_eq!(batching, vec![UnitState::Activating]);
    }

    #[test]
    fn bundle_request_tracks_progress_and_first_failure() {
        let mut request = BundleRequest::default();
        request.start(vec![BundleId::from("A"), BundleId::from("B")]);
        assert!(request.is_waiting());
        assert_eq!(request.progress(), 0.0);

        let other_op = BundleEvent {
            op: BundleOp::Release,
            bundle: BundleId::from("A"),
            result: Ok(()),
        };
        assert!(request.record(BundleOp::Install, &other_op).is_none());

        let ok = BundleEvent {
            op: BundleOp::Install,
            ..other_op
        };
        assert_eq!(request.record(BundleOp::Install, &ok), Some(Ok(())));
        assert_eq!(request.progress(), 0.5);
        assert!(request.record(BundleOp::Install, &ok).is_none());

        request.fail(TransitionError::canceled());
        request.fail(TransitionError::new(UnitState::Downloading, ErrorKind::Installer, "Later"));
        assert!(request.take_error().unwrap().is_canceled());
        assert!(!request.has_failed());
    }
}
