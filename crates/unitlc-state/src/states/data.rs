//! Downloading, Releasing, and Uninstalling.
//!
//! Only install-bundle units do any work here; file units pass straight
//! through. Downloads hold a Download reference on every bundle in the
//! shared tracker; releasing drops it and hands the installer only the
//! bundles no other unit still needs.

use unitlc_core::{ErrorKind, InstallFlags, ProtocolOptions, ReleaseFlags, TransitionError, UnitState};

use super::{enqueued_bundles, BundleRequest};
use crate::behavior::{apply_protocol_options, StateBehavior, StateContext, StateStep};
use crate::bundles::BundleDepth;
use crate::ports::{BundleInstallState, PauseChange};
use crate::queue::{BundleEvent, BundleFailure, BundleOp};

// ─── Releasing / Uninstalling ────────────────────────────────────────

/// Release a unit's downloaded bundles.
#[derive(Debug)]
pub struct ReleaseData {
    success: UnitState,
    failure: UnitState,
    remove_files: bool,
    request: BundleRequest,
    done: bool,
}

impl ReleaseData {
    /// Releasing: back to StatusKnown, keeping files on disk.
    pub fn releasing() -> Self {
        Self::new(UnitState::StatusKnown, UnitState::ErrorManagingData, false)
    }

    /// Uninstalling: on to Uninstalled, removing files where possible.
    pub fn uninstalling() -> Self {
        Self::new(UnitState::Uninstalled, UnitState::ErrorUninstalling, true)
    }

    fn new(success: UnitState, failure: UnitState, remove_files: bool) -> Self {
        Self {
            success,
            failure,
            remove_files,
            request: BundleRequest::default(),
            done: false,
        }
    }

    fn begin_request(&mut self, ctx: &mut StateContext<'_>) {
        self.request.clear();
        self.done = false;
        if !ctx.props.is_install_bundle() {
            self.done = true;
            return;
        }

        let bundles = ctx.props.metadata().bundles().to_vec();
        let unit = ctx.unit;
        let releasable = ctx.bundles().release(unit, BundleDepth::Download, &bundles);
        if releasable.is_empty() {
            self.done = true;
            return;
        }

        let mut flags = ReleaseFlags::EXPLICIT_REMOVE_LIST;
        if self.remove_files {
            flags |= ReleaseFlags::REMOVE_FILES_IF_POSSIBLE;
        }
        let answer = ctx
            .services()
            .installer
            .request_release(&releasable, flags, ctx.bundle_sink());
        match enqueued_bundles(ctx, answer) {
            Err(error) => self.request.fail(error),
            Ok(enqueued) if enqueued.is_empty() => self.done = true,
            Ok(enqueued) => self.request.start(enqueued),
        }
    }
}

impl StateBehavior for ReleaseData {
    fn begin_state(&mut self, ctx: &mut StateContext<'_>) {
        if self.success == UnitState::StatusKnown && ctx.props.is_install_bundle() {
            let hooks = ctx.services().hooks;
            hooks.on_releasing(ctx.unit, &ctx.props.name);
        }
        self.begin_request(ctx);
    }

    fn update_state(&mut self, _ctx: &mut StateContext<'_>) -> StateStep {
        if self.request.is_waiting() {
            return StateStep::Hold;
        }
        if let Some(error) = self.request.take_error() {
            return StateStep::fail(self.failure, error);
        }
        if !self.done {
            return StateStep::Hold;
        }
        StateStep::Advance(self.success)
    }

    fn end_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.request.clear();
        self.done = false;
    }

    fn on_bundle_event(&mut self, ctx: &mut StateContext<'_>, event: &BundleEvent) -> bool {
        let Some(result) = self.request.record(BundleOp::Release, event) else {
            return false;
        };
        if let Err(failure) = result {
            let error = ctx.error(
                ErrorKind::BundleOperation,
                format!("BundleManager.OnRemove_Failed.{}", failure.code()),
            );
            self.request.fail(error);
        }
        if self.request.is_waiting() {
            return false;
        }
        self.done = !self.request.has_failed();
        true
    }

    fn try_update_protocol_options(
        &mut self,
        ctx: &mut StateContext<'_>,
        options: &ProtocolOptions,
    ) -> Result<bool, TransitionError> {
        let changed = apply_protocol_options(ctx, options)?;
        if self.success != UnitState::Uninstalled {
            return Ok(changed);
        }
        if !ctx.props.options.uninstall_before_terminate() {
            self.request.clear();
            self.done = true;
        } else {
            self.begin_request(ctx);
        }
        ctx.request_update();
        Ok(changed)
    }
}

// ─── Downloading ─────────────────────────────────────────────────────

/// Download every bundle of an install-bundle unit without mounting it.
#[derive(Debug, Default)]
pub struct Downloading {
    request: BundleRequest,
    early_error: Option<TransitionError>,
    suppress_log: bool,
    done: bool,
}

impl Downloading {
    fn notify_pause(ctx: &StateContext<'_>, paused: bool) {
        let change = PauseChange {
            state: UnitState::Downloading,
            reason: "UserPause".to_string(),
            paused,
        };
        ctx.services().hooks.on_pause_change(ctx.unit, &change);
    }
}

impl StateBehavior for Downloading {
    fn begin_state(&mut self, ctx: &mut StateContext<'_>) {
        self.request.clear();
        self.early_error = None;
        self.suppress_log = false;
        self.done = false;
        if !ctx.props.is_install_bundle() {
            self.done = true;
            return;
        }

        let services = ctx.services();
        let bundles = ctx.props.metadata().bundles().to_vec();
        let options = ctx.props.options.install_bundle().cloned().unwrap_or_default();

        if options.do_not_download {
            let up_to_date = services
                .installer
                .install_state(&bundles, false)
                .map(|info| {
                    info.bundles
                        .iter()
                        .all(|(_, state)| *state == BundleInstallState::UpToDate)
                })
                .unwrap_or(false);
            if !up_to_date {
                self.early_error = Some(ctx.error(ErrorKind::DownloadNotAllowed, "DownloadNotAllowed"));
                self.suppress_log = true;
                return;
            }
        }

        services.hooks.on_downloading(ctx.unit, &ctx.props.name);
        if ctx.props.try_cancel {
            self.early_error = Some(TransitionError::canceled());
            return;
        }

        let unit = ctx.unit;
        ctx.bundles().add_refs(unit, BundleDepth::Download, &bundles);
        let answer = services.installer.request_install(
            &bundles,
            options.install_flags | InstallFlags::SKIP_MOUNT,
            ctx.bundle_sink(),
        );
        match enqueued_bundles(ctx, answer) {
            Err(error) => self.early_error = Some(error),
            Ok(enqueued) if enqueued.is_empty() => {
                ctx.report_progress(1.0);
                self.done = true;
            }
            Ok(enqueued) => {
                self.request.start(enqueued);
                ctx.report_progress(0.0);
                if options.user_pause_download {
                    services.installer.pause_install(self.request.pending());
                    Self::notify_pause(ctx, true);
                }
            }
        }
    }

    fn update_state(&mut self, _ctx: &mut StateContext<'_>) -> StateStep {
        if let Some(error) = self.early_error.take() {
            return StateStep::Fail {
                to: UnitState::ErrorManagingData,
                error,
                suppress_log: self.suppress_log,
            };
        }
        if self.request.is_waiting() {
            return StateStep::Hold;
        }
        if let Some(error) = self.request.take_error() {
            return StateStep::fail(UnitState::ErrorManagingData, error);
        }
        if !self.done {
            return StateStep::Hold;
        }
        StateStep::Advance(UnitState::Installed)
    }

    fn end_state(&mut self, ctx: &mut StateContext<'_>) {
        if self.request.is_waiting() {
            ctx.services().installer.cancel_install(self.request.pending());
        }
        self.request.clear();
    }

    fn try_cancel(&mut self, ctx: &mut StateContext<'_>) {
        if self.request.is_waiting() {
            ctx.services().installer.cancel_install(self.request.pending());
        }
    }

    fn on_bundle_event(&mut self, ctx: &mut StateContext<'_>, event: &BundleEvent) -> bool {
        let Some(result) = self.request.record(BundleOp::Install, event) else {
            return false;
        };
        if let Err(failure) = result {
            if !self.request.has_failed() {
                let kind = match failure {
                    BundleFailure::Canceled => ErrorKind::Canceled,
                    BundleFailure::Failed(_) => ErrorKind::BundleOperation,
                };
                let error = ctx.error(kind, format!("BundleManager.OnComplete.{}", failure.code()));
                self.request.fail(error);
                if failure != BundleFailure::Canceled && self.request.is_waiting() {
                    ctx.services().installer.cancel_install(self.request.pending());
                }
            }
        }
        let progress = self.request.progress();
        ctx.report_progress(progress);
        if self.request.is_waiting() {
            return false;
        }
        self.done = !self.request.has_failed();
        true
    }

    fn try_update_protocol_options(
        &mut self,
        ctx: &mut StateContext<'_>,
        options: &ProtocolOptions,
    ) -> Result<bool, TransitionError> {
        let previous = ctx.props.options.install_bundle().cloned();
        let changed = apply_protocol_options(ctx, options)?;
        if !changed || !self.request.is_waiting() {
            return Ok(changed);
        }
        let (Some(old), Some(new)) = (previous, options.install_bundle()) else {
            return Ok(changed);
        };

        let installer = ctx.services().installer;
        let add = new.install_flags.difference(old.install_flags);
        let remove = old.install_flags.difference(new.install_flags);
        if !add.is_empty() || !remove.is_empty() {
            installer.update_install_flags(self.request.pending(), add, remove);
        }
        if old.user_pause_download != new.user_pause_download {
            if new.user_pause_download {
                installer.pause_install(self.request.pending());
            } else {
                installer.resume_install(self.request.pending());
            }
            Self::notify_pause(ctx, new.user_pause_download);
        }
        Ok(changed)
    }
}
