//! Mounting and Unmounting.
//!
//! Mounting runs in phases so that each wait is a plain hold:
//!
//! ```text
//! Start ──▶ WaitingForBundles ──▶ Mount ──▶ WaitingForPausers ──▶ WaitingForDependencies
//! ```
//!
//! Install-bundle units first ask the installer to mount their bundles and
//! raise their tracker references to Mount depth. The unit is then mounted
//! with the host, and hooks may pause the transition from `on_post_mount`.

use unitlc_core::{ErrorKind, InstallFlags, ReleaseFlags, UnitState};

use super::{enqueued_bundles, realtime_defer, BundleRequest};
use crate::behavior::{StateBehavior, StateContext, StateStep};
use crate::bundles::BundleDepth;
use crate::ports::{MountOutcome, PauseContext};
use crate::queue::{BundleEvent, BundleOp};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum MountPhase {
    #[default]
    Start,
    WaitingForBundles,
    Mount,
    WaitingForPausers,
}

/// Mount the unit's bundles and register the unit with the host.
#[derive(Debug, Default)]
pub struct Mounting {
    phase: MountPhase,
    request: BundleRequest,
    pause: Option<PauseContext>,
    deferred: bool,
}

impl Mounting {
    fn start(&mut self, ctx: &mut StateContext<'_>) -> Result<(), StateStep> {
        if !ctx.props.is_install_bundle() {
            self.phase = MountPhase::Mount;
            return Ok(());
        }

        let bundles = ctx.props.metadata().bundles().to_vec();
        let unit = ctx.unit;
        ctx.bundles().add_refs(unit, BundleDepth::Mount, &bundles);

        let options = ctx.props.options.clone();
        let mut flags = options
            .install_bundle()
            .map(|o| o.install_flags)
            .unwrap_or_default();
        if ctx.config().use_async_registration(&options) {
            flags |= InstallFlags::ASYNC_MOUNT;
        }
        let answer = ctx
            .services()
            .installer
            .request_install(&bundles, flags, ctx.bundle_sink());
        match enqueued_bundles(ctx, answer) {
            Err(error) => Err(StateStep::fail(UnitState::ErrorMounting, error)),
            Ok(enqueued) if enqueued.is_empty() => {
                self.phase = MountPhase::Mount;
                Ok(())
            }
            Ok(enqueued) => {
                self.request.start(enqueued);
                self.phase = MountPhase::WaitingForBundles;
                Ok(())
            }
        }
    }

    fn mount(&mut self, ctx: &mut StateContext<'_>) -> Result<(), StateStep> {
        let services = ctx.services();
        services.hooks.on_pre_mount(ctx.unit, &ctx.props.name);
        match services
            .mounter
            .mount_unit(&ctx.props.name, &ctx.props.descriptor_path)
        {
            MountOutcome::Mounted => ctx.props.added_to_registry = true,
            MountOutcome::NameInUse => {
                return Err(StateStep::fail(
                    UnitState::ErrorMounting,
                    ctx.error(ErrorKind::Mount, "Unit_Name_Already_In_Use"),
                ));
            }
            MountOutcome::Failed => {
                return Err(StateStep::fail(
                    UnitState::ErrorMounting,
                    ctx.error(ErrorKind::Mount, "Failed_To_Register_Unit"),
                ));
            }
        }

        let pause = ctx.pause_context();
        services.hooks.on_post_mount(ctx.unit, &ctx.props.name, &pause);
        self.pause = Some(pause);
        self.phase = MountPhase::WaitingForPausers;
        Ok(())
    }
}

impl StateBehavior for Mounting {
    fn begin_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.phase = MountPhase::Start;
        self.request.clear();
        self.pause = None;
        self.deferred = false;
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        loop {
            let advanced = match self.phase {
                MountPhase::Start => {
                    if realtime_defer(ctx, &mut self.deferred) {
                        return StateStep::Hold;
                    }
                    self.start(ctx)
                }
                MountPhase::WaitingForBundles => {
                    if self.request.is_waiting() {
                        return StateStep::Hold;
                    }
                    if let Some(error) = self.request.take_error() {
                        return StateStep::fail(UnitState::ErrorMounting, error);
                    }
                    self.phase = MountPhase::Mount;
                    Ok(())
                }
                MountPhase::Mount => self.mount(ctx),
                MountPhase::WaitingForPausers => {
                    let paused = self.pause.as_ref().map(PauseContext::outstanding).unwrap_or(0);
                    if paused > 0 {
                        return StateStep::Hold;
                    }
                    return StateStep::Advance(UnitState::WaitingForDependencies);
                }
            };
            if let Err(step) = advanced {
                return step;
            }
        }
    }

    fn end_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.request.clear();
        self.pause = None;
    }

    fn on_bundle_event(&mut self, ctx: &mut StateContext<'_>, event: &BundleEvent) -> bool {
        let Some(result) = self.request.record(BundleOp::Install, event) else {
            return false;
        };
        if let Err(failure) = result {
            let error = ctx.error(
                ErrorKind::BundleOperation,
                format!("BundleManager.OnComplete.{}", failure.code()),
            );
            self.request.fail(error);
        }
        !self.request.is_waiting()
    }
}

/// Unregister the unit from the host and unmount its bundles.
#[derive(Debug, Default)]
pub struct Unmounting {
    started: bool,
    deferred: bool,
    request: BundleRequest,
}

impl StateBehavior for Unmounting {
    fn begin_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.started = false;
        self.deferred = false;
        self.request.clear();
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        if !self.started {
            if realtime_defer(ctx, &mut self.deferred) {
                return StateStep::Hold;
            }
            self.started = true;
            let services = ctx.services();

            if ctx.props.added_to_registry {
                if !services.mounter.unmount_unit(&ctx.props.name) {
                    return StateStep::fail(
                        UnitState::ErrorMounting,
                        ctx.error(ErrorKind::Mount, "Unit_Cannot_Unmount"),
                    );
                }
                ctx.props.added_to_registry = false;
            }

            if ctx.props.is_install_bundle() {
                let bundles = ctx.props.metadata().bundles().to_vec();
                let unit = ctx.unit;
                let releasable = ctx.bundles().release(unit, BundleDepth::Mount, &bundles);
                if !releasable.is_empty() {
                    let answer = services.installer.request_release(
                        &releasable,
                        ReleaseFlags::SKIP_RELEASE_UNMOUNT_ONLY | ReleaseFlags::EXPLICIT_REMOVE_LIST,
                        ctx.bundle_sink(),
                    );
                    match enqueued_bundles(ctx, answer) {
                        Err(error) => return StateStep::fail(UnitState::ErrorMounting, error),
                        Ok(enqueued) => self.request.start(enqueued),
                    }
                }
            }
        }

        if self.request.is_waiting() {
            return StateStep::Hold;
        }
        if let Some(error) = self.request.take_error() {
            return StateStep::fail(UnitState::ErrorMounting, error);
        }
        StateStep::Advance(UnitState::Installed)
    }

    fn end_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.request.clear();
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
        !self.request.is_waiting()
    }
}
