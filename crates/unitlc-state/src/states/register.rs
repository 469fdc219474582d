//! Registering and Unregistering.
//!
//! Registering loads the unit's feature data, looked up first at
//! `/<Name>/FeatureData` and then at `/<Name>/<Name>`. Missing feature data
//! marks the unit unrecoverable.

use unitlc_core::{ErrorKind, UnitState};

use super::realtime_defer;
use crate::behavior::{StateBehavior, StateContext, StateStep};
use crate::ports::{LoadHandle, LoadOutcome};
use crate::queue::PendingResult;

/// Where the feature data of `name` lives.
pub fn feature_data_path(ctx: &StateContext<'_>, name: &str) -> String {
    let preferred = format!("/{name}/FeatureData");
    if ctx.services().loader.feature_data_exists(&preferred) {
        preferred
    } else {
        format!("/{name}/{name}")
    }
}

/// Load the unit's feature data.
#[derive(Debug, Default)]
pub struct Registering {
    deferred: bool,
    path: String,
    pending: Option<PendingResult<LoadOutcome>>,
    handle: Option<LoadHandle>,
}

impl Registering {
    fn reset(&mut self) {
        self.path.clear();
        self.pending = None;
        self.handle = None;
    }
}

impl StateBehavior for Registering {
    fn begin_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.deferred = false;
        self.reset();
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        if self.pending.is_none() {
            if realtime_defer(ctx, &mut self.deferred) {
                return StateStep::Hold;
            }
            let loader = ctx.services().loader;
            let name = ctx.props.name.clone();
            let path = feature_data_path(ctx, &name);
            let (pending, completer) = ctx.pending();
            let handle = loader.load_feature_data(&path, completer);
            if !ctx.config().use_async_registration(&ctx.props.options) {
                loader.wait_until_complete(handle, None);
            }
            self.path = path;
            self.pending = Some(pending);
            self.handle = Some(handle);
        }

        let Some(outcome) = self.pending.as_ref().and_then(PendingResult::take) else {
            return StateStep::Hold;
        };
        let path = std::mem::take(&mut self.path);
        self.reset();

        match outcome {
            LoadOutcome::Loaded => {
                ctx.props.feature_data = Some(path);
                let hooks = ctx.services().hooks;
                hooks.on_registering(ctx.unit, &ctx.props.name);
                StateStep::Advance(UnitState::Registered)
            }
            LoadOutcome::Canceled => StateStep::fail(
                UnitState::ErrorRegistering,
                ctx.error(ErrorKind::LoadCanceled, "Load_Cancelled_FeatureData"),
            ),
            LoadOutcome::Missing => {
                ctx.props.unrecoverable = true;
                tracing::error!(unit = %ctx.unit, path = %path, "feature data is missing");
                StateStep::fail(
                    UnitState::ErrorRegistering,
                    ctx.error(ErrorKind::MissingData, "Missing_FeatureData"),
                )
            }
        }
    }

    fn end_state(&mut self, ctx: &mut StateContext<'_>) {
        if let Some(handle) = self.handle.take() {
            ctx.services().loader.cancel(handle);
        }
        self.reset();
    }

    fn try_cancel(&mut self, ctx: &mut StateContext<'_>) {
        if let Some(handle) = self.handle {
            ctx.services().loader.cancel(handle);
        }
    }
}

/// Drop the unit's feature data.
#[derive(Debug, Default)]
pub struct Unregistering {
    deferred: bool,
}

impl StateBehavior for Unregistering {
    fn begin_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.deferred = false;
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        if !self.deferred {
            if ctx.props.feature_data.take().is_some() {
                let hooks = ctx.services().hooks;
                hooks.on_unregistering(ctx.unit, &ctx.props.name);
            }
            self.deferred = true;
            ctx.defer_update();
            return StateStep::Hold;
        }
        StateStep::Advance(UnitState::AssetDependencyStreamOut)
    }
}
