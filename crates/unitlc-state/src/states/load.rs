//! Loading and Unloading of the unit's preloaded assets.

use unitlc_core::{ErrorKind, UnitState};

use crate::behavior::{StateBehavior, StateContext, StateStep};
use crate::ports::{LoadHandle, LoadOutcome};
use crate::queue::PendingResult;

/// Preload the unit's assets.
#[derive(Debug, Default)]
pub struct Loading {
    started: bool,
    pending: Option<PendingResult<LoadOutcome>>,
    handle: Option<LoadHandle>,
}

impl Loading {
    fn finish(ctx: &mut StateContext<'_>) -> StateStep {
        let hooks = ctx.services().hooks;
        hooks.on_loading(ctx.unit, &ctx.props.name);
        StateStep::Advance(UnitState::Loaded)
    }
}

impl StateBehavior for Loading {
    fn begin_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.started = false;
        self.pending = None;
        self.handle = None;
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        if !self.started {
            self.started = true;
            let loader = ctx.services().loader;
            let (pending, completer) = ctx.pending();
            let Some(handle) = loader.load_assets(&ctx.props.name, completer) else {
                return Self::finish(ctx);
            };
            if !ctx.config().use_async_loading(&ctx.props.options) {
                loader.wait_until_complete(handle, None);
            }
            self.pending = Some(pending);
            self.handle = Some(handle);
        }

        let Some(outcome) = self.pending.as_ref().and_then(PendingResult::take) else {
            return StateStep::Hold;
        };
        self.pending = None;
        self.handle = None;

        match outcome {
            LoadOutcome::Loaded => Self::finish(ctx),
            LoadOutcome::Missing => {
                tracing::warn!(unit = %ctx.unit, name = %ctx.props.name, "preload reported missing assets");
                Self::finish(ctx)
            }
            LoadOutcome::Canceled => StateStep::fail(
                UnitState::ErrorLoading,
                ctx.error(ErrorKind::LoadCanceled, "Load_Cancelled_Preload"),
            ),
        }
    }

    fn end_state(&mut self, ctx: &mut StateContext<'_>) {
        if let Some(handle) = self.handle.take() {
            ctx.services().loader.cancel(handle);
        }
        self.pending = None;
    }

    fn try_cancel(&mut self, ctx: &mut StateContext<'_>) {
        if let Some(handle) = self.handle {
            ctx.services().loader.cancel(handle);
        }
    }
}

/// Release the unit's preloaded assets.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unloading;

impl StateBehavior for Unloading {
    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        let services = ctx.services();
        services.hooks.on_unloading(ctx.unit, &ctx.props.name);
        services.loader.unload_assets(&ctx.props.name);
        StateStep::Advance(UnitState::Registered)
    }
}
