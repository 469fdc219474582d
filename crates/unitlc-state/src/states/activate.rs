//! Activating and Deactivating.
//!
//! Activation may be batched: when batching applies, the unit parks a
//! request on entering Activating and holds until the batch processor has
//! initialised configuration for the whole group.

use unitlc_core::{LifecycleConfig, UnitState};

use crate::batch::{BatchItem, BatchProcessor};
use crate::behavior::{StateBehavior, StateContext, StateStep};
use crate::machine::UnitProperties;
use crate::ports::{PauseChange, PauseContext, Services};

fn initialize_config_batch(services: &Services, items: &[BatchItem]) {
    services.hooks.initialize_config_batch(items);
}

/// Initialise configuration and activate the unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Activating;

impl StateBehavior for Activating {
    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        if ctx.props.batch.handle.is_some() {
            return StateStep::Hold;
        }
        let hooks = ctx.services().hooks;
        if !ctx.props.batch.was_processed && ctx.props.options.allow_config_loading() {
            hooks.initialize_config(ctx.unit, &ctx.props.name);
        }
        hooks.on_activating(ctx.unit, &ctx.props.name);
        StateStep::Advance(UnitState::Active)
    }

    fn can_batch_process(&self, props: &UnitProperties, config: &LifecycleConfig) -> bool {
        config.use_async_loading(&props.options) && props.options.allow_config_loading()
    }

    fn batch_processor(&self) -> Option<BatchProcessor> {
        Some(initialize_config_batch)
    }
}

/// Deactivate the unit, waiting for any pausers hooks hand out.
#[derive(Debug, Default)]
pub struct Deactivating {
    pause: Option<PauseContext>,
    notified: bool,
    deferred: bool,
}

impl Deactivating {
    fn notify(ctx: &StateContext<'_>, paused: bool) {
        let change = PauseChange {
            state: UnitState::Deactivating,
            reason: "Deactivating".to_string(),
            paused,
        };
        ctx.services().hooks.on_pause_change(ctx.unit, &change);
    }
}

impl StateBehavior for Deactivating {
    fn begin_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.pause = None;
        self.notified = false;
        self.deferred = false;
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        if self.pause.is_none() {
            let pause = ctx.pause_context();
            ctx.services()
                .hooks
                .on_deactivating(ctx.unit, &ctx.props.name, &pause);
            if pause.outstanding() > 0 {
                Self::notify(ctx, true);
                self.notified = true;
            }
            self.pause = Some(pause);
        }

        if self.pause.as_ref().map(PauseContext::outstanding).unwrap_or(0) > 0 {
            return StateStep::Hold;
        }
        if self.notified {
            Self::notify(ctx, false);
            self.notified = false;
        }
        if ctx.destination().max() == UnitState::Loaded && !self.deferred {
            self.deferred = true;
            ctx.defer_update();
            return StateStep::Hold;
        }
        StateStep::Advance(UnitState::Loaded)
    }

    fn end_state(&mut self, _ctx: &mut StateContext<'_>) {
        self.pause = None;
    }
}
