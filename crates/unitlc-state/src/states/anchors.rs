//! Destination and Error states.
//!
//! These states do no work of their own. When the destination lies below
//! the state they take the `below` route, when it lies above they take the
//! `above` route, and otherwise they hold. Terminal and Uninitialized have
//! their own behaviors.

use unitlc_core::{ErrorKind, ProtocolOptions, TransitionError, UnitState};

use crate::behavior::{StateBehavior, StateContext, StateStep};
use crate::machine::UnitProperties;

/// Where an anchor state goes in one direction.
#[derive(Clone, Copy)]
pub enum Route {
    /// Nothing lies that way.
    Stay,
    /// Always this state.
    To(UnitState),
    /// Chosen from the unit's properties.
    Dynamic(fn(&UnitProperties) -> UnitState),
}

impl Route {
    fn resolve(self, props: &UnitProperties) -> Option<UnitState> {
        match self {
            Route::Stay => None,
            Route::To(state) => Some(state),
            Route::Dynamic(choose) => Some(choose(props)),
        }
    }
}

/// A state that only routes toward the destination.
#[derive(Clone, Copy)]
pub struct Anchor {
    below: Route,
    above: Route,
    above_event: Option<&'static str>,
    on_begin: Option<BeginHook>,
}

type BeginHook = fn(&mut StateContext<'_>);

fn notify_activated(ctx: &mut StateContext<'_>) {
    let hooks = ctx.services().hooks;
    hooks.on_activated(ctx.unit, &ctx.props.name);
}

fn uninstall_or_terminate(props: &UnitProperties) -> UnitState {
    if props.options.uninstall_before_terminate() || props.destination.min() >= UnitState::Uninstalled {
        UnitState::Uninstalling
    } else {
        UnitState::Terminal
    }
}

fn download_or_installed(props: &UnitProperties) -> UnitState {
    if props.is_install_bundle() {
        UnitState::Downloading
    } else {
        UnitState::Installed
    }
}

impl Anchor {
    /// An anchor with fixed routes.
    pub const fn new(below: Route, above: Route) -> Self {
        Self {
            below,
            above,
            above_event: None,
            on_begin: None,
        }
    }

    pub fn unknown_status() -> Self {
        Self {
            above_event: Some("CheckingStatus"),
            ..Self::new(Route::To(UnitState::Terminal), Route::To(UnitState::CheckingStatus))
        }
    }

    pub fn uninstalled() -> Self {
        Self::new(Route::To(UnitState::Terminal), Route::To(UnitState::CheckingStatus))
    }

    pub fn error_uninstalling() -> Self {
        Self::new(Route::Dynamic(uninstall_or_terminate), Route::To(UnitState::StatusKnown))
    }

    pub fn error_checking_status() -> Self {
        Self::new(Route::To(UnitState::Terminal), Route::To(UnitState::CheckingStatus))
    }

    pub fn error_unavailable() -> Self {
        Self::new(Route::To(UnitState::Terminal), Route::To(UnitState::CheckingStatus))
    }

    pub fn status_known() -> Self {
        Self::new(Route::Dynamic(uninstall_or_terminate), Route::Dynamic(download_or_installed))
    }

    pub fn error_managing_data() -> Self {
        Self::new(Route::To(UnitState::Releasing), Route::To(UnitState::Downloading))
    }

    pub fn installed() -> Self {
        Self::new(Route::To(UnitState::Releasing), Route::To(UnitState::Mounting))
    }

    pub fn error_mounting() -> Self {
        Self::new(Route::To(UnitState::Unmounting), Route::To(UnitState::Mounting))
    }

    pub fn error_waiting_for_dependencies() -> Self {
        Self::new(
            Route::To(UnitState::Unmounting),
            Route::To(UnitState::WaitingForDependencies),
        )
    }

    pub fn error_asset_streaming() -> Self {
        Self::new(
            Route::To(UnitState::AssetDependencyStreamOut),
            Route::To(UnitState::AssetDependencyStreaming),
        )
    }

    pub fn error_registering() -> Self {
        Self::new(Route::To(UnitState::Unregistering), Route::To(UnitState::Registering))
    }

    pub fn registered() -> Self {
        Self::new(Route::To(UnitState::Unregistering), Route::To(UnitState::Loading))
    }

    pub fn error_loading() -> Self {
        Self::new(Route::To(UnitState::Unloading), Route::To(UnitState::Loading))
    }

    pub fn loaded() -> Self {
        Self::new(Route::To(UnitState::Unloading), Route::To(UnitState::ActivatingDependencies))
    }

    pub fn error_deactivating_dependencies() -> Self {
        Self::new(
            Route::To(UnitState::DeactivatingDependencies),
            Route::To(UnitState::DeactivatingDependencies),
        )
    }

    pub fn error_activating_dependencies() -> Self {
        Self::new(Route::To(UnitState::Unloading), Route::To(UnitState::ActivatingDependencies))
    }

    pub fn active() -> Self {
        Self {
            on_begin: Some(notify_activated as BeginHook),
            ..Self::new(Route::To(UnitState::DeactivatingDependencies), Route::Stay)
        }
    }
}

impl StateBehavior for Anchor {
    fn begin_state(&mut self, ctx: &mut StateContext<'_>) {
        if let Some(on_begin) = self.on_begin {
            on_begin(ctx);
        }
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        let destination = ctx.destination();
        let next = if destination.is_below(ctx.state) {
            self.below.resolve(ctx.props)
        } else if destination.is_above(ctx.state) {
            let next = self.above.resolve(ctx.props);
            if let (Some(_), Some(event)) = (next, self.above_event) {
                ctx.status_event(event);
            }
            next
        } else {
            None
        };
        match next {
            Some(state) => StateStep::Advance(state),
            None => StateStep::Hold,
        }
    }
}

/// The state of a machine that has not been created yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct UninitializedState;

impl StateBehavior for UninitializedState {
    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        panic!("{} updated while uninitialized", ctx.unit);
    }
}

/// The end of a machine's life.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalState {
    entered: bool,
}

impl StateBehavior for TerminalState {
    fn begin_state(&mut self, ctx: &mut StateContext<'_>) {
        if self.entered {
            panic!("{} entered Terminal more than once", ctx.unit);
        }
        self.entered = true;
        let hooks = ctx.services().hooks;
        hooks.on_terminating(ctx.unit, ctx.props.identifier.full_url());
    }

    fn update_state(&mut self, _ctx: &mut StateContext<'_>) -> StateStep {
        StateStep::Hold
    }

    fn try_update_protocol_options(
        &mut self,
        ctx: &mut StateContext<'_>,
        _options: &ProtocolOptions,
    ) -> Result<bool, TransitionError> {
        Err(ctx.error(ErrorKind::Options, "ProtocolOptions.Terminal"))
    }
}
