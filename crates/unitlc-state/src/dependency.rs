//! # Dependency Coordination
//!
//! WaitingForDependencies, DeactivatingDependencies, and
//! ActivatingDependencies share one behavior, [`DependencyCoordinator`],
//! parameterised by a [`DependencyPolicy`]:
//!
//! | Policy | Lookup | Range | Success | Error | Waits |
//! |---|---|---|---|---|---|
//! | [`WaitingPolicy`] | find or create | Registered..Active | AssetDependencyStreaming or Registering | ErrorWaitingForDependencies | always |
//! | [`DeactivatingPolicy`] | find | Terminal..Loaded | Deactivating | ErrorDeactivatingDependencies | per config |
//! | [`ActivatingPolicy`] | find | Active | Activating | ErrorActivatingDependencies | always |
//!
//! On the first update of a visit the coordinator asks the resolver for the
//! unit's dependencies and requests each into the policy's range. Every
//! request becomes an edge. Completions remove the edge on success or store
//! the error on it, then drive the dependent immediately. The dependent
//! advances once no edge remains and fails on the first edge that errored.
//!
//! A request the dependency rejects (its running destination does not
//! overlap) falls back to canceling the dependency and retrying once the
//! cancel lands. A dependency that was canceled all the way to Terminal is
//! replaced by a fresh unit for the same URL.
//!
//! Callbacks registered on dependencies carry the coordinator's owner token.
//! Leaving or re-entering the state withdraws them, including from any
//! broadcast already running, and swaps in a fresh edge list so late
//! completions from an earlier visit find nothing to update.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use unitlc_core::{
    CoreError, ErrorKind, LifecycleConfig, OwnerId, Protocol, ProtocolOptions, StateRange, TransitionError,
    TransitionResult, UnitId, UnitState,
};

use crate::behavior::{StateBehavior, StateContext, StateStep};
use crate::broadcast::Removal;
use crate::states::realtime_defer;
use crate::subsystem::UnitSubsystem;

/// The per-phase choices of a dependency state.
pub trait DependencyPolicy {
    /// The dependency state this policy drives.
    fn phase(&self) -> UnitState;

    /// Where each dependency is sent.
    fn target_range(&self) -> StateRange;

    /// Where the dependent goes once every dependency arrived.
    fn success_state(&self, config: &LifecycleConfig) -> UnitState;

    /// Where the dependent goes when a dependency fails.
    fn error_state(&self) -> UnitState;

    /// Whether the dependent waits for its dependencies to arrive.
    fn should_wait(&self, config: &LifecycleConfig) -> bool;

    /// Whether dependencies are taken out of batch processing first.
    fn exclude_dependencies_from_batching(&self) -> bool {
        false
    }

    /// The unit to drive for dependency `url`. `Ok(None)` skips it.
    fn lookup(
        &self,
        subsystem: &mut UnitSubsystem,
        url: &str,
        options: Option<ProtocolOptions>,
    ) -> Result<Option<UnitId>, CoreError>;
}

/// Bring dependencies up to at least Registered before registering.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitingPolicy;

impl DependencyPolicy for WaitingPolicy {
    fn phase(&self) -> UnitState {
        UnitState::WaitingForDependencies
    }

    fn target_range(&self) -> StateRange {
        StateRange::spanning(UnitState::Registered, UnitState::Active)
    }

    fn success_state(&self, config: &LifecycleConfig) -> UnitState {
        if config.enable_asset_streaming {
            UnitState::AssetDependencyStreaming
        } else {
            UnitState::Registering
        }
    }

    fn error_state(&self) -> UnitState {
        UnitState::ErrorWaitingForDependencies
    }

    fn should_wait(&self, _config: &LifecycleConfig) -> bool {
        true
    }

    fn lookup(
        &self,
        subsystem: &mut UnitSubsystem,
        url: &str,
        options: Option<ProtocolOptions>,
    ) -> Result<Option<UnitId>, CoreError> {
        subsystem.find_or_create(url, options).map(Some)
    }
}

/// Take live dependencies down to Loaded or below before deactivating.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeactivatingPolicy;

impl DependencyPolicy for DeactivatingPolicy {
    fn phase(&self) -> UnitState {
        UnitState::DeactivatingDependencies
    }

    fn target_range(&self) -> StateRange {
        StateRange::spanning(UnitState::Terminal, UnitState::Loaded)
    }

    fn success_state(&self, _config: &LifecycleConfig) -> UnitState {
        UnitState::Deactivating
    }

    fn error_state(&self) -> UnitState {
        UnitState::ErrorDeactivatingDependencies
    }

    fn should_wait(&self, config: &LifecycleConfig) -> bool {
        config.wait_for_dependency_deactivation
    }

    fn lookup(
        &self,
        subsystem: &mut UnitSubsystem,
        url: &str,
        _options: Option<ProtocolOptions>,
    ) -> Result<Option<UnitId>, CoreError> {
        Ok(subsystem.find(url))
    }
}

/// Activate live dependencies before activating.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActivatingPolicy;

impl DependencyPolicy for ActivatingPolicy {
    fn phase(&self) -> UnitState {
        UnitState::ActivatingDependencies
    }

    fn target_range(&self) -> StateRange {
        StateRange::single(UnitState::Active)
    }

    fn success_state(&self, _config: &LifecycleConfig) -> UnitState {
        UnitState::Activating
    }

    fn error_state(&self) -> UnitState {
        UnitState::ErrorActivatingDependencies
    }

    fn should_wait(&self, _config: &LifecycleConfig) -> bool {
        true
    }

    fn exclude_dependencies_from_batching(&self) -> bool {
        true
    }

    fn lookup(
        &self,
        subsystem: &mut UnitSubsystem,
        url: &str,
        _options: Option<ProtocolOptions>,
    ) -> Result<Option<UnitId>, CoreError> {
        Ok(subsystem.find(url))
    }
}

#[derive(Debug)]
struct Edge {
    dependency: UnitId,
    url: String,
    error: Option<TransitionError>,
}

type Edges = Rc<RefCell<Vec<Edge>>>;

/// What a dependency callback needs to find its way back.
#[derive(Debug, Clone)]
struct Link {
    dependent: UnitId,
    owner: OwnerId,
    edges: Weak<RefCell<Vec<Edge>>>,
    phase: UnitState,
    range: StateRange,
    wait: bool,
    exclude_from_batching: bool,
    /// The dependent's options recycled for a replacement dependency.
    recycled: Option<ProtocolOptions>,
}

impl Link {
    fn failed(&self) -> TransitionError {
        TransitionError::new(self.phase, ErrorKind::Dependency, "Failed_Dependency_Transition")
    }

    /// Send `dependency` into the target range. With `allow_cancel`, a
    /// rejected request cancels the dependency and retries afterwards.
    fn request(&self, subsystem: &mut UnitSubsystem, dependency: UnitId, allow_cancel: bool) {
        if self.exclude_from_batching {
            subsystem.exclude_from_batch_processing(dependency);
        }

        let accepted = if self.wait {
            let link = self.clone();
            subsystem
                .set_destination_with_owner(dependency, self.range, Some(self.owner), move |sub, outcome| {
                    link.complete(sub, outcome.unit, outcome.result.clone())
                })
                .accepted()
        } else {
            let accepted = subsystem
                .set_destination(dependency, self.range, |_, outcome| {
                    if let Err(error) = &outcome.result {
                        if error.is_canceled() {
                            tracing::info!(dependency = %outcome.unit, "dependency transition canceled by another request");
                        } else {
                            tracing::warn!(dependency = %outcome.unit, error = %error, "dependency failed to transition");
                        }
                    }
                })
                .accepted();
            if accepted {
                self.complete(subsystem, dependency, Ok(()));
            }
            accepted
        };
        if accepted {
            return;
        }

        if allow_cancel {
            let link = self.clone();
            let cancel_pending = subsystem.try_cancel_with_owner(dependency, Some(self.owner), move |sub, canceled| {
                link.on_canceled(sub, canceled)
            });
            if cancel_pending {
                return;
            }
        }
        tracing::warn!(unit = %self.dependent, dependency = %dependency, range = %self.range, "dependency refused the request");
        self.complete(subsystem, dependency, Err(self.failed()));
    }

    fn on_canceled(&self, subsystem: &mut UnitSubsystem, canceled: UnitId) {
        let Some(edges) = self.edges.upgrade() else {
            return;
        };
        let mut dependency = canceled;

        if matches!(subsystem.state_of(canceled), None | Some(UnitState::Terminal)) {
            let url = edges
                .borrow()
                .iter()
                .find(|edge| edge.dependency == canceled)
                .map(|edge| edge.url.clone());
            let Some(url) = url else {
                return;
            };
            let options = self
                .recycled
                .clone()
                .filter(|_| Protocol::of_url(&url) == Some(Protocol::InstallBundle));
            match subsystem.find_or_create(&url, options) {
                Ok(replacement) => {
                    if let Some(edge) = edges.borrow_mut().iter_mut().find(|edge| edge.dependency == canceled) {
                        edge.dependency = replacement;
                    }
                    subsystem.remove_pending_transition_callback(canceled, Removal::Owner(self.owner));
                    subsystem.remove_pending_cancel_callback(canceled, Removal::Owner(self.owner));
                    tracing::debug!(unit = %self.dependent, old = %canceled, new = %replacement, "replaced terminal dependency");
                    dependency = replacement;
                }
                Err(error) => {
                    tracing::warn!(unit = %self.dependent, url = %url, error = %error, "could not recreate dependency");
                    self.complete(subsystem, canceled, Err(self.failed()));
                    return;
                }
            }
        }

        drop(edges);
        self.request(subsystem, dependency, false);
    }

    fn complete(&self, subsystem: &mut UnitSubsystem, dependency: UnitId, result: TransitionResult) {
        let Some(edges) = self.edges.upgrade() else {
            return;
        };
        {
            let mut edges = edges.borrow_mut();
            let Some(idx) = edges.iter().position(|edge| edge.dependency == dependency) else {
                return;
            };
            match result {
                Ok(()) => {
                    edges.swap_remove(idx);
                }
                Err(error) => edges[idx].error = Some(error),
            }
        }
        subsystem.update_immediate(self.dependent);
    }
}

/// Behavior shared by the three dependency states.
#[derive(Debug)]
pub struct DependencyCoordinator<P> {
    policy: P,
    edges: Edges,
    owner: OwnerId,
    queried: bool,
    realtime_deferred: bool,
}

impl<P: DependencyPolicy> DependencyCoordinator<P> {
    /// A coordinator driven by `policy`.
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            edges: Rc::new(RefCell::new(Vec::new())),
            owner: OwnerId::new(),
            queried: false,
            realtime_deferred: false,
        }
    }

    /// Dependencies still outstanding or failed.
    pub fn outstanding(&self) -> Vec<UnitId> {
        self.edges.borrow().iter().map(|edge| edge.dependency).collect()
    }

    fn link(&self, ctx: &StateContext<'_>) -> Link {
        let recycled = ctx
            .props
            .options
            .install_bundle()
            .map(|_| ctx.props.options.recycled());
        Link {
            dependent: ctx.unit,
            owner: self.owner,
            edges: Rc::downgrade(&self.edges),
            phase: self.policy.phase(),
            range: self.policy.target_range(),
            wait: self.policy.should_wait(ctx.config()),
            exclude_from_batching: self.policy.exclude_dependencies_from_batching(),
            recycled,
        }
    }

    fn fail(&self, ctx: &StateContext<'_>, code: &str) -> StateStep {
        StateStep::fail(self.policy.error_state(), ctx.error(ErrorKind::Dependency, code))
    }

    /// Resolve the dependency list and request every dependency.
    fn query(&mut self, ctx: &mut StateContext<'_>) -> Result<(), StateStep> {
        let resolver = ctx.services().resolver;
        let urls = resolver
            .dependencies(&ctx.props.identifier, &ctx.props.descriptor_path)
            .map_err(|reason| {
                tracing::warn!(unit = %ctx.unit, reason = %reason, "dependency query failed");
                self.fail(ctx, "Failed_Dependency_Query")
            })?;

        let recycled = ctx
            .props
            .options
            .install_bundle()
            .map(|_| ctx.props.options.recycled());
        let mut found = Vec::with_capacity(urls.len());
        for url in urls {
            let options = recycled
                .clone()
                .filter(|_| Protocol::of_url(&url) == Some(Protocol::InstallBundle));
            match self.policy.lookup(ctx.subsystem, &url, options) {
                Ok(Some(dependency)) => found.push((dependency, url)),
                Ok(None) => tracing::trace!(unit = %ctx.unit, url = %url, "dependency not live; skipped"),
                Err(error) => {
                    tracing::warn!(unit = %ctx.unit, url = %url, error = %error, "dependency lookup failed");
                    return Err(self.fail(ctx, "Failed_Dependency_Query"));
                }
            }
        }
        self.queried = true;

        let link = self.link(ctx);
        for (dependency, url) in found {
            if link.wait {
                let stuck = matches!(
                    ctx.subsystem.state_of(dependency),
                    Some(UnitState::ErrorRegistering | UnitState::ErrorWaitingForDependencies)
                ) && ctx.subsystem.is_unrecoverable(dependency);
                if stuck {
                    ctx.props.unrecoverable = true;
                    tracing::error!(unit = %ctx.unit, dependency = %dependency, url = %url, "dependency is unrecoverable");
                    return Err(self.fail(ctx, "Failed_Dependency_Transition"));
                }
            }
            self.edges.borrow_mut().push(Edge {
                dependency,
                url,
                error: None,
            });
            link.request(ctx.subsystem, dependency, true);
        }
        Ok(())
    }

    /// Withdraw every callback this visit registered and start over.
    fn reset(&mut self, ctx: &mut StateContext<'_>) {
        let dependencies = self.outstanding();
        for dependency in dependencies {
            ctx.subsystem
                .remove_pending_transition_callback(dependency, Removal::Owner(self.owner));
            ctx.subsystem
                .remove_pending_cancel_callback(dependency, Removal::Owner(self.owner));
        }
        ctx.subsystem.scrub_broadcasts(Removal::Owner(self.owner));
        self.edges = Rc::new(RefCell::new(Vec::new()));
        self.owner = OwnerId::new();
        self.queried = false;
    }
}

impl<P: DependencyPolicy> StateBehavior for DependencyCoordinator<P> {
    fn begin_state(&mut self, ctx: &mut StateContext<'_>) {
        self.reset(ctx);
        self.realtime_deferred = false;
    }

    fn update_state(&mut self, ctx: &mut StateContext<'_>) -> StateStep {
        if realtime_defer(ctx, &mut self.realtime_deferred) {
            return StateStep::Hold;
        }
        if !self.queried {
            if let Err(step) = self.query(ctx) {
                return step;
            }
        }

        let edges: Vec<(UnitId, Option<TransitionError>)> = self
            .edges
            .borrow()
            .iter()
            .map(|edge| (edge.dependency, edge.error.clone()))
            .collect();
        for (dependency, error) in &edges {
            if ctx.subsystem.state_of(*dependency).is_none() {
                tracing::error!(unit = %ctx.unit, dependency = %dependency, "dependency destroyed before finishing");
                return self.fail(ctx, "Dependency_Destroyed_Before_Finish");
            }
            if let Some(error) = error {
                if ctx.subsystem.is_unrecoverable(*dependency) {
                    ctx.props.unrecoverable = true;
                }
                tracing::error!(unit = %ctx.unit, dependency = %dependency, error = %error, "dependency failed to transition");
                return self.fail(ctx, "Failed_Dependency_Transition");
            }
        }

        if edges.is_empty() {
            StateStep::Advance(self.policy.success_state(ctx.config()))
        } else {
            StateStep::Hold
        }
    }

    fn end_state(&mut self, ctx: &mut StateContext<'_>) {
        self.reset(ctx);
    }
}
