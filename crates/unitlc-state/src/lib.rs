//! # unitlc-state: Unit Lifecycle State Machine
//!
//! Drives units (independently deliverable content modules) through the
//! 37-state lifecycle defined in `unitlc-core`, from discovery to active use
//! and back down to teardown.
//!
//! ## Architecture
//!
//! ```text
//!   host ──tick()──▶ UnitSubsystem ──drive──▶ UnitStateMachine ──▶ StateBehavior
//!                         ▲  │                                        │
//!                         │  └── BatchCoordinator, SharedBundleTracker │
//!                         │                                           ▼
//!                    DriverQueue ◀──── completions ──── ports (installer, loader, …)
//! ```
//!
//! - [`subsystem`]: the registry of live units and the drive loop.
//! - [`machine`]: per-unit state, properties, and callback lists.
//! - [`behavior`]: the per-state contract and the behavior table.
//! - [`states`]: the standard behavior of every state.
//! - [`dependency`]: the coordinator shared by the three dependency phases.
//! - [`batch`]: batching of per-unit work across units in the same state.
//! - [`bundles`]: reference counting of bundles shared between units.
//! - [`broadcast`]: completion callbacks and re-entrancy-safe broadcasts.
//! - [`queue`]: the thread-safe driver queue and one-shot completions.
//! - [`ports`]: traits for every external collaborator.
//! - [`sim`]: in-memory collaborators for tests and the CLI.
//!
//! ## Crate Policy
//!
//! - One driver thread owns the subsystem. Collaborators report back only
//!   through the [`DriverQueue`].
//! - Transition failures are values delivered to callbacks. Panics are
//!   reserved for violated invariants of the drive loop.

pub mod batch;
pub mod behavior;
pub mod broadcast;
pub mod bundles;
pub mod dependency;
pub mod machine;
pub mod ports;
pub mod queue;
pub mod sim;
pub mod states;
pub mod subsystem;

// ─── Driver re-exports ──────────────────────────────────────────────

pub use subsystem::{DestinationRequest, TickSummary, UnitSubsystem, MAX_TRANSITIONS};
pub use machine::{UnitProperties, UnitSnapshot, UnitStateMachine};
pub use queue::{
    BundleEvent, BundleEventSink, BundleFailure, BundleOp, Completer, DriverEvent, DriverQueue, PendingResult,
};

// ─── Behavior re-exports ────────────────────────────────────────────

pub use behavior::{BehaviorTable, StateBehavior, StateContext, StateStep};
pub use dependency::{ActivatingPolicy, DeactivatingPolicy, DependencyCoordinator, DependencyPolicy, WaitingPolicy};

// ─── Callback re-exports ────────────────────────────────────────────

pub use broadcast::{CallbackHandle, Removal, TransitionOutcome};

// ─── Shared resource re-exports ─────────────────────────────────────

pub use batch::{BatchCoordinator, BatchItem};
pub use bundles::{BundleDepth, SharedBundleTracker};

// ─── Port re-exports ────────────────────────────────────────────────

pub use ports::{
    AssetLoader, BundleInstallState, BundleInstaller, DependencyResolver, InstallerError, InstallerInitState,
    LifecycleHooks, LoadHandle, LoadOutcome, MountOutcome, PauseChange, PauseContext, Pauser, ProgressSink,
    Services,
};
