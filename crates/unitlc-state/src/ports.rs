//! # Collaborator Ports
//!
//! The state machine never downloads, mounts, or loads anything itself. Each
//! external concern sits behind a narrow trait so the whole lifecycle can be
//! driven against real backends or the in-memory doubles in [`crate::sim`].
//!
//! | Port | Used by |
//! |---|---|
//! | [`BundleInstaller`] | CheckingStatus, Downloading, Releasing, Uninstalling, Mounting, Unmounting, AssetDependencyStreaming |
//! | [`AssetLoader`] | Registering, Loading, Unloading |
//! | [`UnitMounter`] | CheckingStatus, Mounting, Unmounting |
//! | [`DependencyResolver`] | the three dependency phases |
//! | [`LifecycleHooks`] | observer callbacks at each phase |
//! | [`ProgressSink`] | progress and status telemetry |
//!
//! Every port is `Send + Sync`: implementations may hand work to background
//! threads, which report back through the [`DriverQueue`](crate::DriverQueue).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use unitlc_core::{BundleId, InstallFlags, ReleaseFlags, UnitIdentifier, UnitId, UnitState};

use crate::batch::BatchItem;
use crate::queue::{BundleEventSink, Completer, DriverQueue};

// ─── Installer ───────────────────────────────────────────────────────

/// Installer readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallerInitState {
    /// Ready for requests.
    Succeeded,
    /// Still starting up; ask again later.
    NotInitialized,
    /// Will never become ready.
    Failed,
}

/// Local state of one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleInstallState {
    /// Not on disk.
    NotInstalled,
    /// On disk but out of date.
    NeedsUpdate,
    /// On disk and current.
    UpToDate,
}

/// Answer to [`BundleInstaller::install_state`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallStateInfo {
    /// Known bundles with their state. Requested bundles come first, then
    /// resolved dependencies when they were asked for.
    pub bundles: Vec<(BundleId, BundleInstallState)>,
    /// Bundles whose asset dependencies are streamed on demand.
    pub asset_stream_bundles: Vec<BundleId>,
}

/// Answer to an install, release, or stream request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Bundles with work queued. Each reports back through the sink.
    pub enqueued: Vec<BundleId>,
    /// Requested bundles the installer does not know.
    pub skipped_unknown: Vec<BundleId>,
}

/// Errors raised synchronously by an installer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallerError {
    /// The installer has not finished initialising.
    #[error("installer is not initialised")]
    NotInitialized,
    /// The installer does not know the bundle.
    #[error("unknown bundle: {0}")]
    UnknownBundle(BundleId),
    /// The installer refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl InstallerError {
    /// Short code used in transition error codes.
    pub fn code(&self) -> &str {
        match self {
            Self::NotInitialized => "Not_Initialized",
            Self::UnknownBundle(_) => "Unknown_Bundle",
            Self::Rejected(code) => code,
        }
    }
}

/// Downloads, mounts, releases, and streams installable bundles.
pub trait BundleInstaller: Send + Sync {
    /// Readiness of the installer.
    fn init_state(&self) -> InstallerInitState;

    /// Local state of `bundles`, optionally expanded with their dependencies.
    fn install_state(
        &self,
        bundles: &[BundleId],
        add_dependencies: bool,
    ) -> Result<InstallStateInfo, InstallerError>;

    /// Queue a download (and mount unless `SKIP_MOUNT`) of `bundles`.
    fn request_install(
        &self,
        bundles: &[BundleId],
        flags: InstallFlags,
        sink: BundleEventSink,
    ) -> Result<RequestInfo, InstallerError>;

    /// Abort outstanding installs. Each reports `Canceled` through its sink.
    fn cancel_install(&self, bundles: &[BundleId]);

    /// Pause outstanding installs.
    fn pause_install(&self, bundles: &[BundleId]);

    /// Resume paused installs.
    fn resume_install(&self, bundles: &[BundleId]);

    /// Change the flags of outstanding installs.
    fn update_install_flags(&self, bundles: &[BundleId], add: InstallFlags, remove: InstallFlags);

    /// Queue a release of `bundles`.
    fn request_release(
        &self,
        bundles: &[BundleId],
        flags: ReleaseFlags,
        sink: BundleEventSink,
    ) -> Result<RequestInfo, InstallerError>;

    /// Queue asset dependency streaming for `bundles`.
    fn request_stream(
        &self,
        bundles: &[BundleId],
        sink: BundleEventSink,
    ) -> Result<RequestInfo, InstallerError>;

    /// Abort outstanding streams.
    fn cancel_stream(&self, bundles: &[BundleId]);

    /// Combined download progress of `bundles` in `[0, 1]`, if known.
    fn install_progress(&self, _bundles: &[BundleId]) -> Option<f32> {
        None
    }
}

/// Installer for hosts that only serve `file:` units.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInstaller;

impl BundleInstaller for NoInstaller {
    fn init_state(&self) -> InstallerInitState {
        InstallerInitState::Failed
    }

    fn install_state(&self, _: &[BundleId], _: bool) -> Result<InstallStateInfo, InstallerError> {
        Err(InstallerError::NotInitialized)
    }

    fn request_install(
        &self,
        _: &[BundleId],
        _: InstallFlags,
        _: BundleEventSink,
    ) -> Result<RequestInfo, InstallerError> {
        Err(InstallerError::NotInitialized)
    }

    fn cancel_install(&self, _: &[BundleId]) {}

    fn pause_install(&self, _: &[BundleId]) {}

    fn resume_install(&self, _: &[BundleId]) {}

    fn update_install_flags(&self, _: &[BundleId], _: InstallFlags, _: InstallFlags) {}

    fn request_release(
        &self,
        _: &[BundleId],
        _: ReleaseFlags,
        _: BundleEventSink,
    ) -> Result<RequestInfo, InstallerError> {
        Err(InstallerError::NotInitialized)
    }

    fn request_stream(&self, _: &[BundleId], _: BundleEventSink) -> Result<RequestInfo, InstallerError> {
        Err(InstallerError::NotInitialized)
    }

    fn cancel_stream(&self, _: &[BundleId]) {}
}

// ─── Loader ──────────────────────────────────────────────────────────

/// Identifies an outstanding load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoadHandle(pub u64);

/// How a load finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadOutcome {
    /// Loaded.
    Loaded,
    /// The requested object does not exist.
    Missing,
    /// The load was canceled.
    Canceled,
}

/// Loads feature data and preload assets.
pub trait AssetLoader: Send + Sync {
    /// Whether feature data exists at `path`.
    fn feature_data_exists(&self, path: &str) -> bool;

    /// Start loading feature data. `done` must be completed exactly once.
    fn load_feature_data(&self, path: &str, done: Completer<LoadOutcome>) -> LoadHandle;

    /// Start loading the preload assets of `unit_name`. `None` means there is
    /// nothing to load and `done` is dropped unused.
    fn load_assets(&self, unit_name: &str, done: Completer<LoadOutcome>) -> Option<LoadHandle>;

    /// Block until `handle` finishes. Returns `false` on timeout.
    fn wait_until_complete(&self, handle: LoadHandle, timeout: Option<Duration>) -> bool;

    /// Abort a load. Its completer reports [`LoadOutcome::Canceled`].
    fn cancel(&self, handle: LoadHandle);

    /// Drop the preload assets of `unit_name`.
    fn unload_assets(&self, _unit_name: &str) {}
}

// ─── Mounter ─────────────────────────────────────────────────────────

/// Result of [`UnitMounter::mount_unit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountOutcome {
    /// The unit is registered with the host.
    Mounted,
    /// Another unit already uses the name.
    NameInUse,
    /// The host refused the unit.
    Failed,
}

/// Registers unit descriptors with the host.
pub trait UnitMounter: Send + Sync {
    /// Whether a descriptor exists at `path`.
    fn descriptor_exists(&self, path: &str) -> bool;

    /// Register the unit described at `descriptor_path` under `name`.
    fn mount_unit(&self, name: &str, descriptor_path: &str) -> MountOutcome;

    /// Remove a registered unit. Returns `false` if the host refused.
    fn unmount_unit(&self, name: &str) -> bool;
}

// ─── Dependencies ────────────────────────────────────────────────────

/// Lists the units a unit depends on.
pub trait DependencyResolver: Send + Sync {
    /// URLs of the units `unit` depends on.
    fn dependencies(&self, unit: &UnitIdentifier, descriptor_path: &str) -> Result<Vec<String>, String>;
}

/// Resolver for hosts without dependencies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependencies;

impl DependencyResolver for NoDependencies {
    fn dependencies(&self, _: &UnitIdentifier, _: &str) -> Result<Vec<String>, String> {
        Ok(Vec::new())
    }
}

// ─── Pausers ─────────────────────────────────────────────────────────

/// Lets hooks hold a state open until their own work finishes.
///
/// Every [`Pauser`] taken from the context must be resumed (or dropped)
/// before the state advances. The last resume wakes the unit.
#[derive(Debug, Clone)]
pub struct PauseContext {
    outstanding: Arc<AtomicUsize>,
    queue: DriverQueue,
    unit: UnitId,
}

impl PauseContext {
    pub(crate) fn new(queue: DriverQueue, unit: UnitId) -> Self {
        Self {
            outstanding: Arc::new(AtomicUsize::new(0)),
            queue,
            unit,
        }
    }

    /// Take a pauser.
    pub fn pauser(&self) -> Pauser {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Pauser {
            outstanding: self.outstanding.clone(),
            queue: self.queue.clone(),
            unit: self.unit,
        }
    }

    /// Pausers not yet resumed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// One hold on a [`PauseContext`]. Resumes on drop.
#[derive(Debug)]
pub struct Pauser {
    outstanding: Arc<AtomicUsize>,
    queue: DriverQueue,
    unit: UnitId,
}

impl Pauser {
    /// Release the hold.
    pub fn resume(self) {}
}

impl Drop for Pauser {
    fn drop(&mut self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.queue.request_update(self.unit);
        }
    }
}

/// Notification that a unit's work paused or resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseChange {
    /// State that paused.
    pub state: UnitState,
    /// Why.
    pub reason: String,
    /// `true` on pause, `false` on resume.
    pub paused: bool,
}

// ─── Hooks ───────────────────────────────────────────────────────────

/// Observer callbacks invoked on the driver thread. All default to no-ops.
#[allow(unused_variables)]
pub trait LifecycleHooks: Send + Sync {
    /// Status check finished and the unit is available.
    fn on_status_known(&self, unit: UnitId, name: &str) {}
    /// Download is starting.
    fn on_downloading(&self, unit: UnitId, name: &str) {}
    /// Data release is starting.
    fn on_releasing(&self, unit: UnitId, name: &str) {}
    /// About to mount.
    fn on_pre_mount(&self, unit: UnitId, name: &str) {}
    /// Mounted. Pausers taken from `pause` hold Mounting open.
    fn on_post_mount(&self, unit: UnitId, name: &str, pause: &PauseContext) {}
    /// Feature data loaded.
    fn on_registering(&self, unit: UnitId, name: &str) {}
    /// Feature data about to be dropped.
    fn on_unregistering(&self, unit: UnitId, name: &str) {}
    /// Preload assets loaded.
    fn on_loading(&self, unit: UnitId, name: &str) {}
    /// Preload assets about to be dropped.
    fn on_unloading(&self, unit: UnitId, name: &str) {}
    /// Activation finishing.
    fn on_activating(&self, unit: UnitId, name: &str) {}
    /// Unit became active.
    fn on_activated(&self, unit: UnitId, name: &str) {}
    /// Deactivation starting. Pausers taken from `pause` hold Deactivating open.
    fn on_deactivating(&self, unit: UnitId, name: &str, pause: &PauseContext) {}
    /// Unit reached Terminal.
    fn on_terminating(&self, unit: UnitId, url: &str) {}
    /// Work paused or resumed.
    fn on_pause_change(&self, unit: UnitId, change: &PauseChange) {}
    /// Contribute the unit's configuration during activation.
    fn initialize_config(&self, unit: UnitId, name: &str) {}
    /// Contribute configuration for a batch of activating units at once.
    fn initialize_config_batch(&self, units: &[BatchItem]) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

// ─── Progress ────────────────────────────────────────────────────────

/// Progress and status telemetry.
#[allow(unused_variables)]
pub trait ProgressSink: Send + Sync {
    /// Fractional progress of the work in `state`.
    fn on_progress(&self, unit: UnitId, state: UnitState, fraction: f32) {}
    /// A named phase began.
    fn on_status_event(&self, phase: &str, unit: UnitId) {}
}

/// Progress sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

// ─── Services ────────────────────────────────────────────────────────

/// The collaborators a subsystem drives its units against.
#[derive(Clone)]
pub struct Services {
    /// Bundle installer.
    pub installer: Arc<dyn BundleInstaller>,
    /// Feature data and asset loader.
    pub loader: Arc<dyn AssetLoader>,
    /// Host registration.
    pub mounter: Arc<dyn UnitMounter>,
    /// Dependency lookup.
    pub resolver: Arc<dyn DependencyResolver>,
    /// Observer callbacks.
    pub hooks: Arc<dyn LifecycleHooks>,
    /// Telemetry.
    pub progress: Arc<dyn ProgressSink>,
}

impl Services {
    /// Services with no installer, no dependencies, and no observers.
    pub fn new(loader: Arc<dyn AssetLoader>, mounter: Arc<dyn UnitMounter>) -> Self {
        Self {
            installer: Arc::new(NoInstaller),
            loader,
            mounter,
            resolver: Arc::new(NoDependencies),
            hooks: Arc::new(NoHooks),
            progress: Arc::new(NoProgress),
        }
    }

    /// Replace the installer.
    pub fn with_installer(mut self, installer: Arc<dyn BundleInstaller>) -> Self {
        self.installer = installer;
        self
    }

    /// Replace the dependency resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the progress sink.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
