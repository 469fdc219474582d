//! # Simulated Collaborators
//!
//! In-memory implementations of every port, used by the integration tests
//! and by the `unitlc run` command. Each double keeps its state behind a
//! `parking_lot` mutex so it can be completed from a worker thread while the
//! driver owns the subsystem.
//!
//! Installer and loader work either completes as soon as it is requested
//! ([`CompletionMode::Immediate`]) or waits in a queue until the test (or
//! the CLI's latency task) calls `complete_all` ([`CompletionMode::Manual`]).
//! Completions always travel through the [`DriverQueue`](crate::DriverQueue),
//! so they are observed on the next tick either way.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use unitlc_core::{BundleId, InstallFlags, ReleaseFlags, UnitId, UnitIdentifier, UnitState};

use crate::batch::BatchItem;
use crate::ports::{
    AssetLoader, BundleInstallState, BundleInstaller, DependencyResolver, InstallStateInfo, InstallerError,
    InstallerInitState, LifecycleHooks, LoadHandle, LoadOutcome, MountOutcome, PauseChange, PauseContext,
    Pauser, ProgressSink, RequestInfo, Services, UnitMounter,
};
use crate::queue::{BundleEventSink, BundleFailure, BundleOp, Completer};

/// When simulated async work reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// As soon as it is requested.
    #[default]
    Immediate,
    /// When `complete_all` is called.
    Manual,
}

// ─── Installer ───────────────────────────────────────────────────────

/// One bundle known to the [`SimInstaller`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimBundle {
    /// Local state before any request.
    pub state: BundleInstallState,
    /// Bundles reported alongside this one when dependencies are requested.
    pub dependencies: Vec<BundleId>,
    /// Asset dependencies are streamed on demand.
    pub asset_stream: bool,
    /// Installs of this bundle fail with this code.
    pub fail_install: Option<String>,
}

impl Default for SimBundle {
    fn default() -> Self {
        Self {
            state: BundleInstallState::NotInstalled,
            dependencies: Vec::new(),
            asset_stream: false,
            fail_install: None,
        }
    }
}

/// A call the [`SimInstaller`] received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerCall {
    Install(Vec<BundleId>, InstallFlags),
    Release(Vec<BundleId>, ReleaseFlags),
    Stream(Vec<BundleId>),
    CancelInstall(Vec<BundleId>),
    CancelStream(Vec<BundleId>),
    Pause(Vec<BundleId>),
    Resume(Vec<BundleId>),
    UpdateFlags(Vec<BundleId>, InstallFlags, InstallFlags),
}

struct QueuedOp {
    op: BundleOp,
    bundle: BundleId,
    flags: ReleaseFlags,
    sink: BundleEventSink,
}

struct InstallerInner {
    init: InstallerInitState,
    mode: CompletionMode,
    bundles: BTreeMap<BundleId, SimBundle>,
    queued: Vec<QueuedOp>,
    paused: BTreeSet<BundleId>,
    calls: Vec<InstallerCall>,
}

impl InstallerInner {
    fn finish(&mut self, op: QueuedOp) {
        let result = match op.op {
            BundleOp::Install => {
                let failure = self.bundles.get(&op.bundle).and_then(|b| b.fail_install.clone());
                match failure {
                    Some(code) => Err(BundleFailure::Failed(code)),
                    None => {
                        if let Some(bundle) = self.bundles.get_mut(&op.bundle) {
                            bundle.state = BundleInstallState::UpToDate;
                        }
                        Ok(())
                    }
                }
            }
            BundleOp::Release => {
                if op.flags.contains(ReleaseFlags::REMOVE_FILES_IF_POSSIBLE) {
                    if let Some(bundle) = self.bundles.get_mut(&op.bundle) {
                        bundle.state = BundleInstallState::NotInstalled;
                    }
                }
                Ok(())
            }
            BundleOp::Stream => Ok(()),
        };
        op.sink.complete(op.op, op.bundle, result);
    }

    fn enqueue(
        &mut self,
        op: BundleOp,
        bundles: &[BundleId],
        flags: ReleaseFlags,
        sink: BundleEventSink,
    ) -> Result<RequestInfo, InstallerError> {
        if self.init != InstallerInitState::Succeeded {
            return Err(InstallerError::NotInitialized);
        }
        let mut info = RequestInfo::default();
        for bundle in bundles {
            if !self.bundles.contains_key(bundle) {
                info.skipped_unknown.push(bundle.clone());
                continue;
            }
            info.enqueued.push(bundle.clone());
            let queued = QueuedOp {
                op,
                bundle: bundle.clone(),
                flags,
                sink: sink.clone(),
            };
            match self.mode {
                CompletionMode::Immediate => self.finish(queued),
                CompletionMode::Manual => self.queued.push(queued),
            }
        }
        Ok(info)
    }

    fn cancel(&mut self, op: BundleOp, bundles: &[BundleId]) {
        let (canceled, kept): (Vec<QueuedOp>, Vec<QueuedOp>) = std::mem::take(&mut self.queued)
            .into_iter()
            .partition(|queued| queued.op == op && bundles.contains(&queued.bundle));
        self.queued = kept;
        for queued in canceled {
            self.paused.remove(&queued.bundle);
            queued
                .sink
                .complete(queued.op, queued.bundle, Err(BundleFailure::Canceled));
        }
    }
}

/// In-memory [`BundleInstaller`].
pub struct SimInstaller {
    inner: Mutex<InstallerInner>,
}

impl SimInstaller {
    /// An initialised installer that knows no bundles.
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            inner: Mutex::new(InstallerInner {
                init: InstallerInitState::Succeeded,
                mode,
                bundles: BTreeMap::new(),
                queued: Vec::new(),
                paused: BTreeSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Make `bundle` known.
    pub fn add_bundle(&self, bundle: BundleId, known: SimBundle) {
        self.inner.lock().bundles.insert(bundle, known);
    }

    /// Change readiness.
    pub fn set_init_state(&self, init: InstallerInitState) {
        self.inner.lock().init = init;
    }

    /// Change when work reports back. Already queued work stays queued.
    pub fn set_mode(&self, mode: CompletionMode) {
        self.inner.lock().mode = mode;
    }

    /// Local state of a known bundle.
    pub fn bundle_state(&self, bundle: &BundleId) -> Option<BundleInstallState> {
        self.inner.lock().bundles.get(bundle).map(|b| b.state)
    }

    /// Report back every queued operation that is not paused.
    pub fn complete_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let paused = inner.paused.clone();
        let (ready, held): (Vec<QueuedOp>, Vec<QueuedOp>) = std::mem::take(&mut inner.queued)
            .into_iter()
            .partition(|queued| queued.op != BundleOp::Install || !paused.contains(&queued.bundle));
        inner.queued = held;
        let count = ready.len();
        for queued in ready {
            inner.finish(queued);
        }
        count
    }

    /// Operations still queued.
    pub fn pending_ops(&self) -> usize {
        self.inner.lock().queued.len()
    }

    /// Whether installs of `bundle` are paused.
    pub fn is_paused(&self, bundle: &BundleId) -> bool {
        self.inner.lock().paused.contains(bundle)
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<InstallerCall> {
        self.inner.lock().calls.clone()
    }
}

impl Default for SimInstaller {
    fn default() -> Self {
        Self::new(CompletionMode::Immediate)
    }
}

impl std::fmt::Debug for SimInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SimInstaller")
            .field("init", &inner.init)
            .field("mode", &inner.mode)
            .field("bundles", &inner.bundles.len())
            .field("queued", &inner.queued.len())
            .finish()
    }
}

impl BundleInstaller for SimInstaller {
    fn init_state(&self) -> InstallerInitState {
        self.inner.lock().init
    }

    fn install_state(
        &self,
        bundles: &[BundleId],
        add_dependencies: bool,
    ) -> Result<InstallStateInfo, InstallerError> {
        let inner = self.inner.lock();
        if inner.init != InstallerInitState::Succeeded {
            return Err(InstallerError::NotInitialized);
        }
        let mut info = InstallStateInfo::default();
        let mut seen = BTreeSet::new();
        let mut push = |info: &mut InstallStateInfo, bundle: &BundleId| {
            let Some(known) = inner.bundles.get(bundle) else {
                return;
            };
            if !seen.insert(bundle.clone()) {
                return;
            }
            info.bundles.push((bundle.clone(), known.state));
            if known.asset_stream {
                info.asset_stream_bundles.push(bundle.clone());
            }
        };
        for bundle in bundles {
            push(&mut info, bundle);
        }
        if add_dependencies {
            for bundle in bundles {
                if let Some(known) = inner.bundles.get(bundle) {
                    for dependency in &known.dependencies {
                        push(&mut info, dependency);
                    }
                }
            }
        }
        Ok(info)
    }

    fn request_install(
        &self,
        bundles: &[BundleId],
        flags: InstallFlags,
        sink: BundleEventSink,
    ) -> Result<RequestInfo, InstallerError> {
        let mut inner = self.inner.lock();
        inner.calls.push(InstallerCall::Install(bundles.to_vec(), flags));
        inner.enqueue(BundleOp::Install, bundles, ReleaseFlags::empty(), sink)
    }

    fn cancel_install(&self, bundles: &[BundleId]) {
        let mut inner = self.inner.lock();
        inner.calls.push(InstallerCall::CancelInstall(bundles.to_vec()));
        inner.cancel(BundleOp::Install, bundles);
    }

    fn pause_install(&self, bundles: &[BundleId]) {
        let mut inner = self.inner.lock();
        inner.calls.push(InstallerCall::Pause(bundles.to_vec()));
        inner.paused.extend(bundles.iter().cloned());
    }

    fn resume_install(&self, bundles: &[BundleId]) {
        let mut inner = self.inner.lock();
        inner.calls.push(InstallerCall::Resume(bundles.to_vec()));
        for bundle in bundles {
            inner.paused.remove(bundle);
        }
    }

    fn update_install_flags(&self, bundles: &[BundleId], add: InstallFlags, remove: InstallFlags) {
        self.inner
            .lock()
            .calls
            .push(InstallerCall::UpdateFlags(bundles.to_vec(), add, remove));
    }

    fn request_release(
        &self,
        bundles: &[BundleId],
        flags: ReleaseFlags,
        sink: BundleEventSink,
    ) -> Result<RequestInfo, InstallerError> {
        let mut inner = self.inner.lock();
        inner.calls.push(InstallerCall::Release(bundles.to_vec(), flags));
        inner.enqueue(BundleOp::Release, bundles, flags, sink)
    }

    fn request_stream(
        &self,
        bundles: &[BundleId],
        sink: BundleEventSink,
    ) -> Result<RequestInfo, InstallerError> {
        let mut inner = self.inner.lock();
        inner.calls.push(InstallerCall::Stream(bundles.to_vec()));
        inner.enqueue(BundleOp::Stream, bundles, ReleaseFlags::empty(), sink)
    }

    fn cancel_stream(&self, bundles: &[BundleId]) {
        let mut inner = self.inner.lock();
        inner.calls.push(InstallerCall::CancelStream(bundles.to_vec()));
        inner.cancel(BundleOp::Stream, bundles);
    }
}

// ─── Loader ──────────────────────────────────────────────────────────

struct LoaderInner {
    mode: CompletionMode,
    next_handle: u64,
    feature_data: BTreeSet<String>,
    missing: BTreeSet<String>,
    preload: BTreeSet<String>,
    outstanding: BTreeMap<LoadHandle, (Completer<LoadOutcome>, LoadOutcome)>,
    unloaded: Vec<String>,
}

impl LoaderInner {
    fn start(&mut self, done: Completer<LoadOutcome>, outcome: LoadOutcome) -> LoadHandle {
        self.next_handle += 1;
        let handle = LoadHandle(self.next_handle);
        match self.mode {
            CompletionMode::Immediate => done.complete(outcome),
            CompletionMode::Manual => {
                self.outstanding.insert(handle, (done, outcome));
            }
        }
        handle
    }
}

/// In-memory [`AssetLoader`].
///
/// Feature data loads succeed unless the path was marked missing. Units
/// have preload assets only when listed with [`SimLoader::add_preload`].
pub struct SimLoader {
    inner: Mutex<LoaderInner>,
}

impl SimLoader {
    /// A loader with no feature data and no preloads.
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            inner: Mutex::new(LoaderInner {
                mode,
                next_handle: 0,
                feature_data: BTreeSet::new(),
                missing: BTreeSet::new(),
                preload: BTreeSet::new(),
                outstanding: BTreeMap::new(),
                unloaded: Vec::new(),
            }),
        }
    }

    /// Report feature data at `path` as existing.
    pub fn add_feature_data(&self, path: impl Into<String>) {
        self.inner.lock().feature_data.insert(path.into());
    }

    /// Loads of `path` report [`LoadOutcome::Missing`].
    pub fn mark_missing(&self, path: impl Into<String>) {
        self.inner.lock().missing.insert(path.into());
    }

    /// Give `unit_name` preload assets.
    pub fn add_preload(&self, unit_name: impl Into<String>) {
        self.inner.lock().preload.insert(unit_name.into());
    }

    /// Change when loads report back.
    pub fn set_mode(&self, mode: CompletionMode) {
        self.inner.lock().mode = mode;
    }

    /// Report back every outstanding load.
    pub fn complete_all(&self) -> usize {
        let outstanding = std::mem::take(&mut self.inner.lock().outstanding);
        let count = outstanding.len();
        for (_, (done, outcome)) in outstanding {
            done.complete(outcome);
        }
        count
    }

    /// Loads not yet reported back.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    /// Unit names whose assets were unloaded, in order.
    pub fn unloaded(&self) -> Vec<String> {
        self.inner.lock().unloaded.clone()
    }
}

impl Default for SimLoader {
    fn default() -> Self {
        Self::new(CompletionMode::Immediate)
    }
}

impl std::fmt::Debug for SimLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SimLoader")
            .field("mode", &inner.mode)
            .field("outstanding", &inner.outstanding.len())
            .finish_non_exhaustive()
    }
}

impl AssetLoader for SimLoader {
    fn feature_data_exists(&self, path: &str) -> bool {
        self.inner.lock().feature_data.contains(path)
    }

    fn load_feature_data(&self, path: &str, done: Completer<LoadOutcome>) -> LoadHandle {
        let mut inner = self.inner.lock();
        let outcome = if inner.missing.contains(path) {
            LoadOutcome::Missing
        } else {
            LoadOutcome::Loaded
        };
        inner.start(done, outcome)
    }

    fn load_assets(&self, unit_name: &str, done: Completer<LoadOutcome>) -> Option<LoadHandle> {
        let mut inner = self.inner.lock();
        if !inner.preload.contains(unit_name) {
            return None;
        }
        Some(inner.start(done, LoadOutcome::Loaded))
    }

    fn wait_until_complete(&self, handle: LoadHandle, _timeout: Option<Duration>) -> bool {
        let entry = self.inner.lock().outstanding.remove(&handle);
        if let Some((done, outcome)) = entry {
            done.complete(outcome);
        }
        true
    }

    fn cancel(&self, handle: LoadHandle) {
        let entry = self.inner.lock().outstanding.remove(&handle);
        if let Some((done, _)) = entry {
            done.complete(LoadOutcome::Canceled);
        }
    }

    fn unload_assets(&self, unit_name: &str) {
        self.inner.lock().unloaded.push(unit_name.to_string());
    }
}

// ─── Mounter ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MounterInner {
    mounted: BTreeSet<String>,
    failing: BTreeSet<String>,
    missing_descriptors: BTreeSet<String>,
    refuse_unmount: BTreeSet<String>,
}

/// In-memory [`UnitMounter`]. Every descriptor exists unless marked missing.
#[derive(Debug, Default)]
pub struct SimMounter {
    inner: Mutex<MounterInner>,
}

impl SimMounter {
    /// An empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the descriptor at `path` as absent.
    pub fn mark_descriptor_missing(&self, path: impl Into<String>) {
        self.inner.lock().missing_descriptors.insert(path.into());
    }

    /// Refuse to mount `name`.
    pub fn fail_mount(&self, name: impl Into<String>) {
        self.inner.lock().failing.insert(name.into());
    }

    /// Refuse to unmount `name`.
    pub fn refuse_unmount(&self, name: impl Into<String>) {
        self.inner.lock().refuse_unmount.insert(name.into());
    }

    /// Register `name` as if another unit already used it.
    pub fn occupy(&self, name: impl Into<String>) {
        self.inner.lock().mounted.insert(name.into());
    }

    /// Whether `name` is mounted.
    pub fn is_mounted(&self, name: &str) -> bool {
        self.inner.lock().mounted.contains(name)
    }
}

impl UnitMounter for SimMounter {
    fn descriptor_exists(&self, path: &str) -> bool {
        !self.inner.lock().missing_descriptors.contains(path)
    }

    fn mount_unit(&self, name: &str, _descriptor_path: &str) -> MountOutcome {
        let mut inner = self.inner.lock();
        if inner.failing.contains(name) {
            return MountOutcome::Failed;
        }
        if !inner.mounted.insert(name.to_string()) {
            return MountOutcome::NameInUse;
        }
        MountOutcome::Mounted
    }

    fn unmount_unit(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.refuse_unmount.contains(name) {
            return false;
        }
        inner.mounted.remove(name);
        true
    }
}

// ─── Dependencies ────────────────────────────────────────────────────

/// [`DependencyResolver`] backed by a fixed table keyed by identifying URL.
#[derive(Debug, Default)]
pub struct StaticDependencies {
    table: Mutex<BTreeMap<String, Vec<String>>>,
    failing: Mutex<BTreeSet<String>>,
}

impl StaticDependencies {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `unit_url` depends on `dependency_url`.
    pub fn add(&self, unit_url: &str, dependency_url: impl Into<String>) {
        let key = identifying(unit_url);
        self.table.lock().entry(key).or_default().push(dependency_url.into());
    }

    /// Make the query for `unit_url` fail.
    pub fn fail_query(&self, unit_url: &str) {
        self.failing.lock().insert(identifying(unit_url));
    }
}

fn identifying(url: &str) -> String {
    UnitIdentifier::new(url)
        .map(|id| id.identifying_str().to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl DependencyResolver for StaticDependencies {
    fn dependencies(&self, unit: &UnitIdentifier, _descriptor_path: &str) -> Result<Vec<String>, String> {
        let key = unit.identifying_str();
        if self.failing.lock().contains(key) {
            return Err(format!("dependency query failed for {key}"));
        }
        Ok(self.table.lock().get(key).cloned().unwrap_or_default())
    }
}

// ─── Hooks ───────────────────────────────────────────────────────────

/// A hook invocation observed by [`RecordingHooks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hook", content = "unit", rename_all = "snake_case")]
pub enum HookEvent {
    StatusKnown(String),
    Downloading(String),
    Releasing(String),
    PreMount(String),
    PostMount(String),
    Registering(String),
    Unregistering(String),
    Loading(String),
    Unloading(String),
    Activating(String),
    Activated(String),
    Deactivating(String),
    Terminating(String),
    PauseChange(UnitId, PauseChange),
    ConfigInitialized(String),
    ConfigBatch(Vec<String>),
}

#[derive(Debug, Default)]
struct HooksInner {
    events: Vec<HookEvent>,
    hold_post_mount: BTreeSet<String>,
    hold_deactivating: BTreeSet<String>,
    held: Vec<Pauser>,
}

/// [`LifecycleHooks`] that records every call and can hold pausers.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    inner: Mutex<HooksInner>,
}

impl RecordingHooks {
    /// A recorder that holds nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a pauser when `name` finishes mounting.
    pub fn hold_post_mount(&self, name: impl Into<String>) {
        self.inner.lock().hold_post_mount.insert(name.into());
    }

    /// Take a pauser when `name` starts deactivating.
    pub fn hold_deactivating(&self, name: impl Into<String>) {
        self.inner.lock().hold_deactivating.insert(name.into());
    }

    /// Drop every held pauser. Returns how many were held.
    pub fn release_pausers(&self) -> usize {
        let held = std::mem::take(&mut self.inner.lock().held);
        let count = held.len();
        drop(held);
        count
    }

    /// Every recorded call.
    pub fn events(&self) -> Vec<HookEvent> {
        self.inner.lock().events.clone()
    }

    /// Recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&HookEvent) -> bool) -> usize {
        self.inner.lock().events.iter().filter(|e| pred(e)).count()
    }

    fn record(&self, event: HookEvent) {
        self.inner.lock().events.push(event);
    }
}

impl LifecycleHooks for RecordingHooks {
    fn on_status_known(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::StatusKnown(name.to_string()));
    }

    fn on_downloading(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::Downloading(name.to_string()));
    }

    fn on_releasing(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::Releasing(name.to_string()));
    }

    fn on_pre_mount(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::PreMount(name.to_string()));
    }

    fn on_post_mount(&self, _unit: UnitId, name: &str, pause: &PauseContext) {
        let mut inner = self.inner.lock();
        inner.events.push(HookEvent::PostMount(name.to_string()));
        if inner.hold_post_mount.contains(name) {
            inner.held.push(pause.pauser());
        }
    }

    fn on_registering(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::Registering(name.to_string()));
    }

    fn on_unregistering(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::Unregistering(name.to_string()));
    }

    fn on_loading(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::Loading(name.to_string()));
    }

    fn on_unloading(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::Unloading(name.to_string()));
    }

    fn on_activating(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::Activating(name.to_string()));
    }

    fn on_activated(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::Activated(name.to_string()));
    }

    fn on_deactivating(&self, _unit: UnitId, name: &str, pause: &PauseContext) {
        let mut inner = self.inner.lock();
        inner.events.push(HookEvent::Deactivating(name.to_string()));
        if inner.hold_deactivating.contains(name) {
            inner.held.push(pause.pauser());
        }
    }

    fn on_terminating(&self, _unit: UnitId, url: &str) {
        self.record(HookEvent::Terminating(url.to_string()));
    }

    fn on_pause_change(&self, unit: UnitId, change: &PauseChange) {
        self.record(HookEvent::PauseChange(unit, change.clone()));
    }

    fn initialize_config(&self, _unit: UnitId, name: &str) {
        self.record(HookEvent::ConfigInitialized(name.to_string()));
    }

    fn initialize_config_batch(&self, units: &[BatchItem]) {
        let names = units.iter().map(|item| item.name.clone()).collect();
        self.record(HookEvent::ConfigBatch(names));
    }
}

// ─── Progress ────────────────────────────────────────────────────────

/// [`ProgressSink`] that records every report.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    progress: Mutex<Vec<(UnitId, UnitState, f32)>>,
    phases: Mutex<Vec<(String, UnitId)>>,
}

impl RecordingProgress {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress reports in order.
    pub fn progress(&self) -> Vec<(UnitId, UnitState, f32)> {
        self.progress.lock().clone()
    }

    /// Status events in order.
    pub fn phases(&self) -> Vec<(String, UnitId)> {
        self.phases.lock().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn on_progress(&self, unit: UnitId, state: UnitState, fraction: f32) {
        self.progress.lock().push((unit, state, fraction));
    }

    fn on_status_event(&self, phase: &str, unit: UnitId) {
        self.phases.lock().push((phase.to_string(), unit));
    }
}

// ─── Host ────────────────────────────────────────────────────────────

/// Every simulated collaborator, kept as concrete handles so tests can
/// steer them after the subsystem took its [`Services`].
#[derive(Debug, Clone)]
pub struct SimHost {
    pub installer: Arc<SimInstaller>,
    pub loader: Arc<SimLoader>,
    pub mounter: Arc<SimMounter>,
    pub resolver: Arc<StaticDependencies>,
    pub hooks: Arc<RecordingHooks>,
    pub progress: Arc<RecordingProgress>,
}

impl SimHost {
    /// A host whose installer and loader complete in `mode`.
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            installer: Arc::new(SimInstaller::new(mode)),
            loader: Arc::new(SimLoader::new(mode)),
            mounter: Arc::new(SimMounter::new()),
            resolver: Arc::new(StaticDependencies::new()),
            hooks: Arc::new(RecordingHooks::new()),
            progress: Arc::new(RecordingProgress::new()),
        }
    }

    /// The ports for a subsystem.
    pub fn services(&self) -> Services {
        Services::new(self.loader.clone(), self.mounter.clone())
            .with_installer(self.installer.clone())
            .with_resolver(self.resolver.clone())
            .with_hooks(self.hooks.clone())
            .with_progress(self.progress.clone())
    }

    /// Complete everything queued on the installer and loader.
    pub fn complete_all(&self) -> usize {
        self.installer.complete_all() + self.loader.complete_all()
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new(CompletionMode::Immediate)
    }
}
