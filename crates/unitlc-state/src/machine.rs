//! # Unit State Machine
//!
//! One [`UnitStateMachine`] exists per distinct unit URL. It owns the current
//! state, the unit's [`UnitProperties`], one behavior object per state, and
//! the completion callback lists. The drive loop itself lives on
//! [`UnitSubsystem`](crate::UnitSubsystem) because driving one unit may
//! drive others.

use serde::{Deserialize, Serialize};
use unitlc_core::{
    ProtocolMetadata, ProtocolOptions, StateRange, UnitId, UnitIdentifier, UnitState,
};

use crate::batch::BatchState;
use crate::behavior::BehaviorTable;
use crate::broadcast::CallbackLists;

/// Mutable context of one unit, owned by its machine.
#[derive(Debug, Clone)]
pub struct UnitProperties {
    /// Unit handle.
    pub unit: UnitId,
    /// Unit URL.
    pub identifier: UnitIdentifier,
    /// Unit name. The identifying URL until the URL has been parsed.
    pub name: String,
    /// Path to the unit descriptor. Empty until the URL has been parsed.
    pub descriptor_path: String,
    /// Protocol data, expanded once status is known.
    pub metadata: Option<ProtocolMetadata>,
    /// Per-unit options.
    pub options: ProtocolOptions,
    /// Current destination range.
    pub destination: StateRange,
    /// A cancel was requested and has not landed yet.
    pub try_cancel: bool,
    /// Forward progress is permanently refused.
    pub unrecoverable: bool,
    /// The unit is mounted with the host.
    pub added_to_registry: bool,
    /// Path of the loaded feature data.
    pub feature_data: Option<String>,
    /// Progress of the current work state in `[0, 1]`.
    pub progress: f32,
    /// Batching status for the current state.
    pub batch: BatchState,
    /// The host loaded this unit as part of its built-in set.
    pub loaded_as_builtin: bool,
}

impl UnitProperties {
    pub(crate) fn new(unit: UnitId, identifier: UnitIdentifier, options: ProtocolOptions) -> Self {
        let (name, descriptor_path) = match identifier.parse() {
            Ok(parsed) => (parsed.name, parsed.descriptor_path),
            Err(_) => (identifier.identifying_str().to_string(), String::new()),
        };
        Self {
            unit,
            identifier,
            name,
            descriptor_path,
            metadata: None,
            options,
            destination: StateRange::single(UnitState::UnknownStatus),
            try_cancel: false,
            unrecoverable: false,
            added_to_registry: false,
            feature_data: None,
            progress: 0.0,
            batch: BatchState::default(),
            loaded_as_builtin: false,
        }
    }

    /// Protocol data, or the empty metadata for the unit's protocol.
    pub fn metadata(&self) -> ProtocolMetadata {
        self.metadata.clone().unwrap_or_default()
    }

    /// Whether the unit is delivered as installable bundles.
    pub fn is_install_bundle(&self) -> bool {
        self.identifier.protocol() == unitlc_core::Protocol::InstallBundle
    }
}

/// The per-unit machine.
pub struct UnitStateMachine {
    pub(crate) current: UnitState,
    pub(crate) props: UnitProperties,
    pub(crate) behaviors: BehaviorTable,
    pub(crate) callbacks: CallbackLists,
    pub(crate) in_update: bool,
}

impl UnitStateMachine {
    pub(crate) fn new(props: UnitProperties, behaviors: BehaviorTable) -> Self {
        Self {
            current: UnitState::Uninitialized,
            props,
            behaviors,
            callbacks: CallbackLists::default(),
            in_update: false,
        }
    }

    /// Current state.
    pub fn current(&self) -> UnitState {
        self.current
    }

    /// The unit's properties.
    pub fn props(&self) -> &UnitProperties {
        &self.props
    }

    /// Whether the machine is moving toward its destination.
    pub fn is_running(&self) -> bool {
        !self.props.destination.contains(self.current)
    }

    /// A serialisable summary of the machine.
    pub fn snapshot(&self) -> UnitSnapshot {
        UnitSnapshot {
            unit: self.props.unit,
            url: self.props.identifier.full_url().to_string(),
            name: self.props.name.clone(),
            state: self.current,
            destination: self.props.destination,
            progress: self.props.progress,
            unrecoverable: self.props.unrecoverable,
            pending_callbacks: self.callbacks.pending_transitions() + self.callbacks.pending_cancels(),
        }
    }
}

impl std::fmt::Debug for UnitStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitStateMachine")
            .field("current", &self.current)
            .field("props", &self.props)
            .field("callbacks", &self.callbacks)
            .field("in_update", &self.in_update)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    /// Unit handle.
    pub unit: UnitId,
    /// Full URL.
    pub url: String,
    /// Unit name.
    pub name: String,
    /// Current state.
    pub state: UnitState,
    /// Destination range.
    pub destination: StateRange,
    /// Progress of the current work state.
    pub progress: f32,
    /// Unrecoverable flag.
    pub unrecoverable: bool,
    /// Callbacks waiting on this unit.
    pub pending_callbacks: usize,
}
