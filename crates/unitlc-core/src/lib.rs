//! # unitlc-core: Foundational Types for the Unit Lifecycle Engine
//!
//! This crate holds the vocabulary shared by every other crate in the
//! workspace. It has no knowledge of scheduling, collaborators, or state
//! behaviors.
//!
//! ## Modules
//!
//! - [`state`]: the 37-state ordered catalogue, [`StateKind`], and
//!   [`StateRange`] destination bands.
//! - [`identifier`]: unit URLs, protocol detection, and the full URL parse.
//! - [`protocol`]: bundle identifiers, request flags, protocol metadata, and
//!   per-unit protocol options.
//! - [`error`]: construction errors and the [`TransitionError`] value
//!   delivered to completion callbacks.
//! - [`config`]: the injected [`LifecycleConfig`].
//! - [`identity`]: [`UnitId`] and [`OwnerId`] handles.
//!
//! ## Crate Policy
//!
//! - States are compared only by ordinal, never by name.
//! - Transition failures are values; nothing in this crate panics on input.
//! - No internal dependencies. Every other workspace crate depends on this one.

pub mod config;
pub mod error;
pub mod identifier;
pub mod identity;
pub mod protocol;
pub mod state;

// ─── State re-exports ───────────────────────────────────────────────

pub use state::{RangeError, StateKind, StateRange, UnitState};

// ─── Identifier re-exports ──────────────────────────────────────────

pub use identifier::{IdentifierError, ParsedUnit, Protocol, UnitIdentifier, DESCRIPTOR_EXTENSION};

// ─── Protocol re-exports ────────────────────────────────────────────

pub use protocol::{
    BundleId, InstallBundleMetadata, InstallBundleOptions, InstallFlags, OptionsError,
    ProtocolMetadata, ProtocolOptions, ProtocolSpecificOptions, ReleaseFlags,
};

// ─── Error re-exports ───────────────────────────────────────────────

pub use error::{CoreError, ErrorKind, TransitionError, TransitionResult, ERROR_CODE_PREFIX};

// ─── Config and identity re-exports ─────────────────────────────────

pub use config::{ConfigError, LifecycleConfig};
pub use identity::{OwnerId, UnitId};
