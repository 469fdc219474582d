//! # Unit States: Ordered Lifecycle Catalogue
//!
//! Every unit moves through the same 37-state catalogue. States are compared
//! only by ordinal: "forward" always means a higher ordinal, and the
//! comparisons used by the state behaviors ("the destination lies below this
//! state") are defined on [`StateRange`].
//!
//! ```text
//! Terminal ◀── UnknownStatus ──▶ CheckingStatus ──▶ StatusKnown ──▶ Downloading ──▶ Installed
//!                                                                                     │
//!   Active ◀── Activating ◀── ActivatingDependencies ◀── Loaded ◀── Loading ◀── Registered
//!                                                                                     ▲
//!        Mounting ──▶ WaitingForDependencies ──▶ AssetDependencyStreaming ──▶ Registering
//! ```
//!
//! Each state has a [`StateKind`]. Transition states never hold as a resting
//! point, Destination states are valid targets for a destination range, and
//! Error states are valid stopping points that carry a failure result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── State Kind ──────────────────────────────────────────────────────

/// Classification of a [`UnitState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    /// Auto-advances once its work completes.
    Transition,
    /// A valid target for a destination range.
    Destination,
    /// A valid stopping point reached after a failed transition.
    Error,
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Transition => "transition",
            Self::Destination => "destination",
            Self::Error => "error",
        })
    }
}

// ─── Unit State ──────────────────────────────────────────────────────

/// A lifecycle state. The discriminant is the state's ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum UnitState {
    Uninitialized = 0,
    Terminal = 1,
    UnknownStatus = 2,
    Uninstalled = 3,
    Uninstalling = 4,
    ErrorUninstalling = 5,
    CheckingStatus = 6,
    ErrorCheckingStatus = 7,
    ErrorUnavailable = 8,
    StatusKnown = 9,
    Releasing = 10,
    ErrorManagingData = 11,
    Downloading = 12,
    Installed = 13,
    ErrorMounting = 14,
    ErrorWaitingForDependencies = 15,
    ErrorRegistering = 16,
    Unmounting = 17,
    Mounting = 18,
    WaitingForDependencies = 19,
    AssetDependencyStreamOut = 20,
    ErrorAssetDependencyStreaming = 21,
    AssetDependencyStreaming = 22,
    Unregistering = 23,
    Registering = 24,
    Registered = 25,
    ErrorLoading = 26,
    Unloading = 27,
    Loading = 28,
    Loaded = 29,
    ErrorDeactivatingDependencies = 30,
    DeactivatingDependencies = 31,
    Deactivating = 32,
    ErrorActivatingDependencies = 33,
    ActivatingDependencies = 34,
    Activating = 35,
    Active = 36,
}

impl UnitState {
    /// Number of states in the catalogue.
    pub const COUNT: usize = 37;

    /// Every state in ordinal order.
    pub const ALL: [UnitState; Self::COUNT] = [
        Self::Uninitialized,
        Self::Terminal,
        Self::UnknownStatus,
        Self::Uninstalled,
        Self::Uninstalling,
        Self::ErrorUninstalling,
        Self::CheckingStatus,
        Self::ErrorCheckingStatus,
        Self::ErrorUnavailable,
        Self::StatusKnown,
        Self::Releasing,
        Self::ErrorManagingData,
        Self::Downloading,
        Self::Installed,
        Self::ErrorMounting,
        Self::ErrorWaitingForDependencies,
        Self::ErrorRegistering,
        Self::Unmounting,
        Self::Mounting,
        Self::WaitingForDependencies,
        Self::AssetDependencyStreamOut,
        Self::ErrorAssetDependencyStreaming,
        Self::AssetDependencyStreaming,
        Self::Unregistering,
        Self::Registering,
        Self::Registered,
        Self::ErrorLoading,
        Self::Unloading,
        Self::Loading,
        Self::Loaded,
        Self::ErrorDeactivatingDependencies,
        Self::DeactivatingDependencies,
        Self::Deactivating,
        Self::ErrorActivatingDependencies,
        Self::ActivatingDependencies,
        Self::Activating,
        Self::Active,
    ];

    /// The state's position in the total order.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Index into per-state tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Look up a state by ordinal.
    pub fn from_ordinal(ordinal: u8) -> Option<UnitState> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// Look up a state by its name (as printed by `Display`).
    pub fn from_name(name: &str) -> Option<UnitState> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// The kind of this state.
    pub fn kind(self) -> StateKind {
        match self {
            Self::Terminal
            | Self::UnknownStatus
            | Self::Uninstalled
            | Self::StatusKnown
            | Self::Installed
            | Self::Registered
            | Self::Loaded
            | Self::Active => StateKind::Destination,

            Self::ErrorUninstalling
            | Self::ErrorCheckingStatus
            | Self::ErrorUnavailable
            | Self::ErrorManagingData
            | Self::ErrorMounting
            | Self::ErrorWaitingForDependencies
            | Self::ErrorRegistering
            | Self::ErrorAssetDependencyStreaming
            | Self::ErrorLoading
            | Self::ErrorDeactivatingDependencies
            | Self::ErrorActivatingDependencies => StateKind::Error,

            _ => StateKind::Transition,
        }
    }

    /// Whether a destination range may start or end at this state.
    pub fn is_valid_destination(self) -> bool {
        self.kind() == StateKind::Destination
    }

    /// Whether this state may be the landing point of a failed transition.
    pub fn is_valid_error_state(self) -> bool {
        self.kind() == StateKind::Error
    }

    /// Whether this is a transition (non-resting) state.
    pub fn is_transition(self) -> bool {
        self.kind() == StateKind::Transition
    }

    /// Human-readable name, also used in error codes.
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Terminal => "Terminal",
            Self::UnknownStatus => "UnknownStatus",
            Self::Uninstalled => "Uninstalled",
            Self::Uninstalling => "Uninstalling",
            Self::ErrorUninstalling => "ErrorUninstalling",
            Self::CheckingStatus => "CheckingStatus",
            Self::ErrorCheckingStatus => "ErrorCheckingStatus",
            Self::ErrorUnavailable => "ErrorUnavailable",
            Self::StatusKnown => "StatusKnown",
            Self::Releasing => "Releasing",
            Self::ErrorManagingData => "ErrorManagingData",
            Self::Downloading => "Downloading",
            Self::Installed => "Installed",
            Self::ErrorMounting => "ErrorMounting",
            Self::ErrorWaitingForDependencies => "ErrorWaitingForDependencies",
            Self::ErrorRegistering => "ErrorRegistering",
            Self::Unmounting => "Unmounting",
            Self::Mounting => "Mounting",
            Self::WaitingForDependencies => "WaitingForDependencies",
            Self::AssetDependencyStreamOut => "AssetDependencyStreamOut",
            Self::ErrorAssetDependencyStreaming => "ErrorAssetDependencyStreaming",
            Self::AssetDependencyStreaming => "AssetDependencyStreaming",
            Self::Unregistering => "Unregistering",
            Self::Registering => "Registering",
            Self::Registered => "Registered",
            Self::ErrorLoading => "ErrorLoading",
            Self::Unloading => "Unloading",
            Self::Loading => "Loading",
            Self::Loaded => "Loaded",
            Self::ErrorDeactivatingDependencies => "ErrorDeactivatingDependencies",
            Self::DeactivatingDependencies => "DeactivatingDependencies",
            Self::Deactivating => "Deactivating",
            Self::ErrorActivatingDependencies => "ErrorActivatingDependencies",
            Self::ActivatingDependencies => "ActivatingDependencies",
            Self::Activating => "Activating",
            Self::Active => "Active",
        }
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for UnitState {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UnitState::from_name(s).ok_or_else(|| RangeError::UnknownState(s.to_string()))
    }
}

// ─── State Range ─────────────────────────────────────────────────────

/// Error constructing or parsing a [`StateRange`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// `min` is ordered after `max`.
    #[error("invalid state range: {min} is after {max}")]
    Inverted {
        /// Requested lower bound.
        min: UnitState,
        /// Requested upper bound.
        max: UnitState,
    },

    /// A state name did not match the catalogue.
    #[error("unknown state name: {0}")]
    UnknownState(String),
}

/// An inclusive band `[min, max]` of acceptable stopping states.
///
/// Invariant: `min <= max`. Deserialization goes through
/// [`StateRange::new`] and rejects inverted bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StateRange {
    min: UnitState,
    max: UnitState,
}

impl StateRange {
    /// Build a range, rejecting `min > max`.
    pub fn new(min: UnitState, max: UnitState) -> Result<Self, RangeError> {
        if min > max {
            return Err(RangeError::Inverted { min, max });
        }
        Ok(Self { min, max })
    }

    /// A range containing exactly one state.
    pub fn single(state: UnitState) -> Self {
        Self {
            min: state,
            max: state,
        }
    }

    /// The range spanning `a` and `b`, given in either order.
    pub const fn spanning(a: UnitState, b: UnitState) -> Self {
        if (a as u8) <= (b as u8) {
            Self { min: a, max: b }
        } else {
            Self { min: b, max: a }
        }
    }

    /// Lower bound.
    pub fn min(&self) -> UnitState {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> UnitState {
        self.max
    }

    /// `min <= state <= max`.
    pub fn contains(&self, state: UnitState) -> bool {
        self.min <= state && state <= self.max
    }

    /// The overlap of two ranges, if any.
    pub fn intersect(&self, other: &StateRange) -> Option<StateRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(StateRange { min, max })
    }

    /// The whole range lies strictly below `state` (`max < state`).
    pub fn is_below(&self, state: UnitState) -> bool {
        self.max < state
    }

    /// The whole range lies strictly above `state` (`min > state`).
    pub fn is_above(&self, state: UnitState) -> bool {
        self.min > state
    }

    /// Both endpoints are Destination-kind states.
    pub fn has_valid_endpoints(&self) -> bool {
        self.min.is_valid_destination() && self.max.is_valid_destination()
    }

    /// Parse `"State"` or `"Min..Max"`.
    pub fn parse(input: &str) -> Result<Self, RangeError> {
        match input.split_once("..") {
            Some((min, max)) => StateRange::new(min.trim().parse()?, max.trim().parse()?),
            None => Ok(StateRange::single(input.trim().parse()?)),
        }
    }
}

impl<'de> Deserialize<'de> for StateRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Bounds {
            min: UnitState,
            max: UnitState,
        }

        let bounds = Bounds::deserialize(deserializer)?;
        Self::new(bounds.min, bounds.max).map_err(serde::de::Error::custom)
    }
}

impl From<UnitState> for StateRange {
    fn from(state: UnitState) -> Self {
        StateRange::single(state)
    }
}

impl std::fmt::Display for StateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.min == self.max {
            write!(f, "[{}]", self.min)
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_match_catalogue_positions() {
        for (i, state) in UnitState::ALL.iter().enumerate() {
            assert_eq!(state.index(), i);
            assert_eq!(UnitState::from_ordinal(i as u8), Some(*state));
        }
        assert_eq!(UnitState::from_ordinal(37), None);
    }

    #[test]
    fn kinds_of_anchor_and_error_states() {
        assert_eq!(UnitState::Terminal.kind(), StateKind::Destination);
        assert_eq!(UnitState::Active.kind(), StateKind::Destination);
        assert_eq!(UnitState::Downloading.kind(), StateKind::Transition);
        assert_eq!(UnitState::Uninitialized.kind(), StateKind::Transition);
        assert_eq!(UnitState::ErrorMounting.kind(), StateKind::Error);
        let errors = UnitState::ALL
            .iter()
            .filter(|s| s.is_valid_error_state())
            .count();
        assert_eq!(errors, 11);
        let destinations = UnitState::ALL
            .iter()
            .filter(|s| s.is_valid_destination())
            .count();
        assert_eq!(destinations, 8);
    }

    #[test]
    fn names_round_trip() {
        for state in UnitState::ALL {
            assert_eq!(state.name().parse::<UnitState>().unwrap(), state);
        }
        assert!("Dancing".parse::<UnitState>().is_err());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = StateRange::new(UnitState::Active, UnitState::Installed).unwrap_err();
        assert!(matches!(err, RangeError::Inverted { .. }));
    }

    #[test]
    fn deserialization_checks_bound_order() {
        let err = serde_json::from_str::<StateRange>(r#"{"min":"Active","max":"Registered"}"#).unwrap_err();
        assert!(err.to_string().contains("Active is after Registered"), "{err}");

        let range: StateRange = serde_json::from_str(r#"{"min":"Registered","max":"Active"}"#).unwrap();
        assert_eq!(range, StateRange::spanning(UnitState::Registered, UnitState::Active));
        let text = serde_json::to_string(&range).unwrap();
        assert_eq!(serde_json::from_str::<StateRange>(&text).unwrap(), range);
    }

    #[test]
    fn spanning_orders_endpoints() {
        let range = StateRange::spanning(UnitState::Loaded, UnitState::Terminal);
        assert_eq!(range.min(), UnitState::Terminal);
        assert_eq!(range.max(), UnitState::Loaded);
        assert_eq!(range, StateRange::spanning(UnitState::Terminal, UnitState::Loaded));
    }

    #[test]
    fn intersect_overlapping_and_disjoint() {
        let a = StateRange::new(UnitState::Registered, UnitState::Active).unwrap();
        let b = StateRange::new(UnitState::Installed, UnitState::Loaded).unwrap();
        let both = a.intersect(&b).unwrap();
        assert_eq!(both.min(), UnitState::Registered);
        assert_eq!(both.max(), UnitState::Loaded);

        let c = StateRange::single(UnitState::Terminal);
        assert!(a.intersect(&c).is_none());
    }

    #[test]
    fn below_and_above() {
        let range = StateRange::new(UnitState::Installed, UnitState::Registered).unwrap();
        assert!(range.is_below(UnitState::Loaded));
        assert!(!range.is_below(UnitState::Registered));
        assert!(range.is_above(UnitState::StatusKnown));
        assert!(!range.is_above(UnitState::Installed));
    }

    #[test]
    fn parse_single_and_span() {
        assert_eq!(
            StateRange::parse("Active").unwrap(),
            StateRange::single(UnitState::Active)
        );
        let span = StateRange::parse("Registered..Active").unwrap();
        assert_eq!(span.min(), UnitState::Registered);
        assert_eq!(span.max(), UnitState::Active);
        assert!(StateRange::parse("Active..Registered").is_err());
    }

    #[test]
    fn display_forms() {
        assert_eq!(StateRange::single(UnitState::Loaded).to_string(), "[Loaded]");
        let span = StateRange::new(UnitState::Terminal, UnitState::Loaded).unwrap();
        assert_eq!(span.to_string(), "[Terminal, Loaded]");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = UnitState> {
        (0u8..UnitState::COUNT as u8).prop_map(|o| UnitState::from_ordinal(o).unwrap())
    }

    fn any_range() -> impl Strategy<Value = StateRange> {
        (any_state(), any_state()).prop_map(|(a, b)| {
            let (min, max) = if a <= b { (a, b) } else { (b, a) };
            StateRange::new(min, max).unwrap()
        })
    }

    proptest! {
        /// Membership is exactly the ordinal band.
        #[test]
        fn contains_iff_between_bounds(range in any_range(), s in any_state()) {
            let expected = range.min() <= s && s <= range.max();
            prop_assert_eq!(range.contains(s), expected);
        }

        /// The intersection contains a state iff both operands do.
        #[test]
        fn intersection_is_conjunction(a in any_range(), b in any_range(), s in any_state()) {
            let both = a.contains(s) && b.contains(s);
            match a.intersect(&b) {
                Some(i) => prop_assert_eq!(i.contains(s), both),
                None => prop_assert!(!both),
            }
        }

        /// A state is either inside, below, or above a range, never two at once.
        #[test]
        fn below_above_and_contains_partition(range in any_range(), s in any_state()) {
            let flags = [range.contains(s), range.is_below(s), range.is_above(s)];
            prop_assert_eq!(flags.iter().filter(|f| **f).count(), 1);
        }
    }
}
