//! # Error Types
//!
//! Two families of errors live here:
//!
//! - Construction errors ([`CoreError`] and friends) raised when callers hand
//!   the engine malformed URLs, ranges, or option sets. These are ordinary
//!   `thiserror` enums and propagate with `?`.
//! - Transition failures ([`TransitionError`]) produced by state behaviors.
//!   They are values delivered to completion callbacks, never panics. A
//!   closed [`ErrorKind`] classifies the failure; the string code carries the
//!   detail in the form `unit.lifecycle.<State>.<Code>`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::IdentifierError;
use crate::protocol::OptionsError;
use crate::state::{RangeError, UnitState};

/// Prefix shared by every transition error code.
pub const ERROR_CODE_PREFIX: &str = "unit.lifecycle";

/// Top-level error for constructing engine inputs.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A unit URL could not be parsed.
    #[error("identifier error: {0}")]
    Identifier(#[from] IdentifierError),

    /// A destination range was malformed.
    #[error("range error: {0}")]
    Range(#[from] RangeError),

    /// Protocol options did not fit the unit's protocol.
    #[error("options error: {0}")]
    Options(#[from] OptionsError),
}

// ─── Transition Errors ───────────────────────────────────────────────

/// Classification of a transition failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The transition was canceled by a `try_cancel` request.
    Canceled,
    /// The unit URL could not be parsed.
    InvalidUrl,
    /// The unit's content is not available from its protocol.
    Unavailable,
    /// The bundle installer failed to initialise or report state.
    Installer,
    /// An install, release, or stream request for a bundle failed.
    BundleOperation,
    /// The user disallowed the download.
    DownloadNotAllowed,
    /// Mounting or unmounting the unit failed.
    Mount,
    /// A dependency could not be queried or failed to transition.
    Dependency,
    /// Required feature data was missing.
    MissingData,
    /// An asset load was canceled.
    LoadCanceled,
    /// Protocol options could not be applied.
    Options,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Canceled => "canceled",
            Self::InvalidUrl => "invalid-url",
            Self::Unavailable => "unavailable",
            Self::Installer => "installer",
            Self::BundleOperation => "bundle-operation",
            Self::DownloadNotAllowed => "download-not-allowed",
            Self::Mount => "mount",
            Self::Dependency => "dependency",
            Self::MissingData => "missing-data",
            Self::LoadCanceled => "load-canceled",
            Self::Options => "options",
        })
    }
}

/// A failed transition.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}")]
pub struct TransitionError {
    /// Closed classification.
    pub kind: ErrorKind,
    /// Full error code, e.g. `unit.lifecycle.Mounting.Unit_Name_Already_In_Use`.
    pub code: String,
}

impl TransitionError {
    /// A failure raised while in `state`, with a short code such as `Bad_Url`.
    pub fn new(state: UnitState, kind: ErrorKind, code: impl AsRef<str>) -> Self {
        Self {
            kind,
            code: format!("{ERROR_CODE_PREFIX}.{state}.{}", code.as_ref()),
        }
    }

    /// The result delivered to every pending request when a transition is canceled.
    pub fn canceled() -> Self {
        Self {
            kind: ErrorKind::Canceled,
            code: format!("{ERROR_CODE_PREFIX}.Canceled"),
        }
    }

    /// Whether this is the cancellation result.
    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    /// The trailing detail after the state name.
    pub fn short_code(&self) -> &str {
        let rest = self
            .code
            .strip_prefix(ERROR_CODE_PREFIX)
            .and_then(|r| r.strip_prefix('.'))
            .unwrap_or(&self.code);
        match rest.split_once('.') {
            Some((_, tail)) => tail,
            None => rest,
        }
    }
}

/// Outcome of a transition request.
pub type TransitionResult = Result<(), TransitionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_includes_state_and_detail() {
        let err = TransitionError::new(UnitState::Mounting, ErrorKind::Mount, "Failed_To_Register");
        assert_eq!(err.code, "unit.lifecycle.Mounting.Failed_To_Register");
        assert_eq!(err.short_code(), "Failed_To_Register");
        assert_eq!(err.to_string(), err.code);
    }

    #[test]
    fn canceled_result_is_distinct() {
        let canceled = TransitionError::canceled();
        assert!(canceled.is_canceled());
        assert_eq!(canceled.code, "unit.lifecycle.Canceled");
        assert_eq!(canceled.short_code(), "Canceled");

        let other = TransitionError::new(UnitState::Downloading, ErrorKind::BundleOperation, "X");
        assert!(!other.is_canceled());
    }

    #[test]
    fn detail_may_contain_dots() {
        let err = TransitionError::new(
            UnitState::Downloading,
            ErrorKind::BundleOperation,
            "BundleManager.OnComplete.Failed",
        );
        assert_eq!(err.short_code(), "BundleManager.OnComplete.Failed");
    }

    #[test]
    fn serializes_kind_and_code() {
        let err = TransitionError::new(UnitState::Registering, ErrorKind::MissingData, "Missing");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "MissingData");
        assert_eq!(json["code"], "unit.lifecycle.Registering.Missing");
    }
}
