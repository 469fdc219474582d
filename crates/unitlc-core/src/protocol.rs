//! # Protocol Metadata and Options
//!
//! A unit URL names one of two protocols. `file:` units live on local disk
//! and carry no extra data. `installbundle:` units are backed by one or more
//! installable bundles listed in the URL's `Bundles` option; the installer
//! may expand that list with bundle dependencies once status is known.
//!
//! Options are supplied by the caller when the unit is created and may be
//! updated later subject to [`ProtocolOptions::validate_update`].

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::Protocol;

/// Separator between the identifying part of a URL and its options.
pub const OPTION_SEPARATOR: char = '?';
/// Separator between an option key and its value.
pub const OPTION_ASSIGN: char = '=';
/// Separator between list entries in an option value.
pub const OPTION_LIST_SEPARATOR: char = ',';
/// Option key carrying the bundle list of an install-bundle unit.
pub const BUNDLES_OPTION: &str = "Bundles";

// ─── Bundle Identifier ───────────────────────────────────────────────

/// Name of an installable bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    /// Wrap a bundle name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The bundle name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BundleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ─── Request Flags ───────────────────────────────────────────────────

bitflags! {
    /// Flags passed to install requests.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct InstallFlags: u32 {
        /// Download without mounting; mounting happens in a later state.
        const SKIP_MOUNT = 1 << 0;
        /// Mount on a background worker.
        const ASYNC_MOUNT = 1 << 1;
        /// Allow the installer to use background transfers.
        const BACKGROUND = 1 << 2;
        /// Ask before using metered connections.
        const CHECK_METERED = 1 << 3;
    }
}

bitflags! {
    /// Flags passed to release requests.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReleaseFlags: u32 {
        /// Only the listed bundles are released; dependencies are untouched.
        const EXPLICIT_REMOVE_LIST = 1 << 0;
        /// Delete the bundle files from disk if nothing else needs them.
        const REMOVE_FILES_IF_POSSIBLE = 1 << 1;
        /// Unmount only; keep the bundle installed.
        const SKIP_RELEASE_UNMOUNT_ONLY = 1 << 2;
    }
}

// ─── Metadata ────────────────────────────────────────────────────────

/// Bundle data of an install-bundle unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallBundleMetadata {
    /// Bundles backing the unit, expanded with dependencies once status is known.
    pub bundles: Vec<BundleId>,
    /// Bundles whose assets are streamed on demand after mounting.
    #[serde(default)]
    pub asset_stream_bundles: Vec<BundleId>,
}

/// Protocol data parsed from the options part of a unit URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolMetadata {
    /// File units carry no metadata.
    #[default]
    File,
    /// Install-bundle units list their bundles.
    InstallBundle(InstallBundleMetadata),
}

impl ProtocolMetadata {
    /// Parse the options string (everything after `?`) for `protocol`.
    pub fn from_url_options(protocol: Protocol, options: &str) -> Result<Self, OptionsError> {
        match protocol {
            Protocol::File => Ok(ProtocolMetadata::File),
            Protocol::InstallBundle => {
                let mut bundles = None;
                for pair in options.split(OPTION_SEPARATOR).filter(|p| !p.is_empty()) {
                    let (key, value) = pair
                        .split_once(OPTION_ASSIGN)
                        .ok_or_else(|| OptionsError::Malformed(pair.to_string()))?;
                    if key == BUNDLES_OPTION {
                        let list: Vec<BundleId> = value
                            .split(OPTION_LIST_SEPARATOR)
                            .map(str::trim)
                            .filter(|b| !b.is_empty())
                            .map(BundleId::from)
                            .collect();
                        bundles = Some(list);
                    }
                }
                match bundles {
                    Some(bundles) if !bundles.is_empty() => {
                        Ok(ProtocolMetadata::InstallBundle(InstallBundleMetadata {
                            bundles,
                            asset_stream_bundles: Vec::new(),
                        }))
                    }
                    _ => Err(OptionsError::MissingBundles),
                }
            }
        }
    }

    /// Render the options string, the inverse of [`Self::from_url_options`].
    pub fn to_url_options(&self) -> String {
        match self {
            ProtocolMetadata::File => String::new(),
            ProtocolMetadata::InstallBundle(meta) => {
                let list: Vec<&str> = meta.bundles.iter().map(BundleId::as_str).collect();
                format!(
                    "{OPTION_SEPARATOR}{BUNDLES_OPTION}{OPTION_ASSIGN}{}",
                    list.join(&OPTION_LIST_SEPARATOR.to_string())
                )
            }
        }
    }

    /// Bundle list for install-bundle units, empty otherwise.
    pub fn bundles(&self) -> &[BundleId] {
        match self {
            ProtocolMetadata::File => &[],
            ProtocolMetadata::InstallBundle(meta) => &meta.bundles,
        }
    }

    /// Asset-streamed bundle list for install-bundle units, empty otherwise.
    pub fn asset_stream_bundles(&self) -> &[BundleId] {
        match self {
            ProtocolMetadata::File => &[],
            ProtocolMetadata::InstallBundle(meta) => &meta.asset_stream_bundles,
        }
    }
}

// ─── Options ─────────────────────────────────────────────────────────

/// Errors parsing or updating protocol options.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// An option pair was not `key=value`.
    #[error("malformed URL option: {0}")]
    Malformed(String),

    /// An install-bundle URL had no `Bundles` option or an empty list.
    #[error("install-bundle URL requires a non-empty Bundles option")]
    MissingBundles,

    /// Options for a different protocol were supplied.
    #[error("options do not match protocol {0}")]
    ProtocolMismatch(Protocol),

    /// `allow_config_loading` may not change after creation.
    #[error("allow_config_loading cannot change once set")]
    ConfigLoadingChanged,
}

/// Options specific to install-bundle units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallBundleOptions {
    /// Flags passed to every install request.
    pub install_flags: InstallFlags,
    /// Visit Uninstalling on the way to Terminal.
    pub uninstall_before_terminate: bool,
    /// Hold downloads paused until cleared.
    pub user_pause_download: bool,
    /// Allow the unit to contribute configuration on activation.
    pub allow_config_loading: bool,
    /// Fail instead of downloading content that is not already up to date.
    pub do_not_download: bool,
}

/// Options for one protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolSpecificOptions {
    /// File units have no specific options.
    #[default]
    None,
    /// Install-bundle options.
    InstallBundle(InstallBundleOptions),
}

/// Per-unit options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolOptions {
    /// Disallow async loading for this unit.
    pub force_sync_loading: bool,
    /// Allow this unit to join batched work.
    pub batch_process: bool,
    /// Protocol-specific options.
    pub specific: ProtocolSpecificOptions,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            force_sync_loading: false,
            batch_process: true,
            specific: ProtocolSpecificOptions::None,
        }
    }
}

impl ProtocolOptions {
    /// Default options for a protocol.
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::File => Self::default(),
            Protocol::InstallBundle => Self {
                specific: ProtocolSpecificOptions::InstallBundle(InstallBundleOptions::default()),
                ..Self::default()
            },
        }
    }

    /// Install-bundle options, if present.
    pub fn install_bundle(&self) -> Option<&InstallBundleOptions> {
        match &self.specific {
            ProtocolSpecificOptions::InstallBundle(opts) => Some(opts),
            ProtocolSpecificOptions::None => None,
        }
    }

    /// Whether these options fit `protocol`.
    pub fn matches(&self, protocol: Protocol) -> bool {
        matches!(
            (protocol, &self.specific),
            (Protocol::File, ProtocolSpecificOptions::None)
                | (Protocol::InstallBundle, ProtocolSpecificOptions::InstallBundle(_))
        )
    }

    /// Check that `next` may replace `self` for a unit of `protocol`.
    pub fn validate_update(&self, protocol: Protocol, next: &ProtocolOptions) -> Result<(), OptionsError> {
        if !next.matches(protocol) {
            return Err(OptionsError::ProtocolMismatch(protocol));
        }
        if let (Some(old), Some(new)) = (self.install_bundle(), next.install_bundle()) {
            if old.allow_config_loading != new.allow_config_loading {
                return Err(OptionsError::ConfigLoadingChanged);
            }
        }
        Ok(())
    }

    /// Options handed to a replacement unit: never uninstall unexpectedly.
    pub fn recycled(&self) -> ProtocolOptions {
        let mut next = self.clone();
        if let ProtocolSpecificOptions::InstallBundle(opts) = &mut next.specific {
            opts.uninstall_before_terminate = false;
        }
        next
    }

    /// Whether the unit may contribute configuration. File units always may.
    pub fn allow_config_loading(&self) -> bool {
        self.install_bundle()
            .map(|o| o.allow_config_loading)
            .unwrap_or(true)
    }

    /// Whether Uninstalling is visited before Terminal.
    pub fn uninstall_before_terminate(&self) -> bool {
        self.install_bundle()
            .map(|o| o.uninstall_before_terminate)
            .unwrap_or(false)
    }
}
