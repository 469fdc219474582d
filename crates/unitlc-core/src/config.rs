//! # Runtime Configuration
//!
//! Process-wide toggles that shape how states behave: async versus sync
//! loading, batching, asset streaming, and how dependency deactivation is
//! awaited. The configuration is built once and injected into the subsystem
//! at construction; states never read the environment themselves.
//!
//! | Field | Environment variable | Default |
//! |---|---|---|
//! | `async_load` | `UNITLC_ASYNC_LOAD` | `true` |
//! | `force_async_load` | `UNITLC_FORCE_ASYNC_LOAD` | `false` |
//! | `headless` | `UNITLC_HEADLESS` | `false` |
//! | `force_sync_register_startup` | `UNITLC_FORCE_SYNC_REGISTER_STARTUP` | `true` |
//! | `wait_for_dependency_deactivation` | `UNITLC_WAIT_FOR_DEPENDENCY_DEACTIVATION` | `false` |
//! | `enable_asset_streaming` | `UNITLC_ENABLE_ASSET_STREAMING` | `true` |
//! | `enable_batch_processing` | `UNITLC_ENABLE_BATCH_PROCESSING` | `false` |
//! | `realtime_mode` | `UNITLC_REALTIME_MODE` | `false` |

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolOptions;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Use async loading where it is allowed.
    pub async_load: bool,
    /// Allow async loading even on a headless host.
    pub force_async_load: bool,
    /// The host is a headless batch tool; async loading needs `force_async_load`.
    pub headless: bool,
    /// Register and mount synchronously while startup units are loading.
    pub force_sync_register_startup: bool,
    /// Set by the host while it loads its startup units.
    pub loading_startup_units: bool,
    /// Deactivation waits for dependencies to deactivate first.
    pub wait_for_dependency_deactivation: bool,
    /// Stream asset dependencies between mounting and registering.
    pub enable_asset_streaming: bool,
    /// Batch eligible per-unit work once per tick.
    pub enable_batch_processing: bool,
    /// Spread dependency, mount, and register work across ticks.
    pub realtime_mode: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            async_load: true,
            force_async_load: false,
            headless: false,
            force_sync_register_startup: true,
            loading_startup_units: false,
            wait_for_dependency_deactivation: false,
            enable_asset_streaming: true,
            enable_batch_processing: false,
            realtime_mode: false,
        }
    }
}

impl LifecycleConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| -> Result<bool, ConfigError> {
            match lookup(key) {
                Some(raw) => parse_bool(key, &raw),
                None => Ok(default),
            }
        };

        Ok(Self {
            async_load: flag("UNITLC_ASYNC_LOAD", defaults.async_load)?,
            force_async_load: flag("UNITLC_FORCE_ASYNC_LOAD", defaults.force_async_load)?,
            headless: flag("UNITLC_HEADLESS", defaults.headless)?,
            force_sync_register_startup: flag(
                "UNITLC_FORCE_SYNC_REGISTER_STARTUP",
                defaults.force_sync_register_startup,
            )?,
            loading_startup_units: defaults.loading_startup_units,
            wait_for_dependency_deactivation: flag(
                "UNITLC_WAIT_FOR_DEPENDENCY_DEACTIVATION",
                defaults.wait_for_dependency_deactivation,
            )?,
            enable_asset_streaming: flag(
                "UNITLC_ENABLE_ASSET_STREAMING",
                defaults.enable_asset_streaming,
            )?,
            enable_batch_processing: flag(
                "UNITLC_ENABLE_BATCH_PROCESSING",
                defaults.enable_batch_processing,
            )?,
            realtime_mode: flag("UNITLC_REALTIME_MODE", defaults.realtime_mode)?,
        })
    }

    /// Whether a unit with `options` may load asynchronously at all.
    ///
    /// A unit's own `force_sync_loading` wins over `force_async_load`.
    pub fn allow_async_loading(&self, options: &ProtocolOptions) -> bool {
        !options.force_sync_loading && (!self.headless || self.force_async_load)
    }

    /// Whether a unit with `options` should load asynchronously.
    pub fn use_async_loading(&self, options: &ProtocolOptions) -> bool {
        self.allow_async_loading(options) && self.async_load
    }

    /// Async loading for the register and mount phases, which go synchronous
    /// while startup units load.
    pub fn use_async_registration(&self, options: &ProtocolOptions) -> bool {
        if self.force_sync_register_startup && self.loading_startup_units {
            return false;
        }
        self.use_async_loading(options)
    }

    /// Whether a unit with `options` takes part in batching.
    pub fn can_batch_process(&self, options: &ProtocolOptions) -> bool {
        options.batch_process && self.enable_batch_processing
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A boolean variable held something other than a recognised boolean.
    #[error("{key} must be a boolean (1/0/true/false/yes/no/on/off), got {value:?}")]
    InvalidBool {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = LifecycleConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, LifecycleConfig::default());
        assert!(config.async_load);
        assert!(config.enable_asset_streaming);
        assert!(!config.enable_batch_processing);
    }

    #[test]
    fn reads_overrides() {
        let config = LifecycleConfig::from_lookup(lookup(&[
            ("UNITLC_ENABLE_BATCH_PROCESSING", "yes"),
            ("UNITLC_ASYNC_LOAD", "0"),
            ("UNITLC_REALTIME_MODE", " TRUE "),
        ]))
        .unwrap();
        assert!(config.enable_batch_processing);
        assert!(!config.async_load);
        assert!(config.realtime_mode);
    }

    #[test]
    fn rejects_garbage() {
        let err = LifecycleConfig::from_lookup(lookup(&[("UNITLC_HEADLESS", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("UNITLC_HEADLESS"));
    }

    #[test]
    fn unit_sync_flag_beats_forced_async() {
        let config = LifecycleConfig {
            headless: true,
            force_async_load: true,
            ..LifecycleConfig::default()
        };
        let mut options = ProtocolOptions::default();
        assert!(config.allow_async_loading(&options));
        options.force_sync_loading = true;
        assert!(!config.allow_async_loading(&options));
    }

    #[test]
    fn headless_is_sync_unless_forced() {
        let config = LifecycleConfig {
            headless: true,
            ..LifecycleConfig::default()
        };
        assert!(!config.use_async_loading(&ProtocolOptions::default()));
    }

    #[test]
    fn startup_registration_goes_sync() {
        let config = LifecycleConfig {
            loading_startup_units: true,
            ..LifecycleConfig::default()
        };
        let options = ProtocolOptions::default();
        assert!(config.use_async_loading(&options));
        assert!(!config.use_async_registration(&options));
    }
}
