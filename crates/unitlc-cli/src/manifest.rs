//! # Run Manifest
//!
//! YAML description of a simulated run: engine configuration, the bundles
//! the simulated installer knows, and the units to drive with their
//! dependencies and loader settings.
//!
//! ```yaml
//! completion: manual
//! latency_ms: 5
//! config:
//!   enable_batch_processing: true
//! bundles:
//!   MapsCore: { state: NotInstalled }
//! units:
//!   - url: installbundle:/dlc/Maps/Maps.unit?Bundles=MapsCore
//!     target: Active
//!     depends_on: [file:/units/Base/Base.unit]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use unitlc_core::{BundleId, LifecycleConfig, ProtocolOptions, StateRange, UnitIdentifier};
use unitlc_state::sim::{CompletionMode, SimBundle, SimHost};

/// Top-level manifest document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunManifest {
    /// Engine configuration. Missing fields keep their defaults.
    pub config: LifecycleConfig,
    /// When simulated installer and loader work reports back.
    pub completion: CompletionMode,
    /// Delay between simulated completions in manual mode.
    pub latency_ms: u64,
    /// Bundles known to the simulated installer.
    pub bundles: BTreeMap<String, SimBundle>,
    /// Units to drive, in request order.
    pub units: Vec<UnitEntry>,
}

/// One unit to drive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitEntry {
    /// Unit URL.
    pub url: String,
    /// Destination range (`State` or `Min..Max`). Falls back to `--target`.
    #[serde(default)]
    pub target: Option<String>,
    /// Protocol options used when the unit is created.
    #[serde(default)]
    pub options: Option<ProtocolOptions>,
    /// URLs of units this unit depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Register from a dedicated feature data asset.
    #[serde(default)]
    pub feature_data: bool,
    /// The unit's feature data is missing entirely.
    #[serde(default)]
    pub missing_feature_data: bool,
    /// The unit has preload assets to load before activation.
    #[serde(default)]
    pub preload: bool,
    /// Mounting fails.
    #[serde(default)]
    pub fail_mount: bool,
}

impl RunManifest {
    /// Read and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;
        let manifest: RunManifest = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse manifest: {}", path.display()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check that every URL and target is usable before anything runs.
    pub fn validate(&self) -> Result<()> {
        if self.units.is_empty() {
            bail!("manifest lists no units");
        }
        for entry in &self.units {
            let id = UnitIdentifier::new(entry.url.as_str())
                .with_context(|| format!("invalid unit URL: {}", entry.url))?;
            id.parse()
                .with_context(|| format!("invalid unit URL: {}", entry.url))?;
            if let Some(target) = &entry.target {
                parse_target(target).with_context(|| format!("invalid target for {}", entry.url))?;
            }
            for dependency in &entry.depends_on {
                UnitIdentifier::new(dependency.as_str())
                    .with_context(|| format!("invalid dependency URL of {}: {dependency}", entry.url))?;
            }
        }
        Ok(())
    }

    /// A simulated host steered the way the manifest describes.
    pub fn build_host(&self) -> Result<SimHost> {
        let host = SimHost::new(self.completion);
        for (name, bundle) in &self.bundles {
            host.installer.add_bundle(BundleId::new(name.as_str()), bundle.clone());
        }
        for entry in &self.units {
            let name = UnitIdentifier::new(entry.url.as_str())?.parse()?.name;
            for dependency in &entry.depends_on {
                host.resolver.add(&entry.url, dependency.as_str());
            }
            if entry.feature_data {
                host.loader.add_feature_data(format!("/{name}/FeatureData"));
            }
            if entry.missing_feature_data {
                host.loader.mark_missing(format!("/{name}/{name}"));
            }
            if entry.preload {
                host.loader.add_preload(name.as_str());
            }
            if entry.fail_mount {
                host.mounter.fail_mount(name.as_str());
            }
        }
        Ok(host)
    }
}

/// Parse a destination range and require destination-state endpoints.
pub fn parse_target(text: &str) -> Result<StateRange> {
    let range = StateRange::parse(text)?;
    if !range.has_valid_endpoints() {
        bail!("{range} must start and end on destination states");
    }
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitlc_core::UnitState;
    use unitlc_state::BundleInstallState;

    const MANIFEST: &str = r#"
completion: manual
latency_ms: 2
config:
  enable_batch_processing: true
bundles:
  MapsCore:
    state: UpToDate
units:
  - url: installbundle:/dlc/Maps/Maps.unit?Bundles=MapsCore
    target: Installed..Active
    depends_on: [file:/units/Base/Base.unit]
  - url: file:/units/Base/Base.unit
    feature_data: true
"#;

    #[test]
    fn manifest_parses_with_defaults() {
        let manifest: RunManifest = serde_yaml::from_str(MANIFEST).unwrap();
        assert_eq!(manifest.completion, CompletionMode::Manual);
        assert!(manifest.config.enable_batch_processing);
        assert!(manifest.config.async_load);
        assert_eq!(manifest.units.len(), 2);
        assert_eq!(manifest.units[1].target, None);
        assert!(manifest.units[1].feature_data);
        manifest.validate().unwrap();
    }

    #[test]
    fn host_knows_bundles_and_dependencies() {
        let manifest: RunManifest = serde_yaml::from_str(MANIFEST).unwrap();
        let host = manifest.build_host().unwrap();
        assert_eq!(
            host.installer.bundle_state(&BundleId::from("MapsCore")),
            Some(BundleInstallState::UpToDate)
        );
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, MANIFEST).unwrap();
        let manifest = RunManifest::load(&path).unwrap();
        assert_eq!(manifest.latency_ms, 2);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunManifest::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read manifest"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_yaml::from_str::<RunManifest>("units: []\nspeed: 3\n").unwrap_err();
        assert!(err.to_string().contains("speed"));
    }

    #[test]
    fn bad_urls_and_targets_fail_validation() {
        let bad_url: RunManifest = serde_yaml::from_str("units:\n  - url: ftp:/units/A/A.unit\n").unwrap();
        assert!(bad_url.validate().is_err());

        let bad_target: RunManifest =
            serde_yaml::from_str("units:\n  - url: file:/units/A/A.unit\n    target: Mounting\n").unwrap();
        let err = bad_target.validate().unwrap_err();
        assert!(format!("{err:#}").contains("destination states"));

        assert!(RunManifest::default().validate().is_err());
    }

    #[test]
    fn targets_accept_spans() {
        let range = parse_target("Registered..Active").unwrap();
        assert_eq!(range.min(), UnitState::Registered);
        assert_eq!(range.max(), UnitState::Active);
    }
}
