//! # Shared Bundle Tracker
//!
//! Several units may share an installable bundle, each at its own depth:
//!
//! ```text
//! Download < Mount < AssetStream
//! ```
//!
//! The tracker records, per bundle, the deepest depth each unit holds.
//! Releasing at a depth demotes the caller one level and reports the bundles
//! nobody else still needs at that depth, which are then safe to release
//! through the installer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use unitlc_core::{BundleId, UnitId};

/// How deeply a unit engages a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BundleDepth {
    /// Downloaded to disk.
    Download = 1,
    /// Mounted.
    Mount = 2,
    /// Asset dependencies streamed.
    AssetStream = 3,
}

impl BundleDepth {
    /// The next shallower depth, or `None` below Download.
    pub fn lower(self) -> Option<BundleDepth> {
        match self {
            Self::Download => None,
            Self::Mount => Some(Self::Download),
            Self::AssetStream => Some(Self::Mount),
        }
    }
}

/// Process-wide bundle reference table. Touched only on the driver thread.
#[derive(Debug, Default, Clone)]
pub struct SharedBundleTracker {
    refs: BTreeMap<BundleId, BTreeMap<UnitId, BundleDepth>>,
}

impl SharedBundleTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `unit` holds `bundles` at `depth`, keeping any deeper hold.
    pub fn add_refs(&mut self, unit: UnitId, depth: BundleDepth, bundles: &[BundleId]) {
        for bundle in bundles {
            let holders = self.refs.entry(bundle.clone()).or_default();
            let held = holders.entry(unit).or_insert(depth);
            if *held < depth {
                *held = depth;
            }
        }
    }

    /// Drop `unit`'s hold on `bundles` at `depth`.
    ///
    /// Holds at or above `depth` are demoted one level (removed at
    /// Download). Returns the bundles that no unit holds at or above `depth`
    /// afterwards.
    pub fn release(&mut self, unit: UnitId, depth: BundleDepth, bundles: &[BundleId]) -> Vec<BundleId> {
        let mut releasable = Vec::new();
        for bundle in bundles {
            let still_needed = match self.refs.get_mut(bundle) {
                Some(holders) => {
                    if let Some(held) = holders.get(&unit).copied() {
                        if held >= depth {
                            match depth.lower() {
                                Some(lower) => {
                                    holders.insert(unit, lower);
                                }
                                None => {
                                    holders.remove(&unit);
                                }
                            }
                        }
                    }
                    let needed = holders.values().any(|held| *held >= depth);
                    if holders.is_empty() {
                        self.refs.remove(bundle);
                    }
                    needed
                }
                None => false,
            };
            if !still_needed && !releasable.contains(bundle) {
                releasable.push(bundle.clone());
            }
        }
        releasable
    }

    /// The depth at which `unit` holds `bundle`.
    pub fn depth_of(&self, bundle: &BundleId, unit: UnitId) -> Option<BundleDepth> {
        self.refs.get(bundle).and_then(|holders| holders.get(&unit).copied())
    }

    /// Whether any unit holds `bundle`.
    pub fn is_referenced(&self, bundle: &BundleId) -> bool {
        self.refs.contains_key(bundle)
    }

    /// Number of tracked bundles.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Whether no bundle is held.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
