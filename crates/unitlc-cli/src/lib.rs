//! # unitlc-cli: Command-Line Interface for the Unit Lifecycle Engine
//!
//! Provides the `unitlc` binary.
//!
//! ## Subcommands
//!
//! - `unitlc states`: the 37-state catalogue with ordinals and kinds.
//! - `unitlc parse-url <url>`: how a unit URL is identified and parsed.
//! - `unitlc run --manifest <file>`: drive a manifest of simulated units to
//!   their targets and report the outcome.
//!
//! ```bash
//! unitlc states --kind error
//! unitlc parse-url 'installbundle:/dlc/Maps/Maps.unit?Bundles=MapsCore'
//! unitlc run --manifest demos/maps.yaml --target Installed..Active --json
//! ```
//!
//! ## Crate Policy
//!
//! - Argument parsing lives in `main.rs`; handlers here return an exit code.
//! - Handlers delegate to `unitlc-core` and `unitlc-state`. The only logic
//!   here is manifest loading and report assembly.

pub mod inspect;
pub mod manifest;
pub mod run;
