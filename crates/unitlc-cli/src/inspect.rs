//! # Inspection Subcommands
//!
//! `unitlc states` prints the state catalogue and `unitlc parse-url` shows
//! how a unit URL is understood. Neither touches a subsystem.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use unitlc_core::{ProtocolMetadata, StateKind, UnitIdentifier, UnitState};

/// Arguments for `unitlc states`.
#[derive(Args, Debug)]
pub struct StatesArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,

    /// Only list states of this kind.
    #[arg(long, value_parser = parse_kind)]
    pub kind: Option<StateKind>,
}

/// Arguments for `unitlc parse-url`.
#[derive(Args, Debug)]
pub struct ParseUrlArgs {
    /// Unit URL, e.g. `installbundle:/dlc/Maps/Maps.unit?Bundles=MapsCore`.
    pub url: String,
}

/// One row of the state catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateRow {
    pub ordinal: u8,
    pub name: &'static str,
    pub kind: StateKind,
}

/// How a unit URL parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedUrlReport {
    pub identifying: String,
    pub protocol: String,
    pub name: String,
    pub descriptor_path: String,
    pub metadata: ProtocolMetadata,
}

fn parse_kind(text: &str) -> Result<StateKind, String> {
    match text.to_ascii_lowercase().as_str() {
        "transition" => Ok(StateKind::Transition),
        "destination" => Ok(StateKind::Destination),
        "error" => Ok(StateKind::Error),
        other => Err(format!("unknown state kind {other:?} (transition, destination, error)")),
    }
}

/// The catalogue, optionally filtered by kind.
pub fn state_rows(kind: Option<StateKind>) -> Vec<StateRow> {
    UnitState::ALL
        .iter()
        .filter(|state| kind.map_or(true, |k| state.kind() == k))
        .map(|state| StateRow {
            ordinal: state.ordinal(),
            name: state.name(),
            kind: state.kind(),
        })
        .collect()
}

/// Execute `unitlc states`.
pub fn run_states(args: &StatesArgs) -> Result<u8> {
    let rows = state_rows(args.kind);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            println!("{:>2}  {:<30} {}", row.ordinal, row.name, row.kind);
        }
    }
    Ok(0)
}

/// Parse `url` into a report.
pub fn parse_url(url: &str) -> Result<ParsedUrlReport> {
    let id = UnitIdentifier::new(url).with_context(|| format!("not a unit URL: {url}"))?;
    let parsed = id.parse().with_context(|| format!("failed to parse {url}"))?;
    Ok(ParsedUrlReport {
        identifying: id.identifying_str().to_string(),
        protocol: id.protocol().to_string(),
        name: parsed.name,
        descriptor_path: parsed.descriptor_path,
        metadata: parsed.metadata,
    })
}

/// Execute `unitlc parse-url`.
pub fn run_parse_url(args: &ParseUrlArgs) -> Result<u8> {
    let report = parse_url(&args.url)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}
