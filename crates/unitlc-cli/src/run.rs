//! # Run Subcommand
//!
//! Drives every unit listed in a manifest toward its target range using the
//! simulated collaborators, then reports where each unit ended up.
//!
//! The subsystem lives on a single-threaded tokio runtime and is ticked from
//! the driver loop. In manual completion mode a spawned latency task plays
//! the part of the installer and loader workers: it sleeps for the
//! manifest's latency and then completes everything queued, so completions
//! arrive through the driver queue exactly as real worker threads would
//! deliver them.
//!
//! Exit codes: `0` when every requested unit reached its target, `2` when
//! any request failed, was rejected, or was still pending at `--max-ticks`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use uuid::Uuid;

use unitlc_core::{ErrorKind, StateRange, UnitId, UnitIdentifier, UnitState};
use unitlc_state::sim::{CompletionMode, SimHost};
use unitlc_state::{TransitionOutcome, UnitSubsystem};

use crate::manifest::{parse_target, RunManifest};

/// Sleep between driver ticks, giving the latency task a chance to run.
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Arguments for `unitlc run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the run manifest (YAML).
    #[arg(long)]
    pub manifest: PathBuf,

    /// Destination for units that do not name their own (`State` or `Min..Max`).
    #[arg(long, default_value = "Active")]
    pub target: String,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Give up after this many ticks.
    #[arg(long, default_value_t = 1_000)]
    pub max_ticks: usize,
}

/// Final report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ticks: usize,
    /// Every request finished and the subsystem went idle.
    pub settled: bool,
    pub units: Vec<UnitReport>,
}

impl RunReport {
    /// Whether every requested unit reached its target.
    pub fn all_succeeded(&self) -> bool {
        self.settled
            && self
                .units
                .iter()
                .all(|u| matches!(u.result, UnitResult::Succeeded | UnitResult::NotRequested))
    }

    /// The report entry for the unit named `name`.
    pub fn unit(&self, name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.name == name)
    }
}

/// Where one unit ended up.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub url: String,
    pub name: String,
    /// Final state. Destroyed units report Terminal.
    pub state: UnitState,
    /// Range the unit was asked to reach, if it was listed.
    pub requested: Option<StateRange>,
    pub result: UnitResult,
    pub progress: f32,
    pub unrecoverable: bool,
}

/// Result of a unit's request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitResult {
    Succeeded,
    Failed { kind: ErrorKind, code: String },
    Rejected,
    Pending,
    /// Created as a dependency of a listed unit.
    NotRequested,
}

impl std::fmt::Display for UnitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => f.write_str("ok"),
            Self::Failed { code, .. } => write!(f, "failed: {code}"),
            Self::Rejected => f.write_str("rejected"),
            Self::Pending => f.write_str("pending"),
            Self::NotRequested => f.write_str("-"),
        }
    }
}

struct Request {
    url: String,
    unit: UnitId,
    range: StateRange,
    accepted: bool,
}

type Outcomes = Rc<RefCell<BTreeMap<UnitId, TransitionOutcome>>>;

/// Execute `unitlc run`.
pub fn run_run(args: &RunArgs) -> Result<u8> {
    let report = run_manifest(args)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_table(&report);
    }
    Ok(if report.all_succeeded() { 0 } else { 2 })
}

/// Load the manifest named by `args` and drive it to completion.
pub fn run_manifest(args: &RunArgs) -> Result<RunReport> {
    let manifest = RunManifest::load(&args.manifest)?;
    let default_target = parse_target(&args.target).context("invalid --target")?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(drive(manifest, default_target, args.max_ticks))
}

/// Drive `manifest` on the current runtime.
pub async fn drive(manifest: RunManifest, default_target: StateRange, max_ticks: usize) -> Result<RunReport> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    tracing::info!(run_id = %run_id, units = manifest.units.len(), "run started");

    let host = manifest.build_host()?;
    let mut sub = UnitSubsystem::new(manifest.config.clone(), host.services());
    let latency = (manifest.completion == CompletionMode::Manual)
        .then(|| spawn_latency(host.clone(), Duration::from_millis(manifest.latency_ms.max(1))));

    let outcomes: Outcomes = Rc::new(RefCell::new(BTreeMap::new()));
    let mut requests = Vec::with_capacity(manifest.units.len());
    for entry in &manifest.units {
        let range = match &entry.target {
            Some(text) => parse_target(text)?,
            None => default_target,
        };
        let unit = sub
            .find_or_create(&entry.url, entry.options.clone())
            .with_context(|| format!("failed to create unit {}", entry.url))?;
        let sink = outcomes.clone();
        let answer = sub.set_destination(unit, range, move |_, outcome| {
            sink.borrow_mut().insert(outcome.unit, outcome.clone());
        });
        if !answer.accepted() {
            tracing::warn!(unit = %unit, url = %entry.url, range = %range, "destination request rejected");
        }
        requests.push(Request {
            url: entry.url.clone(),
            unit,
            range,
            accepted: answer.accepted(),
        });
    }

    let mut ticks = 0;
    let mut settled = is_settled(&sub, &host, &requests, &outcomes);
    while !settled && ticks < max_ticks {
        let summary = sub.tick();
        ticks += 1;
        if summary.events + summary.driven + summary.batches > 0 {
            tracing::debug!(
                tick = ticks,
                events = summary.events,
                driven = summary.driven,
                batches = summary.batches,
                "tick"
            );
        }
        tokio::time::sleep(TICK_INTERVAL).await;
        settled = is_settled(&sub, &host, &requests, &outcomes);
    }

    if let Some(task) = latency {
        task.abort();
    }
    if !settled {
        tracing::warn!(run_id = %run_id, ticks, "run did not settle before the tick limit");
    }

    let units = collect_reports(&sub, &requests, &outcomes);
    let report = RunReport {
        run_id,
        started_at,
        finished_at: Utc::now(),
        ticks,
        settled,
        units,
    };
    tracing::info!(run_id = %run_id, ticks, settled, succeeded = report.all_succeeded(), "run finished");
    Ok(report)
}

fn spawn_latency(host: SimHost, delay: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(delay).await;
            let completed = host.complete_all();
            if completed > 0 {
                tracing::debug!(completed, "simulated work completed");
            }
        }
    })
}

fn is_settled(sub: &UnitSubsystem, host: &SimHost, requests: &[Request], outcomes: &Outcomes) -> bool {
    let answered = {
        let outcomes = outcomes.borrow();
        requests
            .iter()
            .all(|r| !r.accepted || outcomes.contains_key(&r.unit))
    };
    answered && sub.is_idle() && host.installer.pending_ops() == 0 && host.loader.outstanding() == 0
}

fn collect_reports(sub: &UnitSubsystem, requests: &[Request], outcomes: &Outcomes) -> Vec<UnitReport> {
    let outcomes = outcomes.borrow();
    let mut reports = Vec::new();
    for request in requests {
        let result = match (request.accepted, outcomes.get(&request.unit)) {
            (false, _) => UnitResult::Rejected,
            (true, None) => UnitResult::Pending,
            (true, Some(outcome)) => match &outcome.result {
                Ok(()) => UnitResult::Succeeded,
                Err(error) => UnitResult::Failed {
                    kind: error.kind,
                    code: error.code.clone(),
                },
            },
        };
        reports.push(unit_report(sub, request.unit, &request.url, Some(request.range), result));
    }

    for unit in sub.active_units() {
        if requests.iter().any(|r| r.unit == unit) {
            continue;
        }
        if let Some(snapshot) = sub.snapshot(unit) {
            reports.push(unit_report(sub, unit, &snapshot.url, None, UnitResult::NotRequested));
        }
    }
    reports
}

fn unit_report(
    sub: &UnitSubsystem,
    unit: UnitId,
    url: &str,
    requested: Option<StateRange>,
    result: UnitResult,
) -> UnitReport {
    match sub.snapshot(unit) {
        Some(snapshot) => UnitReport {
            url: url.to_string(),
            name: snapshot.name,
            state: snapshot.state,
            requested,
            result,
            progress: snapshot.progress,
            unrecoverable: snapshot.unrecoverable,
        },
        None => UnitReport {
            url: url.to_string(),
            name: UnitIdentifier::new(url)
                .ok()
                .and_then(|id| id.parse().ok())
                .map(|parsed| parsed.name)
                .unwrap_or_default(),
            state: UnitState::Terminal,
            requested,
            result,
            progress: 0.0,
            unrecoverable: false,
        },
    }
}

fn print_table(report: &RunReport) {
    println!(
        "run {} ({} ticks, {})",
        report.run_id,
        report.ticks,
        if report.settled { "settled" } else { "not settled" }
    );
    for unit in &report.units {
        let requested = unit
            .requested
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} {:<30} {:<24} {}",
            unit.name,
            unit.state.to_string(),
            requested,
            unit.result
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &tempfile::TempDir, yaml: &str) -> PathBuf {
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    fn args(manifest: PathBuf) -> RunArgs {
        RunArgs {
            manifest,
            target: "Active".to_string(),
            json: false,
            max_ticks: 200,
        }
    }

    #[test]
    fn file_units_reach_active() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            &dir,
            "units:\n  - url: file:/units/Weather/Weather.unit\n",
        );
        let report = run_manifest(&args(path)).unwrap();
        assert!(report.settled);
        assert!(report.all_succeeded());
        let weather = report.unit("Weather").unwrap();
        assert_eq!(weather.state, UnitState::Active);
        assert_eq!(weather.result, UnitResult::Succeeded);
    }

    #[test]
    fn failures_set_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            &dir,
            "units:\n  - url: file:/units/Broken/Broken.unit\n    missing_feature_data: true\n",
        );
        assert_eq!(run_run(&args(path)).unwrap(), 2);
    }

    #[test]
    fn invalid_default_target_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(&dir, "units:\n  - url: file:/units/A/A.unit\n");
        let mut args = args(path);
        args.target = "Downloading".to_string();
        let err = run_manifest(&args).unwrap_err();
        assert!(format!("{err:#}").contains("invalid --target"));
    }

    #[test]
    fn result_display() {
        let failed = UnitResult::Failed {
            kind: ErrorKind::Mount,
            code: "unit.lifecycle.Mounting.Failed_To_Register_Unit".into(),
        };
        assert_eq!(failed.to_string(), "failed: unit.lifecycle.Mounting.Failed_To_Register_Unit");
        assert_eq!(UnitResult::Succeeded.to_string(), "ok");
    }
}
