//! # unitlc CLI entry point
//!
//! Parses command-line arguments, installs the tracing subscriber, and
//! dispatches to subcommand handlers.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use unitlc_cli::inspect::{run_parse_url, run_states, ParseUrlArgs, StatesArgs};
use unitlc_cli::run::{run_run, RunArgs};

/// Unit lifecycle engine CLI.
///
/// Lists the lifecycle state catalogue, inspects unit URLs, and drives
/// simulated units through their lifecycle from a YAML manifest.
#[derive(Parser, Debug)]
#[command(name = "unitlc", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit log events as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the lifecycle state catalogue.
    States(StatesArgs),

    /// Parse a unit URL and print what it names.
    ParseUrl(ParseUrlArgs),

    /// Drive the units of a manifest with simulated collaborators.
    Run(RunArgs),
}

/// `RUST_LOG` wins; otherwise the level follows `-v`.
fn env_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(cli.verbose))
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let result = match cli.command {
        Commands::States(args) => run_states(&args),
        Commands::ParseUrl(args) => run_parse_url(&args),
        Commands::Run(args) => run_run(&args),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
