pub mod config;
pub mod scenario;
pub mod validate;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use config::Config;

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Virtual-user load generator with staged ramps and thresholds", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test plan
    Run {
        /// Path to the plan file (YAML/JSON)
        plan: PathBuf,
        /// Number of concurrent VUs (replaces the file's value and stages)
        #[arg(short = 'u', long, alias = "workers")]
        vus: Option<usize>,
        /// Test duration, e.g. 30s or 5m (replaces the file's stages)
        #[arg(short, long)]
        duration: Option<String>,
        /// Iterations per VU
        #[arg(long)]
        iterations: Option<u64>,
        /// Print the end-of-test summary as JSON instead of text
        #[arg(long)]
        json: bool,
        /// Export the JSON summary to a file
        #[arg(long, alias = "export-json")]
        summary_export: Option<PathBuf>,
        /// Extra outputs, e.g. --out csv=results.csv
        #[arg(long)]
        out: Vec<String>,
        /// Enable interactive control mode (pause, resume, tag, status, stop)
        #[arg(long, short = 'i')]
        interactive: bool,
    },
    /// Validate a plan without running it
    Validate {
        /// Path to the plan file (YAML/JSON)
        plan: PathBuf,
    },
    /// Print the plan file JSON schema
    Schema {
        /// Write the schema to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Plan-file fields that can be set from the command line.
pub fn overrides(vus: Option<usize>, duration: Option<String>, iterations: Option<u64>) -> Config {
    Config {
        workers: vus,
        duration,
        iterations,
        ..Default::default()
    }
}

/// An `--out` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Csv(PathBuf),
    Json(PathBuf),
}

pub fn parse_output(spec: &str) -> anyhow::Result<Output> {
    match spec.split_once('=') {
        Some(("csv", path)) if !path.is_empty() => Ok(Output::Csv(PathBuf::from(path))),
        Some(("json", path)) if !path.is_empty() => Ok(Output::Json(PathBuf::from(path))),
        _ => anyhow::bail!("unsupported output '{}', expected csv=<path> or json=<path>", spec),
    }
}
