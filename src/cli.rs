//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Checklist scheduler and fan-out/fan-in job engine.
#[derive(Debug, Parser)]
#[command(name = "checkflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file. Defaults to ./checkflow.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs one scheduling pass over a JSON checklist file and prints the emitted jobs.
    Schedule {
        /// JSON array of checklists. Claimed checklists are written back.
        #[arg(long)]
        checklists: PathBuf,

        /// Pretend the current time is this epoch second.
        #[arg(long)]
        now: Option<i64>,
    },

    /// Runs scheduler and workers end to end with a simulated executor.
    Demo {
        /// Number of organizations, one checklist each.
        #[arg(long, default_value_t = 3)]
        organizations: usize,

        /// Keep markers on disk under this directory instead of in memory.
        #[arg(long)]
        marker_dir: Option<PathBuf>,

        /// Module that reports an error on every run. Repeatable.
        #[arg(long = "fail")]
        failing: Vec<String>,
    },

    /// Prints the effective configuration.
    Config,
}
