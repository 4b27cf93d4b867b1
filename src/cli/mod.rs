//! CLI module for multihost
//!
//! Inspection and debugging commands for multihost inventories: detected
//! topology, hosts and their connections, which topology marks an inventory
//! can run, and ad hoc commands on a host.

pub mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use multihost::logging::LogFormat;
use std::path::PathBuf;

/// multihost - inspect and exercise multihost test inventories
#[derive(Parser, Debug, Clone)]
#[command(name = "multihost")]
#[command(version)]
#[command(about = "Inspect and exercise multihost test inventories", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Console log format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Path to the multihost.toml settings file
    #[arg(short = 'c', long = "settings", global = true, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Output format of command results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable output
    #[default]
    Text,
    /// JSON output for scripting
    Json,
    /// YAML output
    Yaml,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print the topology provided by an inventory
    Topology(commands::topology::TopologyArgs),

    /// List the hosts of an inventory
    Hosts(commands::hosts::HostsArgs),

    /// Check which topology marks an inventory can run
    Check(commands::check::CheckArgs),

    /// Run a command on one host
    Exec(commands::exec::ExecArgs),

    /// Generate shell completions
    Completions(commands::completions::CompletionsArgs),
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }
}
