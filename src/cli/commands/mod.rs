//! Subcommands module for multihost CLI

pub mod check;
pub mod completions;
pub mod exec;
pub mod hosts;
pub mod topology;

use anyhow::{Context, Result};
use multihost::artifacts::ArtifactsCollector;
use multihost::inventory::{ConfigSettings, MultihostConfig, MultihostRegistry};
use multihost::logging::MultihostLogger;
use multihost::options::MultihostOptions;
use serde::Serialize;

use crate::cli::{Cli, OutputFormat};
use crate::config::{expand_path, Config};

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration
    pub config: Config,
    /// Output format
    pub output: OutputFormat,
    /// Verbosity level
    pub verbosity: u8,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &Cli, config: Config) -> Self {
        Self {
            config,
            output: cli.output,
            verbosity: cli.verbosity(),
        }
    }

    /// Loads the inventory named by `--mh-config`, falling back to the
    /// configured default. Hosts are not connected.
    pub fn load_inventory(&self, mh: &MultihostOptions) -> Result<MultihostConfig> {
        let path = mh
            .config
            .as_deref()
            .map(expand_path)
            .or_else(|| self.config.inventory_path())
            .context("No inventory given, use --mh-config or set `inventory` in multihost.toml")?;

        let logger = match mh.log_path {
            Some(ref log_path) => MultihostLogger::with_log_file(expand_path(log_path))?,
            None => MultihostLogger::new(),
        };
        let settings = ConfigSettings {
            lazy_connect: true,
            artifacts: ArtifactsCollector::new(
                mh.artifacts_dir.clone(),
                mh.collect_artifacts,
                mh.compress_artifacts,
            ),
            logger,
        };

        MultihostConfig::from_yaml_file(&path, &MultihostRegistry::generic(), settings)
            .with_context(|| format!("Unable to load inventory {}", path.display()))
    }

    /// Prints `value` as JSON or YAML, or calls `text` for text output.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce()) -> Result<()> {
        match self.output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
            OutputFormat::Text => text(),
        }
        Ok(())
    }
}
