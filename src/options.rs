//! Session options.
//!
//! [`MultihostOptions`] is a `clap::Args` group so that test harness binaries
//! can flatten it into their own command line. Every option also reads an
//! `MH_*` environment variable.

use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;

use crate::artifacts::ArtifactsMode;
use crate::logging::MultihostLogger;

/// Options controlling a multihost session.
#[derive(Debug, Clone, PartialEq, Eq, Args, Serialize, Deserialize)]
pub struct MultihostOptions {
    /// Path to the multihost configuration file
    #[arg(long = "mh-config", env = "MH_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to the multihost log file
    #[arg(long = "mh-log-path", env = "MH_LOG_PATH", value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Connect to hosts on first use instead of at session start
    #[arg(long = "mh-lazy-ssh", env = "MH_LAZY_SSH")]
    pub lazy_ssh: bool,

    /// Run only tests with these topology names
    #[arg(
        long = "mh-topology",
        env = "MH_TOPOLOGY",
        value_name = "NAME",
        value_delimiter = ','
    )]
    pub topology: Vec<String>,

    /// Do not run tests with these topology names
    #[arg(
        long = "mh-not-topology",
        env = "MH_NOT_TOPOLOGY",
        value_name = "NAME",
        value_delimiter = ','
    )]
    pub not_topology: Vec<String>,

    /// Run only tests whose topology matches the inventory exactly
    #[arg(long = "mh-exact-topology", env = "MH_EXACT_TOPOLOGY")]
    pub exact_topology: bool,

    /// When to collect artifacts
    #[arg(
        long = "mh-collect-artifacts",
        env = "MH_COLLECT_ARTIFACTS",
        value_enum,
        default_value_t = ArtifactsMode::OnFailure
    )]
    pub collect_artifacts: ArtifactsMode,

    /// Directory where artifacts are stored
    #[arg(
        long = "mh-artifacts-dir",
        env = "MH_ARTIFACTS_DIR",
        value_name = "PATH",
        default_value = "artifacts"
    )]
    pub artifacts_dir: PathBuf,

    /// Store artifacts as .tgz archives
    #[arg(long = "mh-compress-artifacts", env = "MH_COMPRESS_ARTIFACTS")]
    pub compress_artifacts: bool,

    /// When to store test logs; defaults to --mh-collect-artifacts
    #[arg(long = "mh-collect-logs", env = "MH_COLLECT_LOGS", value_enum)]
    pub collect_logs: Option<ArtifactsMode>,

    /// Run every topology of a test, ignoring its preferred topology
    #[arg(long = "mh-ignore-preferred-topology", env = "MH_IGNORE_PREFERRED_TOPOLOGY")]
    pub ignore_preferred_topology: bool,
}

impl Default for MultihostOptions {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            lazy_ssh: false,
            topology: Vec::new(),
            not_topology: Vec::new(),
            exact_topology: false,
            collect_artifacts: ArtifactsMode::OnFailure,
            artifacts_dir: PathBuf::from("artifacts"),
            compress_artifacts: false,
            collect_logs: None,
            ignore_preferred_topology: false,
        }
    }
}

#[derive(Parser)]
#[command(name = "multihost", about = "Run a multihost test session")]
struct OptionsCli {
    #[command(flatten)]
    mh: MultihostOptions,
}

impl MultihostOptions {
    /// Parses the process arguments, exiting with usage on error.
    pub fn from_args() -> Self {
        OptionsCli::parse().mh
    }

    /// Parses an explicit argument list; the first item is the program name.
    pub fn try_parse_from<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        OptionsCli::try_parse_from(args).map(|cli| cli.mh)
    }

    /// Log collection mode.
    pub fn collect_logs(&self) -> ArtifactsMode {
        self.collect_logs.unwrap_or(self.collect_artifacts)
    }

    /// True if a topology filter is given.
    pub fn has_topology_filter(&self) -> bool {
        !self.topology.is_empty() || !self.not_topology.is_empty()
    }

    /// Writes the settings to the session log.
    pub fn log(&self, logger: &MultihostLogger) {
        let mut filter: Vec<String> = self.topology.clone();
        filter.extend(self.not_topology.iter().map(|t| format!("!{t}")));
        let or_unset = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "not set".to_string())
        };

        logger.info("Additional settings:");
        logger.info(format!("  config file: {}", or_unset(&self.config)));
        logger.info(format!("  log path: {}", or_unset(&self.log_path)));
        logger.info(format!("  lazy ssh: {}", self.lazy_ssh));
        logger.info(format!(
            "  topology filter: {}",
            if filter.is_empty() { "all".to_string() } else { filter.join(", ") }
        ));
        logger.info(format!("  require exact topology: {}", self.exact_topology));
        logger.info(format!("  collect artifacts: {}", self.collect_artifacts));
        logger.info(format!("  artifacts directory: {}", self.artifacts_dir.display()));
        logger.info(format!("  compress artifacts: {}", self.compress_artifacts));
        logger.info(format!("  collect logs: {}", self.collect_logs()));
        logger.info(format!(
            "  ignore preferred topology: {}",
            self.ignore_preferred_topology
        ));
    }
}
