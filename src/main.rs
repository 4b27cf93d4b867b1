//! multihost - inspect and exercise multihost test inventories
//!
//! This is the main entry point for the multihost CLI.

mod cli;
mod config;

use anyhow::Result;
use cli::commands::CommandContext;
use cli::{Cli, Commands};
use config::Config;
use multihost::logging::{level_from_verbosity, LoggingBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let config = Config::load(cli.settings.as_ref()).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load settings: {e:#}");
        Config::default()
    });

    let color = config.logging.color && !cli.no_color;
    if !color {
        colored::control::set_override(false);
    }
    init_logging(&cli, &config, color);

    tracing::debug!(version = %multihost::version_info(), "Starting");

    let ctx = CommandContext::new(&cli, config);

    let exit_code = match &cli.command {
        Commands::Topology(args) => args.execute(&ctx).await?,
        Commands::Hosts(args) => args.execute(&ctx).await?,
        Commands::Check(args) => args.execute(&ctx).await?,
        Commands::Exec(args) => args.execute(&ctx).await?,
        Commands::Completions(args) => args.execute(&ctx).await?,
    };

    std::process::exit(exit_code);
}

/// Initialize console logging from the command line and settings
fn init_logging(cli: &Cli, config: &Config, color: bool) {
    let verbosity = cli.verbosity();
    let mut builder = LoggingBuilder::new()
        .with_level(level_from_verbosity(verbosity))
        .with_format(cli.log_format.unwrap_or(config.logging.format))
        .with_ansi(color)
        .with_target(verbosity >= 3)
        .with_spans(verbosity >= 3);

    if let Some(ref filter) = config.logging.filter {
        builder = builder.with_filter(filter);
    }

    if let Err(e) = builder.init() {
        eprintln!("Warning: Failed to initialize logging: {e}");
    }
}
