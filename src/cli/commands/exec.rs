//! Exec command - runs a command on one inventory host

use super::CommandContext;
use anyhow::{Context, Result};
use clap::Parser;
use multihost::connection::{LogLevel, RunOptions};
use multihost::options::MultihostOptions;
use std::time::Duration;

/// Arguments for the exec command
#[derive(Parser, Debug, Clone)]
pub struct ExecArgs {
    #[command(flatten)]
    pub mh: MultihostOptions,

    /// Hostname of the target host
    #[arg(long)]
    pub host: String,

    /// Working directory on the host
    #[arg(long)]
    pub cwd: Option<String>,

    /// Timeout in seconds, 0 disables it
    #[arg(long, default_value = "300")]
    pub timeout: u64,

    /// Command and its arguments
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl ExecArgs {
    /// Execute the exec command
    pub async fn execute(&self, ctx: &CommandContext) -> Result<i32> {
        let config = ctx.load_inventory(&self.mh)?;
        let host = config
            .hosts()
            .into_iter()
            .find(|h| h.hostname() == self.host)
            .with_context(|| format!("Host {} is not in the inventory", self.host))?;

        let timeout = match self.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let level = if ctx.verbosity > 0 {
            LogLevel::Full
        } else {
            LogLevel::Silent
        };
        let mut options = RunOptions::new()
            .raise_on_error(false)
            .timeout(timeout)
            .log_level(level);
        if let Some(ref cwd) = self.cwd {
            options = options.cwd(cwd);
        }

        let argv: Vec<&str> = self.command.iter().map(String::as_str).collect();
        let result = host.conn().exec(&argv, options).await;
        config.disconnect().await;
        let result = result?;

        for line in &result.stdout_lines {
            println!("{line}");
        }
        for line in &result.stderr_lines {
            eprintln!("{line}");
        }

        Ok(result.rc)
    }
}
