//! Completions command - shell completion scripts for the multihost CLI

use super::CommandContext;
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{generate, generate_to, Shell};
use std::io::Write;
use std::path::PathBuf;

use crate::cli::Cli;

/// Arguments for the completions command
#[derive(Parser, Debug, Clone)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,

    /// Write the script into this directory instead of standard output
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,
}

/// Renders the completion script of `shell` into `out`.
pub fn render(shell: Shell, out: &mut dyn Write) {
    generate(shell, &mut Cli::command(), "multihost", out);
}

impl CompletionsArgs {
    /// Execute the completions command
    pub async fn execute(&self, ctx: &CommandContext) -> Result<i32> {
        let Some(ref dir) = self.dir else {
            render(self.shell, &mut std::io::stdout());
            return Ok(0);
        };

        std::fs::create_dir_all(dir).with_context(|| format!("Unable to create {}", dir.display()))?;
        let path = generate_to(self.shell, &mut Cli::command(), "multihost", dir)
            .with_context(|| format!("Unable to write completions into {}", dir.display()))?;

        ctx.emit(&path, || println!("{}", path.display()))?;
        Ok(0)
    }
}
