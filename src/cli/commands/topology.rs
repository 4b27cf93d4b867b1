//! Topology command - prints the topology an inventory provides

use super::CommandContext;
use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use multihost::options::MultihostOptions;

/// Arguments for the topology command
#[derive(Parser, Debug, Clone)]
pub struct TopologyArgs {
    #[command(flatten)]
    pub mh: MultihostOptions,
}

impl TopologyArgs {
    /// Execute the topology command
    pub async fn execute(&self, ctx: &CommandContext) -> Result<i32> {
        let config = ctx.load_inventory(&self.mh)?;
        let topology = config.topology();

        ctx.emit(&topology.export(), || {
            for domain in topology.domains() {
                println!("{}", domain.id.bold());
                for (role, count) in &domain.roles {
                    println!("  {role}: {count}");
                }
            }
        })?;

        Ok(0)
    }
}
