//! Hosts command - lists inventory hosts and optionally checks connections

use super::CommandContext;
use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use multihost::inventory::MultihostHost;
use multihost::options::MultihostOptions;
use serde::Serialize;

/// Arguments for the hosts command
#[derive(Parser, Debug, Clone)]
pub struct HostsArgs {
    #[command(flatten)]
    pub mh: MultihostOptions,

    /// Only hosts of this role
    #[arg(long)]
    pub role: Option<String>,

    /// Connect to every host and report the result
    #[arg(long)]
    pub connect: bool,
}

#[derive(Debug, Serialize)]
struct HostEntry {
    domain: String,
    role: String,
    hostname: String,
    os_family: String,
    conn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reachable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn conn_type(host: &dyn MultihostHost) -> String {
    host.base().raw()["conn"]["type"]
        .as_str()
        .unwrap_or("ssh")
        .to_string()
}

impl HostsArgs {
    /// Execute the hosts command
    pub async fn execute(&self, ctx: &CommandContext) -> Result<i32> {
        let config = ctx.load_inventory(&self.mh)?;

        let mut entries = Vec::new();
        for host in config.hosts() {
            if self.role.as_deref().is_some_and(|r| r != host.role()) {
                continue;
            }

            let mut entry = HostEntry {
                domain: host.base().domain_id().to_string(),
                role: host.role().to_string(),
                hostname: host.hostname().to_string(),
                os_family: host.base().os_family().to_string(),
                conn: conn_type(host.as_ref()),
                reachable: None,
                error: None,
            };

            if self.connect {
                match host.conn().connect().await {
                    Ok(()) => entry.reachable = Some(true),
                    Err(e) => {
                        entry.reachable = Some(false);
                        entry.error = Some(e.to_string());
                    }
                }
            }
            entries.push(entry);
        }
        config.disconnect().await;

        ctx.emit(&entries, || {
            for entry in &entries {
                let status = match entry.reachable {
                    Some(true) => format!(" {}", "ok".green()),
                    Some(false) => format!(" {}", "unreachable".red()),
                    None => String::new(),
                };
                println!(
                    "{:<10} {:<12} {:<32} {:<8} {}{status}",
                    entry.domain, entry.role, entry.hostname, entry.os_family, entry.conn
                );
                if let Some(ref error) = entry.error {
                    println!("    {}", error.dimmed());
                }
            }
        })?;

        let failed = entries.iter().any(|e| e.reachable == Some(false));
        Ok(if failed { 1 } else { 0 })
    }
}
