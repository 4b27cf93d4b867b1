//! Check command - validates an inventory and previews topology selection
//!
//! Without `--marks` the inventory is only loaded. With `--marks` every
//! topology mark from the file is validated and matched against the
//! inventory using the same selection rules as a test session.

use super::CommandContext;
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use indexmap::IndexMap;
use multihost::marks::TopologyMark;
use multihost::options::MultihostOptions;
use multihost::runner::collection::{expand, select};
use multihost::runner::TestCase;
use multihost::topology::Topology;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Arguments for the check command
#[derive(Parser, Debug, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub mh: MultihostOptions,

    /// YAML file with a list of topology marks
    #[arg(long)]
    pub marks: Option<PathBuf>,
}

/// A topology mark as written in a marks file.
#[derive(Debug, Deserialize)]
struct MarkEntry {
    name: String,
    topology: serde_json::Value,
    #[serde(default)]
    fixtures: IndexMap<String, String>,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    domains: usize,
    hosts: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    marks: Vec<MarkStatus>,
}

#[derive(Debug, Serialize)]
struct MarkStatus {
    name: String,
    topology: String,
    selected: bool,
}

fn load_marks(path: &Path) -> Result<Vec<TopologyMark>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read marks file: {}", path.display()))?;
    let entries: Vec<MarkEntry> = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse marks file: {}", path.display()))?;

    entries
        .into_iter()
        .map(|entry| {
            let topology = Topology::from_export(&entry.topology)
                .with_context(|| format!("Invalid topology in mark {}", entry.name))?;
            let mark = entry
                .fixtures
                .into_iter()
                .fold(TopologyMark::new(&entry.name, topology), |mark, (name, path)| {
                    mark.with_fixture(name, path)
                });
            mark.validate()
                .with_context(|| format!("Invalid topology mark {}", mark.name()))?;
            Ok(mark)
        })
        .collect()
}

fn describe(topology: &Topology) -> String {
    topology
        .domains()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl CheckArgs {
    /// Execute the check command
    pub async fn execute(&self, ctx: &CommandContext) -> Result<i32> {
        let config = ctx.load_inventory(&self.mh)?;
        let provided = config.topology();

        let mut report = CheckReport {
            domains: config.domains().len(),
            hosts: config.hosts().len(),
            marks: Vec::new(),
        };

        if let Some(ref path) = self.marks {
            for mark in load_marks(path)? {
                let case = TestCase::new(mark.name(), |_| async { Ok(()) }).topology(mark.clone());
                let selection = select(expand(Arc::new(case)), &provided, &self.mh);
                report.marks.push(MarkStatus {
                    name: mark.name().to_string(),
                    topology: describe(mark.topology()),
                    selected: !selection.selected.is_empty(),
                });
            }
        }

        ctx.emit(&report, || {
            println!(
                "{} {} domains, {} hosts",
                "Inventory OK:".green(),
                report.domains,
                report.hosts
            );
            for status in &report.marks {
                let flag = if status.selected {
                    "RUN ".green()
                } else {
                    "SKIP".yellow()
                };
                println!("  {flag} {} [{}]", status.name, status.topology);
            }
        })?;

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_marks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
- name: client
  topology:
    - id: test
      hosts:
        client: 1
  fixtures:
    client: test.client[0]
- name: ldap
  topology:
    - id: test
      hosts:
        client: 1
        ldap: 1
"#
        )
        .unwrap();

        let marks = load_marks(file.path()).unwrap();
        assert_eq!(marks.len(), 2);
        assert_eq!(marks[0].name(), "client");
        assert_eq!(marks[0].fixtures().get("client").map(String::as_str), Some("test.client[0]"));
        assert_eq!(describe(marks[1].topology()), "test(client=1, ldap=1)");
    }

    #[test]
    fn test_load_marks_rejects_bad_fixture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
- name: client
  topology:
    - id: test
      hosts:
        client: 1
  fixtures:
    server: test.server
"#
        )
        .unwrap();

        assert!(load_marks(file.path()).is_err());
    }
}
