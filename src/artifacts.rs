//! Artifacts collection.
//!
//! Hosts, roles, utilities and topology controllers name files on the remote
//! host that should be downloaded when a test, a topology or the session
//! finishes. [`ArtifactsCollector`] gathers those names, packs the files on
//! the host and stores them under the artifacts directory, either as a
//! tarball or extracted.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::connection::{LogLevel, RunOptions};
use crate::controller::TopologyController;
use crate::error::{AggregateKind, Error, ErrorCollector, Result};
use crate::fixture::Outcome;
use crate::inventory::{MultihostHost, OsFamily};
use crate::role::MultihostRole;
use crate::utility::Utility;

/// When artifacts are collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactsMode {
    /// Never collect
    Never,
    /// Collect unless the operation passed or was skipped
    #[default]
    OnFailure,
    /// Always collect
    Always,
}

impl fmt::Display for ArtifactsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactsMode::Never => "never",
            ArtifactsMode::OnFailure => "on-failure",
            ArtifactsMode::Always => "always",
        })
    }
}

/// Point in the session where artifacts are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactsType {
    /// After session setup of a host
    PytestSetup,
    /// After session teardown of a host
    PytestTeardown,
    /// After topology setup
    TopologySetup,
    /// After topology teardown
    TopologyTeardown,
    /// After a test
    Test,
}

impl ArtifactsType {
    /// Name used in configuration and paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactsType::PytestSetup => "pytest_setup",
            ArtifactsType::PytestTeardown => "pytest_teardown",
            ArtifactsType::TopologySetup => "topology_setup",
            ArtifactsType::TopologyTeardown => "topology_teardown",
            ArtifactsType::Test => "test",
        }
    }
}

impl fmt::Display for ArtifactsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether artifacts are collected for an outcome.
///
/// In [`ArtifactsMode::OnFailure`] anything except passed and skipped is
/// collected, including [`Outcome::Unknown`].
pub fn should_collect_artifacts(mode: ArtifactsMode, outcome: Outcome) -> bool {
    match mode {
        ArtifactsMode::Never => false,
        ArtifactsMode::Always => true,
        ArtifactsMode::OnFailure => !matches!(outcome, Outcome::Passed | Outcome::Skipped),
    }
}

/// Makes `path` safe to use as a local path.
///
/// `":<>|*? [` become `-`, `]()` are removed.
pub fn sanitize_path(path: &str) -> String {
    path.chars()
        .filter(|c| !matches!(c, ']' | '(' | ')'))
        .map(|c| match c {
            '"' | ':' | '<' | '>' | '|' | '*' | '?' | ' ' | '[' => '-',
            other => other,
        })
        .collect()
}

/// Artifacts configured for a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostArtifacts {
    /// Collected after session setup
    pub pytest_setup: BTreeSet<String>,
    /// Collected after session teardown
    pub pytest_teardown: BTreeSet<String>,
    /// Collected after every test
    pub test: BTreeSet<String>,
}

impl HostArtifacts {
    /// Parses the `artifacts` key of a host.
    ///
    /// A list configures test artifacts; a map may set `pytest_setup`,
    /// `pytest_teardown` and `test`.
    pub fn from_value(value: Option<&serde_json::Value>) -> Result<Self> {
        let value = match value {
            None | Some(serde_json::Value::Null) => return Ok(Self::default()),
            Some(v) => v,
        };

        match value {
            serde_json::Value::Array(_) => Ok(Self {
                test: string_set(value)?,
                ..Self::default()
            }),
            serde_json::Value::Object(map) => {
                let allowed = ["pytest_setup", "pytest_teardown", "test"];
                if let Some(key) = map.keys().find(|k| !allowed.contains(&k.as_str())) {
                    return Err(Error::InvalidValue(format!(
                        "Invalid key: {key}, expected ['pytest_setup', 'pytest_teardown', 'test']"
                    )));
                }

                let get = |key: &str| map.get(key).map(string_set).transpose().map(Option::unwrap_or_default);
                Ok(Self {
                    pytest_setup: get("pytest_setup")?,
                    pytest_teardown: get("pytest_teardown")?,
                    test: get("test")?,
                })
            }
            other => Err(Error::InvalidValue(format!(
                "Unsupported artifacts configuration: {other}, expected list or dict"
            ))),
        }
    }

    /// Artifacts of a given type; topology types are not configured per host.
    pub fn get(&self, kind: ArtifactsType) -> BTreeSet<String> {
        match kind {
            ArtifactsType::PytestSetup => self.pytest_setup.clone(),
            ArtifactsType::PytestTeardown => self.pytest_teardown.clone(),
            ArtifactsType::Test => self.test.clone(),
            ArtifactsType::TopologySetup | ArtifactsType::TopologyTeardown => BTreeSet::new(),
        }
    }

    /// Adds an artifact; topology types are ignored.
    pub fn add(&mut self, kind: ArtifactsType, path: impl Into<String>) {
        let set = match kind {
            ArtifactsType::PytestSetup => &mut self.pytest_setup,
            ArtifactsType::PytestTeardown => &mut self.pytest_teardown,
            ArtifactsType::Test => &mut self.test,
            ArtifactsType::TopologySetup | ArtifactsType::TopologyTeardown => return,
        };
        set.insert(path.into());
    }
}

fn string_set(value: &serde_json::Value) -> Result<BTreeSet<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::InvalidValue(format!("Expected a list of artifacts, got {value}")))?;

    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(String::from)
                .ok_or_else(|| Error::InvalidValue(format!("Artifact must be a string, got {item}")))
        })
        .collect()
}

/// Artifacts a topology controller adds per host.
#[derive(Debug, Default)]
pub struct ControllerArtifacts {
    sets: Mutex<IndexMap<(ArtifactsType, String), BTreeSet<String>>>,
}

impl ControllerArtifacts {
    /// Adds an artifact for `hostname`.
    ///
    /// Only `topology_setup`, `topology_teardown` and `test` are kept.
    pub fn add(&self, kind: ArtifactsType, hostname: &str, path: impl Into<String>) -> Result<()> {
        if matches!(kind, ArtifactsType::PytestSetup | ArtifactsType::PytestTeardown) {
            return Err(Error::InvalidValue(format!(
                "Topology controller can not collect {kind} artifacts"
            )));
        }

        self.sets
            .lock()
            .entry((kind, hostname.to_string()))
            .or_default()
            .insert(path.into());
        Ok(())
    }

    /// Artifacts of `kind` for `hostname`.
    pub fn get(&self, kind: ArtifactsType, hostname: &str) -> BTreeSet<String> {
        self.sets
            .lock()
            .get(&(kind, hostname.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.sets.lock().clear();
    }
}

/// Something that can name artifacts to collect from a host.
pub trait ArtifactsCollectable: Send + Sync {
    /// Artifacts to collect from `host` at the `kind` collection point.
    fn collect_artifacts(&self, host: &dyn MultihostHost, kind: ArtifactsType) -> Result<BTreeSet<String>>;
}

impl ArtifactsCollectable for Arc<dyn MultihostHost> {
    fn collect_artifacts(&self, host: &dyn MultihostHost, kind: ArtifactsType) -> Result<BTreeSet<String>> {
        self.artifacts_list(host, kind)
    }
}

impl ArtifactsCollectable for Arc<dyn MultihostRole> {
    fn collect_artifacts(&self, host: &dyn MultihostHost, kind: ArtifactsType) -> Result<BTreeSet<String>> {
        self.artifacts_list(host, kind)
    }
}

impl ArtifactsCollectable for Arc<dyn Utility> {
    fn collect_artifacts(&self, host: &dyn MultihostHost, kind: ArtifactsType) -> Result<BTreeSet<String>> {
        self.artifacts_list(host, kind)
    }
}

impl ArtifactsCollectable for Arc<dyn TopologyController> {
    fn collect_artifacts(&self, host: &dyn MultihostHost, kind: ArtifactsType) -> Result<BTreeSet<String>> {
        self.artifacts_list(host, kind)
    }
}

/// Downloads artifacts from hosts into the artifacts directory.
#[derive(Debug, Clone)]
pub struct ArtifactsCollector {
    dir: PathBuf,
    mode: ArtifactsMode,
    compress: bool,
}

impl ArtifactsCollector {
    /// Creates a collector.
    pub fn new(dir: impl Into<PathBuf>, mode: ArtifactsMode, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            mode,
            compress,
        }
    }

    /// Artifacts directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Collection mode.
    pub fn mode(&self) -> ArtifactsMode {
        self.mode
    }

    /// True if artifacts are collected for `outcome`.
    pub fn should_collect(&self, outcome: Outcome) -> bool {
        should_collect_artifacts(self.mode, outcome)
    }

    /// Local destination of artifacts collected under `path`.
    pub fn destination(&self, path: &str) -> PathBuf {
        let dest = self.dir.join(sanitize_path(path));
        if self.compress {
            let mut name = dest.into_os_string();
            name.push(".tgz");
            PathBuf::from(name)
        } else {
            dest
        }
    }

    /// Builds the remote command that packs `artifacts` and prints the
    /// archive as base64.
    pub fn remote_command(artifacts: &[String]) -> String {
        let globs: Vec<String> = artifacts
            .iter()
            .map(|a| format!("$(compgen -G \"{a}\")"))
            .collect();

        format!(
            "tmp=`mktemp /tmp/mh.host.artifacts.XXXXXXXXX`\n\
             tar -hczvf \"$tmp\" {} &> /dev/null\n\
             base64 \"$tmp\"\n\
             rm -f \"$tmp\" &> /dev/null",
            globs.join(" ")
        )
    }

    /// Collects artifacts of `kind` from `host` into `path` (relative to the
    /// artifacts directory).
    ///
    /// Every collectable is asked for its list; if any of them fails the
    /// errors are returned together and nothing is downloaded.
    pub async fn collect(
        &self,
        host: &dyn MultihostHost,
        kind: ArtifactsType,
        path: &str,
        outcome: Outcome,
        collectables: &[&dyn ArtifactsCollectable],
    ) -> Result<Option<PathBuf>> {
        let logger = host.base().logger();
        if !self.should_collect(outcome) {
            logger.info("Artifacts are not collected");
            return Ok(None);
        }

        let mut errors = ErrorCollector::new();
        let mut set = BTreeSet::new();
        for collectable in collectables {
            if let Some(items) = errors.record(collectable.collect_artifacts(host, kind)) {
                set.extend(items);
            }
        }
        errors.finish(AggregateKind::Artifacts, "Unable to gather list of artifacts")?;

        let artifacts: Vec<String> = set.into_iter().collect();
        if artifacts.is_empty() {
            logger.info("No artifacts to collect.");
            return Ok(None);
        }

        let dest = self.dir.join(sanitize_path(path));
        logger.info(format!(
            "Collecting artifacts into {}: {}",
            self.destination(path).display(),
            artifacts.join(", ")
        ));

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if host.base().os_family() == OsFamily::Windows {
            return Err(Error::NotImplemented(
                "Artifacts are not supported on Windows machine".to_string(),
            ));
        }

        let result = host
            .base()
            .conn()
            .run(
                &Self::remote_command(&artifacts),
                RunOptions::new().log_level(LogLevel::Error),
            )
            .await?;

        let encoded: String = result.stdout_lines.concat();
        if encoded.trim().is_empty() {
            return Ok(None);
        }

        let archive = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidValue(format!("Invalid artifacts archive: {e}")))?;

        self.store(&dest, &archive).map(Some)
    }

    /// Writes a downloaded gzip tarball, either as is or extracted.
    pub fn store(&self, dest: &Path, archive: &[u8]) -> Result<PathBuf> {
        if self.compress {
            let mut name = dest.as_os_str().to_os_string();
            name.push(".tgz");
            let tgz = PathBuf::from(name);
            std::fs::write(&tgz, archive)?;
            Ok(tgz)
        } else {
            let mut tar = tar::Archive::new(GzDecoder::new(archive));
            std::fs::create_dir_all(dest)?;
            tar.unpack(dest)?;
            Ok(dest.to_path_buf())
        }
    }
}
