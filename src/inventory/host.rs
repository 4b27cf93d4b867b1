//! Hosts of a multihost inventory.
//!
//! Every configured host becomes a [`HostBase`] holding the parsed
//! configuration, the connection and the bookkeeping the session needs. A
//! host type wraps it and implements [`MultihostHost`]; hosts that need
//! nothing special use [`GenericHost`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::validate::{validate_required, ConfigValue};
use crate::artifacts::{ArtifactsType, HostArtifacts};
use crate::connection::{Connection, ConnectionConfig, Shell};
use crate::error::{Error, Result};
use crate::logging::MultihostLogger;
use crate::utility::{OperationStatus, Utility};
use crate::utils::cli::CliBuilder;

/// Operating system family of a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// Linux, commands run through bash
    #[default]
    Linux,
    /// Windows, commands run through PowerShell
    Windows,
}

impl OsFamily {
    /// Shell used on this family.
    pub fn shell(&self) -> Shell {
        match self {
            OsFamily::Linux => Shell::Bash,
            OsFamily::Windows => Shell::Powershell,
        }
    }
}

impl FromStr for OsFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(OsFamily::Linux),
            "windows" => Ok(OsFamily::Windows),
            other => Err(Error::InvalidValue(format!(
                "Value \"{other}\" is not supported in os_family field of host configuration"
            ))),
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::Windows => write!(f, "windows"),
        }
    }
}

/// Common data of every host.
pub struct HostBase {
    hostname: String,
    role: String,
    domain_id: String,
    config: Value,
    raw: Value,
    os_family: OsFamily,
    conn: Arc<dyn Connection>,
    configured_artifacts: HostArtifacts,
    artifacts: Mutex<HostArtifacts>,
    op_state: OperationStatus,
    logger: MultihostLogger,
    vanilla_backup: Mutex<Option<Value>>,
}

impl HostBase {
    /// Keys every host must set.
    pub const REQUIRED_FIELDS: &'static [&'static str] = &["role", "hostname"];

    /// Parses a host entry of domain `domain_id`.
    ///
    /// The connection is created but not opened.
    pub fn from_config(domain_id: &str, raw: &Value, logger: &MultihostLogger) -> Result<Self> {
        validate_required(raw, Self::REQUIRED_FIELDS, "host")?;

        let hostname = raw
            .opt_str("hostname")?
            .ok_or_else(|| Error::missing_key("hostname", "host"))?;
        let role = raw
            .opt_str("role")?
            .ok_or_else(|| Error::missing_key("role", "host"))?;

        let os_family = match raw.opt_str("os.family")? {
            Some(family) => family.parse()?,
            None => OsFamily::Linux,
        };

        let logger = logger.child(format!("host={hostname}"));
        let conn = ConnectionConfig::from_value(raw.get("conn"), &hostname)?.build(
            &hostname,
            os_family.shell(),
            logger.clone(),
        )?;

        Ok(Self {
            configured_artifacts: HostArtifacts::from_value(raw.get("artifacts"))?,
            config: raw
                .get("config")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
            raw: raw.clone(),
            hostname,
            role,
            domain_id: domain_id.to_string(),
            os_family,
            conn,
            artifacts: Mutex::new(HostArtifacts::default()),
            op_state: OperationStatus::new(),
            logger,
            vanilla_backup: Mutex::new(None),
        })
    }

    /// Creates a Linux host over an existing connection.
    pub fn new(
        domain_id: impl Into<String>,
        hostname: impl Into<String>,
        role: impl Into<String>,
        conn: Arc<dyn Connection>,
    ) -> Self {
        let hostname = hostname.into();
        let role = role.into();
        let domain_id = domain_id.into();
        let logger = conn.logger().clone();

        Self {
            raw: serde_json::json!({"hostname": hostname, "role": role}),
            hostname,
            role,
            domain_id,
            config: Value::Object(Default::default()),
            os_family: OsFamily::Linux,
            conn,
            configured_artifacts: HostArtifacts::default(),
            artifacts: Mutex::new(HostArtifacts::default()),
            op_state: OperationStatus::new(),
            logger,
            vanilla_backup: Mutex::new(None),
        }
    }

    /// Sets the free-form `config` section.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Sets the configured artifacts.
    pub fn with_artifacts(mut self, artifacts: HostArtifacts) -> Self {
        self.configured_artifacts = artifacts;
        self
    }

    /// Sets the operating system family.
    pub fn with_os_family(mut self, os_family: OsFamily) -> Self {
        self.os_family = os_family;
        self
    }

    /// Hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Role name.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Id of the owning domain.
    pub fn domain_id(&self) -> &str {
        &self.domain_id
    }

    /// Custom `config` section, an empty mapping if not set.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Whole host entry as configured.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Operating system family.
    pub fn os_family(&self) -> OsFamily {
        self.os_family
    }

    /// Shell used by the connection.
    pub fn shell(&self) -> Shell {
        self.conn.shell()
    }

    /// Connection to the host.
    pub fn conn(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Command line builder for the host's shell.
    pub fn cli(&self) -> CliBuilder {
        CliBuilder::new(self.shell())
    }

    /// Operation states (`pytest_setup`, `setup`, ...).
    pub fn op_state(&self) -> &OperationStatus {
        &self.op_state
    }

    /// Host logger.
    pub fn logger(&self) -> &MultihostLogger {
        &self.logger
    }

    /// Artifacts from the configuration file.
    pub fn configured_artifacts(&self) -> &HostArtifacts {
        &self.configured_artifacts
    }

    /// Adds an artifact at runtime.
    pub fn add_artifact(&self, kind: ArtifactsType, path: impl Into<String>) {
        self.artifacts.lock().add(kind, path);
    }

    /// Configured and runtime artifacts of `kind`.
    pub fn artifacts(&self, kind: ArtifactsType) -> BTreeSet<String> {
        let mut set = self.configured_artifacts.get(kind);
        set.extend(self.artifacts.lock().get(kind));
        set
    }

    /// Backup taken at session start, if any.
    pub fn vanilla_backup(&self) -> Option<Value> {
        self.vanilla_backup.lock().clone()
    }

    /// Stores or clears the session start backup.
    pub fn set_vanilla_backup(&self, backup: Option<Value>) {
        *self.vanilla_backup.lock() = backup;
    }
}

impl fmt::Debug for HostBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBase")
            .field("hostname", &self.hostname)
            .field("role", &self.role)
            .field("domain_id", &self.domain_id)
            .field("os_family", &self.os_family)
            .finish_non_exhaustive()
    }
}

/// A host of the inventory.
///
/// Hooks run at session level ([`MultihostHost::pytest_setup`],
/// [`MultihostHost::pytest_teardown`]) and around every test
/// ([`MultihostHost::setup`], [`MultihostHost::teardown`]).
#[async_trait]
pub trait MultihostHost: Send + Sync + fmt::Debug {
    /// Common host data.
    fn base(&self) -> &HostBase;

    /// Reentrant utilities owned by the host. They are set up once per
    /// session and entered around every topology and test.
    fn utilities(&self) -> Vec<Arc<dyn Utility>> {
        Vec::new()
    }

    /// Called once before the first test.
    async fn pytest_setup(&self) -> Result<()> {
        Ok(())
    }

    /// Called once after the last test.
    async fn pytest_teardown(&self) -> Result<()> {
        Ok(())
    }

    /// Called before every test.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Called after every test.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    /// Artifacts to collect; configured plus runtime artifacts by default.
    fn artifacts_list(&self, host: &dyn MultihostHost, kind: ArtifactsType) -> Result<BTreeSet<String>> {
        let _ = host;
        Ok(self.base().artifacts(kind))
    }

    /// Backup support, see [`BackupHost`].
    fn as_backup(&self) -> Option<&dyn BackupHost> {
        None
    }

    /// Returns this as Any for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Hostname.
    fn hostname(&self) -> &str {
        self.base().hostname()
    }

    /// Role name.
    fn role(&self) -> &str {
        self.base().role()
    }

    /// Connection to the host.
    fn conn(&self) -> &Arc<dyn Connection> {
        self.base().conn()
    }
}

/// A host that can save and restore its state.
///
/// The backup is an opaque value produced by [`BackupHost::backup`] and
/// given back to [`BackupHost::restore`] and [`BackupHost::remove_backup`].
#[async_trait]
pub trait BackupHost: Send + Sync {
    /// Saves the current state.
    async fn backup(&self) -> Result<Value>;

    /// Restores a saved state.
    async fn restore(&self, backup: &Value) -> Result<()>;

    /// Deletes a saved state.
    async fn remove_backup(&self, backup: &Value) -> Result<()>;
}

/// Host without custom behaviour.
#[derive(Debug)]
pub struct GenericHost {
    base: HostBase,
}

impl GenericHost {
    /// Wraps a host base.
    pub fn new(base: HostBase) -> Self {
        Self { base }
    }
}

impl MultihostHost for GenericHost {
    fn base(&self) -> &HostBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_host_from_config() {
        let raw = json!({
            "hostname": "client.test",
            "role": "client",
            "conn": {"type": "local"},
            "artifacts": ["/var/log/sssd/*"],
            "config": {"realm": "TEST"},
        });
        let base = HostBase::from_config("test", &raw, &MultihostLogger::new()).unwrap();
        assert_eq!(base.hostname(), "client.test");
        assert_eq!(base.role(), "client");
        assert_eq!(base.domain_id(), "test");
        assert_eq!(base.os_family(), OsFamily::Linux);
        assert_eq!(base.config()["realm"], "TEST");
        assert_eq!(base.shell(), Shell::Bash);
        assert!(!base.conn().connected());

        base.add_artifact(ArtifactsType::Test, "/tmp/extra");
        let artifacts = base.artifacts(ArtifactsType::Test);
        assert!(artifacts.contains("/var/log/sssd/*"));
        assert!(artifacts.contains("/tmp/extra"));
    }

    #[test]
    fn test_host_missing_keys() {
        let err = HostBase::from_config("test", &json!({"hostname": "h"}), &MultihostLogger::new()).unwrap_err();
        assert_eq!(err.to_string(), "\"role\" property is missing in host configuration");

        let err = HostBase::from_config("test", &json!({"role": "client"}), &MultihostLogger::new()).unwrap_err();
        assert_eq!(err.to_string(), "\"hostname\" property is missing in host configuration");
    }

    #[test]
    fn test_host_os_family() {
        let raw = json!({
            "hostname": "dc.test",
            "role": "ad",
            "os": {"family": "Windows"},
            "conn": {"type": "local"},
        });
        let base = HostBase::from_config("test", &raw, &MultihostLogger::new()).unwrap();
        assert_eq!(base.os_family(), OsFamily::Windows);
        assert_eq!(base.shell(), Shell::Powershell);

        let raw = json!({"hostname": "h", "role": "r", "os": {"family": "beos"}});
        let err = HostBase::from_config("test", &raw, &MultihostLogger::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Value \"beos\" is not supported in os_family field of host configuration"
        );
    }
}
