//! Multihost inventory.
//!
//! This module loads the multihost configuration:
//! - Domains with their hosts, see [`MultihostDomain`]
//! - Host parsing and connection setup, see [`HostBase`]
//! - Mapping of domains and roles to Rust types, see [`MultihostRegistry`]
//!
//! A minimal configuration looks like this:
//!
//! ```yaml
//! domains:
//! - id: test
//!   hosts:
//!   - hostname: client.test
//!     role: client
//!     conn:
//!       type: podman
//!       container: client
//! ```

pub mod domain;
pub mod host;
pub mod registry;
pub mod validate;

pub use domain::MultihostDomain;
pub use host::{BackupHost, GenericHost, HostBase, MultihostHost, OsFamily};
pub use registry::{DomainLayout, HostFactory, MultihostRegistry, RoleFactory};

use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::artifacts::ArtifactsCollector;
use crate::error::{Error, ErrorCollector, Result};
use crate::logging::MultihostLogger;
use crate::topology::Topology;
use validate::{validate_required, ConfigValue};

/// Settings applied while loading the inventory.
#[derive(Debug, Clone)]
pub struct ConfigSettings {
    /// Postpone connecting to hosts until first use
    pub lazy_connect: bool,
    /// Where and when artifacts are collected
    pub artifacts: ArtifactsCollector,
    /// Root logger
    pub logger: MultihostLogger,
}

impl Default for ConfigSettings {
    fn default() -> Self {
        Self {
            lazy_connect: false,
            artifacts: ArtifactsCollector::new("artifacts", Default::default(), false),
            logger: MultihostLogger::new(),
        }
    }
}

/// The loaded inventory.
#[derive(Debug)]
pub struct MultihostConfig {
    domains: Vec<Arc<MultihostDomain>>,
    settings: ConfigSettings,
    raw: Value,
}

impl MultihostConfig {
    /// Keys the configuration must set.
    pub const REQUIRED_FIELDS: &'static [&'static str] = &["domains"];

    /// Builds the inventory from a parsed document.
    pub fn from_value(raw: Value, registry: &MultihostRegistry, settings: ConfigSettings) -> Result<Self> {
        validate_required(&raw, Self::REQUIRED_FIELDS, "multihost")?;

        let entries = raw
            .get("domains")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::InvalidValue("Domains must be a list".to_string()))?;

        let mut seen = HashSet::new();
        let mut domains = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = entry.opt_str("id")?.filter(|id| !id.is_empty()).ok_or_else(|| {
                Error::InvalidValue("Invalid configuration, domain is missing 'id'".to_string())
            })?;

            if !seen.insert(id.clone()) {
                return Err(Error::Config(format!("Domain id {id} is used more than once")));
            }

            let layout = registry.layout(&id)?.clone();
            domains.push(Arc::new(MultihostDomain::from_value(entry, layout, &settings.logger)?));
        }

        Ok(Self {
            domains,
            settings,
            raw,
        })
    }

    /// Builds the inventory from YAML text.
    pub fn from_yaml_str(text: &str, registry: &MultihostRegistry, settings: ConfigSettings) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(text)?;
        Self::from_value(raw, registry, settings)
    }

    /// Builds the inventory from a YAML file.
    pub fn from_yaml_file(
        path: impl AsRef<Path>,
        registry: &MultihostRegistry,
        settings: ConfigSettings,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let raw: Value = serde_yaml::from_str(&text).map_err(|e| Error::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Self::from_value(raw, registry, settings)
    }

    /// Domains in configuration order.
    pub fn domains(&self) -> &[Arc<MultihostDomain>] {
        &self.domains
    }

    /// Domain with the given id.
    pub fn domain(&self, id: &str) -> Result<&Arc<MultihostDomain>> {
        self.domains
            .iter()
            .find(|d| d.id() == id)
            .ok_or_else(|| Error::name_not_found(id))
    }

    /// Every host of every domain.
    pub fn hosts(&self) -> Vec<Arc<dyn MultihostHost>> {
        self.domains
            .iter()
            .flat_map(|d| d.hosts().iter().cloned())
            .collect()
    }

    /// Topology provided by this inventory.
    pub fn topology(&self) -> Topology {
        Topology::from_config(self)
    }

    /// Hosts a topology uses: for every domain and role of `topology`, the
    /// first hosts of that role up to the required count.
    pub fn topology_hosts(&self, topology: &Topology) -> Vec<Arc<dyn MultihostHost>> {
        let mut result = Vec::new();
        for domain in &self.domains {
            let Ok(required) = topology.get(domain.id()) else {
                continue;
            };

            for role in domain.roles() {
                let Ok(count) = required.get(&role) else {
                    continue;
                };
                result.extend(domain.hosts_by_role(&role).into_iter().take(count));
            }
        }
        result
    }

    /// Opens connections to `hosts`; every failure is reported.
    pub async fn connect(hosts: &[Arc<dyn MultihostHost>]) -> Result<()> {
        let mut errors = ErrorCollector::new();
        for host in hosts {
            host.base().logger().debug(format!("Connecting to {}", host.hostname()));
            errors.record(host.conn().connect().await);
        }
        errors.finish_flat()
    }

    /// Closes connections to every host.
    pub async fn disconnect(&self) {
        for host in self.hosts() {
            if !host.conn().connected() {
                continue;
            }
            if let Err(e) = host.conn().disconnect().await {
                host.base().logger().warning(format!("Unable to disconnect: {e}"));
            }
        }
    }

    /// Settings the inventory was loaded with.
    pub fn settings(&self) -> &ConfigSettings {
        &self.settings
    }

    /// Root logger.
    pub fn logger(&self) -> &MultihostLogger {
        &self.settings.logger
    }

    /// Artifacts collector.
    pub fn artifacts(&self) -> &ArtifactsCollector {
        &self.settings.artifacts
    }

    /// True if connections are opened on first use.
    pub fn lazy_connect(&self) -> bool {
        self.settings.lazy_connect
    }

    /// Configuration document as loaded.
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyDomain;

    const CONFIG: &str = r#"
domains:
- id: test
  hosts:
  - hostname: client.test
    role: client
    conn: {type: local}
  - hostname: master.ldap.test
    role: ldap
    conn: {type: local}
  - hostname: replica.ldap.test
    role: ldap
    conn: {type: local}
- id: ipa
  hosts:
  - hostname: master.ipa.test
    role: ipa
    conn: {type: local}
"#;

    fn config() -> MultihostConfig {
        MultihostConfig::from_yaml_str(CONFIG, &MultihostRegistry::generic(), ConfigSettings::default()).unwrap()
    }

    #[test]
    fn test_config_domains() {
        let config = config();
        let ids: Vec<_> = config.domains().iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["test", "ipa"]);
        assert_eq!(config.hosts().len(), 4);

        let topology = config.topology();
        assert_eq!(topology.get("test").unwrap().get("ldap").unwrap(), 2);
        assert_eq!(topology.get("ipa").unwrap().get("ipa").unwrap(), 1);
    }

    #[test]
    fn test_topology_hosts() {
        let config = config();
        let topology = Topology::new([TopologyDomain::new("test", [("client", 1), ("ldap", 1)])]).unwrap();
        let hosts: Vec<_> = config
            .topology_hosts(&topology)
            .iter()
            .map(|h| h.hostname().to_string())
            .collect();
        assert_eq!(hosts, vec!["client.test", "master.ldap.test"]);
    }

    #[test]
    fn test_config_errors() {
        let registry = MultihostRegistry::generic();

        let err = MultihostConfig::from_yaml_str("{}", &registry, ConfigSettings::default()).unwrap_err();
        assert_eq!(err.to_string(), "\"domains\" property is missing in multihost configuration");

        let err = MultihostConfig::from_yaml_str(
            "domains:\n- hosts: [{hostname: h, role: r}]\n",
            &registry,
            ConfigSettings::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid configuration, domain is missing 'id'");

        let doc = "domains:\n- {id: a, hosts: [{hostname: h, role: r, conn: {type: local}}]}\n- {id: a, hosts: [{hostname: g, role: r, conn: {type: local}}]}\n";
        let err = MultihostConfig::from_yaml_str(doc, &registry, ConfigSettings::default()).unwrap_err();
        assert!(err.to_string().contains("used more than once"));

        let err = MultihostConfig::from_yaml_str(
            "domains:\n- {id: a, hosts: [{hostname: h, role: r}]}\n",
            &MultihostRegistry::new(),
            ConfigSettings::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Unexpected domain id: a");
    }

    #[test]
    fn test_missing_file() {
        let err = MultihostConfig::from_yaml_file(
            "/nonexistent/mhc.yaml",
            &MultihostRegistry::generic(),
            ConfigSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigFile { .. }));
    }
}
