//! Topology controllers.
//!
//! A controller belongs to a topology mark and prepares the environment for
//! the tests that run with it. Hooks run once when the topology is entered
//! ([`TopologyController::topology_setup`]), once when it is left
//! ([`TopologyController::topology_teardown`]) and around every test.
//!
//! Every hook receives [`HookArgs`]: the hosts selected by the topology,
//! named after the fixtures of the mark.

use async_trait::async_trait;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use crate::artifacts::{ArtifactsType, ControllerArtifacts};
use crate::error::{AggregateKind, Error, ErrorCollector, Result};
use crate::inventory::{MultihostConfig, MultihostHost};
use crate::logging::MultihostLogger;
use crate::topology::Topology;
use crate::utility::OperationStatus;

// ============================================================================
// Hook arguments
// ============================================================================

/// A value of [`HookArgs`].
#[derive(Debug, Clone)]
pub enum HookValue {
    /// A single host, for paths like `test.client[0]`
    Host(Arc<dyn MultihostHost>),
    /// All hosts of a role, for paths like `test.client`
    Hosts(Vec<Arc<dyn MultihostHost>>),
}

/// Hosts passed to controller hooks, by fixture name.
#[derive(Debug, Clone, Default)]
pub struct HookArgs {
    values: IndexMap<String, HookValue>,
}

impl HookArgs {
    /// Adds a named value.
    pub fn insert(&mut self, name: impl Into<String>, value: HookValue) {
        self.values.insert(name.into(), value);
    }

    /// Value of `name`.
    pub fn get(&self, name: &str) -> Result<&HookValue> {
        self.values.get(name).ok_or_else(|| Error::name_not_found(name))
    }

    /// Single host named `name`.
    pub fn host(&self, name: &str) -> Result<&Arc<dyn MultihostHost>> {
        match self.get(name)? {
            HookValue::Host(host) => Ok(host),
            HookValue::Hosts(_) => Err(Error::InvalidValue(format!("{name} is a list of hosts"))),
        }
    }

    /// Hosts named `name`; a single host is returned as a one element list.
    pub fn hosts(&self, name: &str) -> Result<Vec<Arc<dyn MultihostHost>>> {
        Ok(match self.get(name)? {
            HookValue::Host(host) => vec![Arc::clone(host)],
            HookValue::Hosts(hosts) => hosts.clone(),
        })
    }

    /// Single host named `name` as its concrete type.
    pub fn downcast<T: 'static>(&self, name: &str) -> Result<&T> {
        let host = self.host(name)?;
        host.as_any().downcast_ref::<T>().ok_or_else(|| {
            Error::InvalidValue(format!(
                "{name} ({}) is not a {}",
                host.hostname(),
                std::any::type_name::<T>()
            ))
        })
    }

    /// Argument names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================================
// Controller state
// ============================================================================

struct ControllerInit {
    name: String,
    topology: Topology,
    paths: IndexMap<String, HookValue>,
    args: HookArgs,
    hosts: Vec<Arc<dyn MultihostHost>>,
    logger: MultihostLogger,
}

/// Data every controller carries.
///
/// It is filled by [`ControllerState::init`] when the topology is selected;
/// accessors fail before that.
#[derive(Default)]
pub struct ControllerState {
    init: OnceCell<ControllerInit>,
    artifacts: ControllerArtifacts,
    op_state: OperationStatus,
}

impl ControllerState {
    /// Creates an uninitialized state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the controller to a topology and an inventory. Later calls are
    /// ignored.
    ///
    /// `mapping` maps fixture names to host paths like `test.client[0]`.
    pub fn init(
        &self,
        name: &str,
        config: &MultihostConfig,
        topology: &Topology,
        mapping: &IndexMap<String, String>,
    ) -> Result<()> {
        if self.init.get().is_some() {
            return Ok(());
        }

        let mut paths = IndexMap::new();
        for domain in config.domains() {
            let Ok(required) = topology.get(domain.id()) else {
                continue;
            };

            for role in domain.roles() {
                let Ok(count) = required.get(&role) else {
                    continue;
                };
                let hosts: Vec<_> = domain.hosts_by_role(&role).into_iter().take(count).collect();
                for (i, host) in hosts.iter().enumerate() {
                    paths.insert(format!("{}.{role}[{i}]", domain.id()), HookValue::Host(Arc::clone(host)));
                }
                paths.insert(format!("{}.{role}", domain.id()), HookValue::Hosts(hosts));
            }
        }

        let mut args = HookArgs::default();
        for (fixture, path) in mapping {
            let value = paths.get(path).cloned().ok_or_else(|| Error::name_not_found(path))?;
            args.insert(fixture.clone(), value);
        }

        let mut hosts = config.topology_hosts(topology);
        hosts.sort_by(|a, b| a.hostname().cmp(b.hostname()));

        // A concurrent init produced the same data.
        let _ = self.init.set(ControllerInit {
            name: name.to_string(),
            topology: topology.clone(),
            paths,
            args,
            hosts,
            logger: config.logger().child(format!("topology={name}")),
        });
        Ok(())
    }

    fn initialized(&self) -> Result<&ControllerInit> {
        self.init
            .get()
            .ok_or_else(|| Error::hook("Topology controller has not been initialized yet"))
    }

    /// True once [`ControllerState::init`] succeeded.
    pub fn is_initialized(&self) -> bool {
        self.init.get().is_some()
    }

    /// Topology name.
    pub fn name(&self) -> Result<&str> {
        Ok(&self.initialized()?.name)
    }

    /// Topology.
    pub fn topology(&self) -> Result<&Topology> {
        Ok(&self.initialized()?.topology)
    }

    /// Hosts used by the topology, sorted by hostname.
    pub fn hosts(&self) -> Result<&[Arc<dyn MultihostHost>]> {
        Ok(&self.initialized()?.hosts)
    }

    /// Hook arguments.
    pub fn args(&self) -> Result<&HookArgs> {
        Ok(&self.initialized()?.args)
    }

    /// Host or hosts at a path such as `test.client[0]`.
    pub fn lookup(&self, path: &str) -> Result<&HookValue> {
        self.initialized()?
            .paths
            .get(path)
            .ok_or_else(|| Error::name_not_found(path))
    }

    /// Controller logger.
    pub fn logger(&self) -> Result<&MultihostLogger> {
        Ok(&self.initialized()?.logger)
    }

    /// Artifacts added by the controller.
    pub fn artifacts(&self) -> &ControllerArtifacts {
        &self.artifacts
    }

    /// Operation states (`topology_setup`, `setup`).
    pub fn op_state(&self) -> &OperationStatus {
        &self.op_state
    }
}

// ============================================================================
// Controller trait
// ============================================================================

/// Prepares the environment of a topology.
#[async_trait]
pub trait TopologyController: Send + Sync {
    /// Controller state.
    fn state(&self) -> &ControllerState;

    /// Registers artifacts, called before [`TopologyController::topology_setup`].
    async fn set_artifacts(&self, args: &HookArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Returns a reason to skip tests of this topology, if any.
    async fn skip(&self, args: &HookArgs) -> Result<Option<String>> {
        let _ = args;
        Ok(None)
    }

    /// Called before the first test of the topology.
    async fn topology_setup(&self, args: &HookArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called after the last test of the topology.
    async fn topology_teardown(&self, args: &HookArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called before every test.
    async fn setup(&self, args: &HookArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called after every test.
    async fn teardown(&self, args: &HookArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Artifacts to collect from `host`.
    fn artifacts_list(&self, host: &dyn MultihostHost, kind: ArtifactsType) -> Result<BTreeSet<String>> {
        Ok(self.state().artifacts().get(kind, host.hostname()))
    }

    /// Returns this as Any for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Controller that does nothing; the default of every mark.
#[derive(Default)]
pub struct NoopController {
    state: ControllerState,
}

impl TopologyController for NoopController {
    fn state(&self) -> &ControllerState {
        &self.state
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Backup controller
// ============================================================================

/// User hook run by [`BackupTopologyController`] during topology setup.
pub type ControllerHook = Arc<dyn for<'a> Fn(&'a HookArgs) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Controller that restores hosts after every test.
///
/// After topology setup every host implementing
/// [`BackupHost`](crate::inventory::BackupHost) is backed up; the backup is
/// restored after each test. Leaving the topology restores the state taken
/// at session start.
#[derive(Default)]
pub struct BackupTopologyController {
    state: ControllerState,
    setup_hook: Option<ControllerHook>,
    backup_data: Mutex<Vec<(Arc<dyn MultihostHost>, Value)>>,
}

impl BackupTopologyController {
    /// Creates a controller without a setup hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `hook` before the topology backup is taken. A failing hook
    /// restores the session start state.
    pub fn with_topology_setup<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a HookArgs) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.setup_hook = Some(Arc::new(hook));
        self
    }

    /// Hostnames and backups taken after topology setup.
    pub fn backup_data(&self) -> Vec<(String, Value)> {
        self.backup_data
            .lock()
            .iter()
            .map(|(host, data)| (host.hostname().to_string(), data.clone()))
            .collect()
    }

    /// Restores `data` on every host; all failures are reported together.
    pub async fn restore(&self, data: &[(Arc<dyn MultihostHost>, Value)]) -> Result<()> {
        let mut errors = ErrorCollector::new();
        for (host, backup) in data {
            let Some(backup_host) = host.as_backup() else {
                continue;
            };
            errors.record(backup_host.restore(backup).await);
        }
        errors.finish(AggregateKind::Restore, "Some hosts failed to restore to original state")
    }

    /// Restores the session start state of every topology host.
    pub async fn restore_vanilla(&self) -> Result<()> {
        let data: Vec<_> = self
            .state
            .hosts()?
            .iter()
            .filter_map(|host| host.base().vanilla_backup().map(|b| (Arc::clone(host), b)))
            .collect();
        self.restore(&data).await
    }

    /// Runs `f`; on failure restores the session start state and returns the
    /// original error.
    pub async fn restore_vanilla_on_error<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        match f().await {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(restore_err) = self.restore_vanilla().await {
                    if let Ok(logger) = self.state.logger() {
                        logger.error(format!("Unable to restore original state: {restore_err}"));
                    }
                }
                Err(e)
            }
        }
    }

    /// Backs up every host of the topology that supports it.
    ///
    /// Each backup is stored as soon as it is taken. If one host fails, the
    /// session start state is restored and the backups already taken are
    /// removed.
    pub async fn backup_hosts(&self) -> Result<()> {
        let result = self
            .restore_vanilla_on_error(|| async {
                for host in self.state.hosts()? {
                    if let Some(backup_host) = host.as_backup() {
                        let backup = backup_host.backup().await?;
                        self.backup_data.lock().push((Arc::clone(host), backup));
                    }
                }
                Ok::<(), Error>(())
            })
            .await;

        if result.is_err() {
            self.remove_backups().await;
        }
        result
    }

    /// Removes stored backups; failures are logged.
    async fn remove_backups(&self) {
        let data = std::mem::take(&mut *self.backup_data.lock());
        for (host, backup) in data {
            if let Some(backup_host) = host.as_backup() {
                if let Err(e) = backup_host.remove_backup(&backup).await {
                    host.base().logger().warning(format!("Unable to remove backup: {e}"));
                }
            }
        }
    }
}

#[async_trait]
impl TopologyController for BackupTopologyController {
    fn state(&self) -> &ControllerState {
        &self.state
    }

    async fn topology_setup(&self, args: &HookArgs) -> Result<()> {
        if let Some(hook) = self.setup_hook.clone() {
            self.restore_vanilla_on_error(|| hook(args)).await?;
        }
        self.backup_hosts().await
    }

    async fn topology_teardown(&self, _args: &HookArgs) -> Result<()> {
        self.remove_backups().await;
        self.restore_vanilla().await
    }

    async fn teardown(&self, _args: &HookArgs) -> Result<()> {
        let data = self.backup_data.lock().clone();
        self.restore(&data).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{ConfigSettings, MultihostRegistry};
    use crate::topology::TopologyDomain;
    use futures::FutureExt;

    fn config() -> MultihostConfig {
        MultihostConfig::from_yaml_str(
            r#"
domains:
- id: test
  hosts:
  - {hostname: replica.ldap.test, role: ldap, conn: {type: local}}
  - {hostname: client.test, role: client, conn: {type: local}}
  - {hostname: master.ldap.test, role: ldap, conn: {type: local}}
"#,
            &MultihostRegistry::generic(),
            ConfigSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_state_init() {
        let config = config();
        let topology = Topology::new([TopologyDomain::new("test", [("client", 1), ("ldap", 2)])]).unwrap();
        let mut mapping = IndexMap::new();
        mapping.insert("client".to_string(), "test.client[0]".to_string());
        mapping.insert("ldap".to_string(), "test.ldap".to_string());

        let state = ControllerState::new();
        assert!(state.name().is_err());
        state.init("client-ldap", &config, &topology, &mapping).unwrap();
        assert!(state.is_initialized());
        assert_eq!(state.name().unwrap(), "client-ldap");

        let hosts: Vec<_> = state.hosts().unwrap().iter().map(|h| h.hostname()).collect();
        assert_eq!(hosts, vec!["client.test", "master.ldap.test", "replica.ldap.test"]);

        let args = state.args().unwrap();
        assert_eq!(args.host("client").unwrap().hostname(), "client.test");
        assert_eq!(args.hosts("ldap").unwrap().len(), 2);
        assert!(args.host("ldap").is_err());
        assert!(args.get("kdc").is_err());

        assert!(matches!(state.lookup("test.ldap[1]").unwrap(), HookValue::Host(_)));

        // Second init is ignored.
        state.init("other", &config, &topology, &IndexMap::new()).unwrap();
        assert_eq!(state.name().unwrap(), "client-ldap");
    }

    #[test]
    fn test_state_init_unknown_path() {
        let config = config();
        let topology = Topology::new([TopologyDomain::new("test", [("client", 1)])]).unwrap();
        let mut mapping = IndexMap::new();
        mapping.insert("ldap".to_string(), "test.ldap".to_string());

        let err = ControllerState::new()
            .init("client", &config, &topology, &mapping)
            .unwrap_err();
        assert_eq!(err.to_string(), "Name \"test.ldap\" does not exist");
    }

    #[test]
    fn test_controller_artifacts_list() {
        let config = config();
        let topology = Topology::new([TopologyDomain::new("test", [("client", 1)])]).unwrap();
        let controller = NoopController::default();
        controller
            .state()
            .init("client", &config, &topology, &IndexMap::new())
            .unwrap();

        let host = Arc::clone(&config.hosts()[1]);
        controller
            .state()
            .artifacts()
            .add(ArtifactsType::Test, host.hostname(), "/var/log/messages")
            .unwrap();

        let list = controller.artifacts_list(host.as_ref(), ArtifactsType::Test).unwrap();
        assert!(list.contains("/var/log/messages"));
    }

    #[tokio::test]
    async fn test_backup_controller_hook_error() {
        let config = config();
        let topology = Topology::new([TopologyDomain::new("test", [("client", 1)])]).unwrap();
        let controller = BackupTopologyController::new()
            .with_topology_setup(|_args| async { Err::<(), _>(Error::hook("setup failed")) }.boxed());
        controller
            .state()
            .init("client", &config, &topology, &IndexMap::new())
            .unwrap();

        let err = controller.topology_setup(&HookArgs::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "setup failed");
        assert!(controller.backup_data().is_empty());
    }
}
