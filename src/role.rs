//! Roles: the per-test view of a host.
//!
//! A role object is created for every host a test uses and lives for the
//! duration of that test only. It owns the utilities the test works with,
//! which are set up before the test body and torn down afterwards.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::artifacts::ArtifactsType;
use crate::error::{Error, Result};
use crate::inventory::MultihostHost;
use crate::logging::MultihostLogger;
use crate::utility::Utility;

/// What a role factory receives.
#[derive(Clone)]
pub struct RoleContext {
    /// Host the role wraps
    pub host: Arc<dyn MultihostHost>,
    /// Name of the running test
    pub test_name: String,
    /// Name of the topology the test runs with
    pub topology_name: String,
    /// Logger, the host logger
    pub logger: MultihostLogger,
}

impl RoleContext {
    /// Creates a context for `host`.
    pub fn new(host: Arc<dyn MultihostHost>, test_name: impl Into<String>, topology_name: impl Into<String>) -> Self {
        let logger = host.base().logger().clone();
        Self {
            host,
            test_name: test_name.into(),
            topology_name: topology_name.into(),
            logger,
        }
    }

    /// The host as its concrete type.
    pub fn host_as<T: 'static>(&self) -> Result<&T> {
        self.host.as_any().downcast_ref::<T>().ok_or_else(|| {
            Error::InvalidValue(format!(
                "Host {} is not a {}",
                self.host.hostname(),
                std::any::type_name::<T>()
            ))
        })
    }
}

impl fmt::Debug for RoleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleContext")
            .field("host", &self.host.hostname())
            .field("test_name", &self.test_name)
            .field("topology_name", &self.topology_name)
            .finish()
    }
}

/// Data shared by every role.
pub struct RoleBase {
    host: Arc<dyn MultihostHost>,
    role: String,
    test_name: String,
    topology_name: String,
    logger: MultihostLogger,
    artifacts: Mutex<BTreeSet<String>>,
}

impl RoleBase {
    /// Creates the base from a factory context.
    pub fn new(ctx: &RoleContext) -> Self {
        Self {
            role: ctx.host.role().to_string(),
            host: Arc::clone(&ctx.host),
            test_name: ctx.test_name.clone(),
            topology_name: ctx.topology_name.clone(),
            logger: ctx.logger.clone(),
            artifacts: Mutex::new(BTreeSet::new()),
        }
    }

    /// Wrapped host.
    pub fn host(&self) -> &Arc<dyn MultihostHost> {
        &self.host
    }

    /// Role name.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Name of the running test.
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Name of the active topology.
    pub fn topology_name(&self) -> &str {
        &self.topology_name
    }

    /// Logger.
    pub fn logger(&self) -> &MultihostLogger {
        &self.logger
    }

    /// Adds an artifact collected after the test.
    pub fn add_artifact(&self, path: impl Into<String>) {
        self.artifacts.lock().insert(path.into());
    }

    /// Artifacts added with [`RoleBase::add_artifact`].
    pub fn artifacts(&self) -> BTreeSet<String> {
        self.artifacts.lock().clone()
    }
}

impl fmt::Debug for RoleBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleBase")
            .field("role", &self.role)
            .field("host", &self.host.hostname())
            .finish_non_exhaustive()
    }
}

/// A role object handed to tests.
#[async_trait]
pub trait MultihostRole: Send + Sync + fmt::Debug {
    /// Common role data.
    fn base(&self) -> &RoleBase;

    /// Utilities owned by this role, dependencies included automatically.
    fn utilities(&self) -> Vec<Arc<dyn Utility>> {
        Vec::new()
    }

    /// Called before the test, after the utilities are set up.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Called after the test, before the utilities are torn down.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    /// Artifacts to collect after the test.
    fn artifacts_list(&self, host: &dyn MultihostHost, kind: ArtifactsType) -> Result<BTreeSet<String>> {
        let _ = host;
        Ok(match kind {
            ArtifactsType::Test => self.base().artifacts(),
            _ => BTreeSet::new(),
        })
    }

    /// Returns this as Any for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Wrapped host.
    fn host(&self) -> &Arc<dyn MultihostHost> {
        self.base().host()
    }

    /// Role name.
    fn role(&self) -> &str {
        self.base().role()
    }
}

/// Role with no behaviour of its own.
#[derive(Debug)]
pub struct GenericRole {
    base: RoleBase,
}

impl GenericRole {
    /// Creates the role.
    pub fn new(ctx: RoleContext) -> Self {
        Self {
            base: RoleBase::new(&ctx),
        }
    }
}

impl MultihostRole for GenericRole {
    fn base(&self) -> &RoleBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
