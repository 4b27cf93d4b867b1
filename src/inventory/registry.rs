//! Maps domain ids and role names to host and role types.
//!
//! The inventory is plain data; which Rust type stands behind a configured
//! host, and which role object a test receives for it, is decided here. A
//! project registers one [`DomainLayout`] per domain id it knows about.

use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

use super::host::{GenericHost, HostBase, MultihostHost};
use crate::error::{Error, Result};
use crate::role::{GenericRole, MultihostRole, RoleContext};

/// Creates a host object from its parsed base.
pub type HostFactory = Arc<dyn Fn(HostBase) -> Result<Arc<dyn MultihostHost>> + Send + Sync>;

/// Creates a role object for one test.
pub type RoleFactory = Arc<dyn Fn(RoleContext) -> Result<Arc<dyn MultihostRole>> + Send + Sync>;

/// Host and role types of one domain.
#[derive(Clone, Default)]
pub struct DomainLayout {
    hosts: IndexMap<String, HostFactory>,
    default_host: Option<HostFactory>,
    roles: IndexMap<String, RoleFactory>,
    default_role: Option<RoleFactory>,
}

impl DomainLayout {
    /// Creates an empty layout. Hosts default to [`GenericHost`] and every
    /// role must be registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Layout accepting any role, backed by [`GenericRole`].
    pub fn generic() -> Self {
        Self::new().default_role(|ctx| Ok(GenericRole::new(ctx)))
    }

    /// Registers the host type used for `role`.
    pub fn host<H, F>(mut self, role: impl Into<String>, factory: F) -> Self
    where
        H: MultihostHost + 'static,
        F: Fn(HostBase) -> Result<H> + Send + Sync + 'static,
    {
        self.hosts.insert(role.into(), Self::wrap_host(factory));
        self
    }

    /// Registers the host type used for roles without their own entry.
    pub fn default_host<H, F>(mut self, factory: F) -> Self
    where
        H: MultihostHost + 'static,
        F: Fn(HostBase) -> Result<H> + Send + Sync + 'static,
    {
        self.default_host = Some(Self::wrap_host(factory));
        self
    }

    /// Registers the role type used for `role`.
    pub fn role<R, F>(mut self, role: impl Into<String>, factory: F) -> Self
    where
        R: MultihostRole + 'static,
        F: Fn(RoleContext) -> Result<R> + Send + Sync + 'static,
    {
        self.roles.insert(role.into(), Self::wrap_role(factory));
        self
    }

    /// Registers the role type used for roles without their own entry.
    pub fn default_role<R, F>(mut self, factory: F) -> Self
    where
        R: MultihostRole + 'static,
        F: Fn(RoleContext) -> Result<R> + Send + Sync + 'static,
    {
        self.default_role = Some(Self::wrap_role(factory));
        self
    }

    fn wrap_host<H, F>(factory: F) -> HostFactory
    where
        H: MultihostHost + 'static,
        F: Fn(HostBase) -> Result<H> + Send + Sync + 'static,
    {
        Arc::new(move |base| Ok(Arc::new(factory(base)?) as Arc<dyn MultihostHost>))
    }

    fn wrap_role<R, F>(factory: F) -> RoleFactory
    where
        R: MultihostRole + 'static,
        F: Fn(RoleContext) -> Result<R> + Send + Sync + 'static,
    {
        Arc::new(move |ctx| Ok(Arc::new(factory(ctx)?) as Arc<dyn MultihostRole>))
    }

    /// Builds the host object for a parsed host.
    pub fn create_host(&self, base: HostBase) -> Result<Arc<dyn MultihostHost>> {
        match self.hosts.get(base.role()).or(self.default_host.as_ref()) {
            Some(factory) => factory(base),
            None => Ok(Arc::new(GenericHost::new(base))),
        }
    }

    /// Builds the role object handed to a test.
    pub fn create_role(&self, ctx: RoleContext) -> Result<Arc<dyn MultihostRole>> {
        let role = ctx.host.role().to_string();
        match self.roles.get(&role).or(self.default_role.as_ref()) {
            Some(factory) => factory(ctx),
            None => Err(Error::InvalidValue(format!("Unexpected role: {role}"))),
        }
    }

    /// True if `role` has a role type registered.
    pub fn knows_role(&self, role: &str) -> bool {
        self.default_role.is_some() || self.roles.contains_key(role)
    }
}

impl fmt::Debug for DomainLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainLayout")
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .field("roles", &self.roles.keys().collect::<Vec<_>>())
            .field("default_host", &self.default_host.is_some())
            .field("default_role", &self.default_role.is_some())
            .finish()
    }
}

/// Domain layouts by domain id.
#[derive(Debug, Clone, Default)]
pub struct MultihostRegistry {
    domains: IndexMap<String, DomainLayout>,
    default: Option<DomainLayout>,
}

impl MultihostRegistry {
    /// Creates an empty registry; every domain id must be registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry accepting any domain and role with generic types.
    pub fn generic() -> Self {
        Self::new().default_domain(DomainLayout::generic())
    }

    /// Registers the layout of domain `id`.
    pub fn domain(mut self, id: impl Into<String>, layout: DomainLayout) -> Self {
        self.domains.insert(id.into(), layout);
        self
    }

    /// Registers the layout used for unknown domain ids.
    pub fn default_domain(mut self, layout: DomainLayout) -> Self {
        self.default = Some(layout);
        self
    }

    /// Layout for domain `id`.
    pub fn layout(&self, id: &str) -> Result<&DomainLayout> {
        self.domains
            .get(id)
            .or(self.default.as_ref())
            .ok_or_else(|| Error::InvalidValue(format!("Unexpected domain id: {id}")))
    }
}
