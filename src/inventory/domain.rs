//! A domain: a named group of hosts.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::host::{HostBase, MultihostHost};
use super::registry::DomainLayout;
use super::validate::{require_str, validate_required};
use crate::error::{Error, Result};
use crate::logging::MultihostLogger;
use crate::role::{MultihostRole, RoleContext};

/// Hosts of one domain, in configuration order.
pub struct MultihostDomain {
    id: String,
    hosts: Vec<Arc<dyn MultihostHost>>,
    layout: DomainLayout,
    raw: Value,
}

impl MultihostDomain {
    /// Keys every domain must set.
    pub const REQUIRED_FIELDS: &'static [&'static str] = &["id", "hosts"];

    /// Parses a domain entry and creates its hosts through `layout`.
    pub fn from_value(raw: &Value, layout: DomainLayout, logger: &MultihostLogger) -> Result<Self> {
        validate_required(raw, Self::REQUIRED_FIELDS, "domain")?;
        let id = require_str(raw, "id", "domain")?;

        let entries = raw
            .get("hosts")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::InvalidValue(format!("Hosts of domain {id} must be a list")))?;

        let hosts = entries
            .iter()
            .map(|entry| {
                validate_required(entry, &["role"], "host")?;
                layout.create_host(HostBase::from_config(&id, entry, logger)?)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            hosts,
            layout,
            raw: raw.clone(),
        })
    }

    /// Domain id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All hosts.
    pub fn hosts(&self) -> &[Arc<dyn MultihostHost>] {
        &self.hosts
    }

    /// Role names in order of first appearance.
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = Vec::new();
        for host in &self.hosts {
            if !roles.iter().any(|r| r == host.role()) {
                roles.push(host.role().to_string());
            }
        }
        roles
    }

    /// Hosts with the given role, in configuration order.
    pub fn hosts_by_role(&self, role: &str) -> Vec<Arc<dyn MultihostHost>> {
        self.hosts
            .iter()
            .filter(|h| h.role() == role)
            .cloned()
            .collect()
    }

    /// Host with the given hostname.
    pub fn host(&self, hostname: &str) -> Result<&Arc<dyn MultihostHost>> {
        self.hosts
            .iter()
            .find(|h| h.hostname() == hostname)
            .ok_or_else(|| Error::name_not_found(hostname))
    }

    /// Creates the role object of `ctx.host` for one test.
    pub fn create_role(&self, ctx: RoleContext) -> Result<Arc<dyn MultihostRole>> {
        self.layout.create_role(ctx)
    }

    /// Domain entry as configured.
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

impl fmt::Debug for MultihostDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultihostDomain")
            .field("id", &self.id)
            .field("hosts", &self.hosts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn domain(raw: Value) -> Result<MultihostDomain> {
        MultihostDomain::from_value(&raw, DomainLayout::generic(), &MultihostLogger::new())
    }

    #[test]
    fn test_domain_roles_in_order() {
        let d = domain(json!({
            "id": "test",
            "hosts": [
                {"hostname": "master.ldap.test", "role": "ldap", "conn": {"type": "local"}},
                {"hostname": "client.test", "role": "client", "conn": {"type": "local"}},
                {"hostname": "replica.ldap.test", "role": "ldap", "conn": {"type": "local"}},
            ],
        }))
        .unwrap();

        assert_eq!(d.id(), "test");
        assert_eq!(d.roles(), vec!["ldap", "client"]);
        let ldap: Vec<_> = d.hosts_by_role("ldap").iter().map(|h| h.hostname().to_string()).collect();
        assert_eq!(ldap, vec!["master.ldap.test", "replica.ldap.test"]);
        assert!(d.hosts_by_role("kdc").is_empty());
        assert_eq!(d.host("client.test").unwrap().role(), "client");
        assert!(d.host("unknown").is_err());
    }

    #[test]
    fn test_domain_missing_fields() {
        let err = domain(json!({"hosts": [{"hostname": "h", "role": "r"}]})).unwrap_err();
        assert_eq!(err.to_string(), "\"id\" property is missing in domain configuration");

        let err = domain(json!({"id": "test", "hosts": [{"hostname": "h"}]})).unwrap_err();
        assert_eq!(err.to_string(), "\"role\" property is missing in host configuration");
    }

    #[test]
    fn test_domain_unknown_role() {
        let d = MultihostDomain::from_value(
            &json!({"id": "test", "hosts": [{"hostname": "h", "role": "r", "conn": {"type": "local"}}]}),
            DomainLayout::new(),
            &MultihostLogger::new(),
        )
        .unwrap();

        let ctx = RoleContext::new(d.hosts()[0].clone(), "test_case", "client");
        let err = d.create_role(ctx).unwrap_err();
        assert_eq!(err.to_string(), "Unexpected role: r");
    }
}
