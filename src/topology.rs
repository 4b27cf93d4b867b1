//! Topology data model and satisfaction.
//!
//! A [`Topology`] describes how many hosts of each role every domain needs.
//! The inventory topology is derived from the configuration and a test
//! topology is declared by a [`crate::marks::TopologyMark`]; a test can run
//! when the inventory topology satisfies the test topology.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Role requirements inside one domain.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct TopologyDomain {
    /// Domain id, matching an inventory domain id.
    pub id: String,
    /// Role name to required host count, in declaration order.
    #[serde(rename = "hosts")]
    pub roles: IndexMap<String, usize>,
}

impl TopologyDomain {
    /// Creates a domain from `(role, count)` pairs.
    pub fn new<I, S>(id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            roles: roles.into_iter().map(|(r, c)| (r.into(), c)).collect(),
        }
    }

    /// Number of hosts required for `role`.
    pub fn get(&self, role: &str) -> Result<usize> {
        self.roles
            .get(role)
            .copied()
            .ok_or_else(|| Error::Lookup(format!("Role \"{role}\" does not exist in domain {}", self.id)))
    }

    /// Returns true if `role` is part of this domain.
    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    /// Returns true if this domain can serve everything `other` asks for.
    ///
    /// Roles present only in `self` are ignored.
    pub fn satisfies(&self, other: &TopologyDomain) -> bool {
        if self.id != other.id {
            return false;
        }

        other
            .roles
            .iter()
            .all(|(role, count)| self.roles.get(role).is_some_and(|have| have >= count))
    }

    /// Exports the domain as `{"id": ..., "hosts": {...}}`.
    pub fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "hosts": self.roles,
        })
    }

    /// Rebuilds a domain from [`TopologyDomain::export`] output.
    pub fn from_export(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

impl PartialEq for TopologyDomain {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.roles.len() == other.roles.len()
            && self
                .roles
                .iter()
                .all(|(role, count)| other.roles.get(role) == Some(count))
    }
}

impl fmt::Display for TopologyDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.id)?;
        for (i, (role, count)) in self.roles.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{role}={count}")?;
        }
        write!(f, ")")
    }
}

/// An ordered set of [`TopologyDomain`]s, at most one per id.
#[derive(Debug, Clone, Default, Eq)]
pub struct Topology {
    domains: IndexMap<String, TopologyDomain>,
}

impl Topology {
    /// Creates a topology; fails on duplicate domain ids.
    pub fn new(domains: impl IntoIterator<Item = TopologyDomain>) -> Result<Self> {
        let mut map = IndexMap::new();
        for domain in domains {
            if map.contains_key(&domain.id) {
                return Err(Error::Topology(format!(
                    "Duplicate domain in topology: {}",
                    domain.id
                )));
            }
            map.insert(domain.id.clone(), domain);
        }

        Ok(Self { domains: map })
    }

    /// Returns the domain with the given id.
    pub fn get(&self, id: &str) -> Result<&TopologyDomain> {
        self.domains
            .get(id)
            .ok_or_else(|| Error::Lookup(format!("Domain \"{id}\" does not exist in topology")))
    }

    /// Returns true if a domain with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.domains.contains_key(id)
    }

    /// Iterates over domains in declaration order.
    pub fn domains(&self) -> impl Iterator<Item = &TopologyDomain> {
        self.domains.values()
    }

    /// Number of domains.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// True if there are no domains.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Returns true if every domain of `other` is satisfied by the same-id
    /// domain of `self`.
    pub fn satisfies(&self, other: &Topology) -> bool {
        other.domains.values().all(|required| {
            self.domains
                .get(&required.id)
                .is_some_and(|have| have.satisfies(required))
        })
    }

    /// Exports the topology as a list of domain exports.
    pub fn export(&self) -> serde_json::Value {
        serde_json::Value::Array(self.domains.values().map(TopologyDomain::export).collect())
    }

    /// Rebuilds a topology from [`Topology::export`] output.
    pub fn from_export(value: &serde_json::Value) -> Result<Self> {
        let domains: Vec<TopologyDomain> = serde_json::from_value(value.clone())?;
        Self::new(domains)
    }

    /// Derives the topology provided by an inventory: every domain with the
    /// number of hosts configured for each role.
    pub fn from_config(config: &crate::inventory::MultihostConfig) -> Self {
        let domains = config.domains().iter().map(|domain| {
            let roles = domain
                .roles()
                .into_iter()
                .map(|role| {
                    let count = domain.hosts_by_role(&role).len();
                    (role, count)
                })
                .collect::<Vec<_>>();
            TopologyDomain::new(domain.id(), roles)
        });

        // Inventory domain ids are unique, see MultihostConfig::from_value.
        Self {
            domains: domains.map(|d| (d.id.clone(), d)).collect(),
        }
    }
}

impl PartialEq for Topology {
    fn eq(&self, other: &Self) -> bool {
        self.domains.len() == other.domains.len()
            && self
                .domains
                .iter()
                .all(|(id, domain)| other.domains.get(id) == Some(domain))
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, domain) in self.domains.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{domain}")?;
        }
        Ok(())
    }
}

impl Serialize for Topology {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.domains.values())
    }
}

impl<'de> Deserialize<'de> for Topology {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let domains = Vec::<TopologyDomain>::deserialize(deserializer)?;
        Topology::new(domains).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_topology(client: usize, ldap: usize) -> Topology {
        Topology::new([TopologyDomain::new(
            "test",
            [("client", client), ("ldap", ldap)],
        )])
        .unwrap()
    }

    #[test]
    fn test_domain_satisfies_counts() {
        let have = TopologyDomain::new("test", [("client", 1), ("ldap", 2)]);
        let want = TopologyDomain::new("test", [("ldap", 1)]);
        assert!(have.satisfies(&want));
        assert!(!want.satisfies(&have));
    }

    #[test]
    fn test_domain_satisfies_requires_same_id() {
        let a = TopologyDomain::new("a", [("client", 1)]);
        let b = TopologyDomain::new("b", [("client", 1)]);
        assert!(!a.satisfies(&b));
    }

    #[test]
    fn test_topology_subset_semantics() {
        let inventory = Topology::new([
            TopologyDomain::new("test", [("client", 1), ("ldap", 1), ("ipa", 1)]),
            TopologyDomain::new("trusted", [("ad", 1)]),
        ])
        .unwrap();

        let wants_ldap = test_topology(1, 1);
        assert!(inventory.satisfies(&wants_ldap));
        assert!(!wants_ldap.satisfies(&inventory));
        assert!(!test_topology(2, 1).satisfies(&test_topology(1, 2)));
    }

    #[test]
    fn test_topology_missing_domain() {
        let inventory = test_topology(1, 1);
        let wants = Topology::new([TopologyDomain::new("other", [("client", 1)])]).unwrap();
        assert!(!inventory.satisfies(&wants));
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let result = Topology::new([
            TopologyDomain::new("test", [("client", 1)]),
            TopologyDomain::new("test", [("ldap", 1)]),
        ]);
        assert!(matches!(result, Err(Error::Topology(_))));
    }

    #[test]
    fn test_equality_ignores_order() {
        let a = Topology::new([
            TopologyDomain::new("a", [("x", 1), ("y", 2)]),
            TopologyDomain::new("b", [("z", 1)]),
        ])
        .unwrap();
        let b = Topology::new([
            TopologyDomain::new("b", [("z", 1)]),
            TopologyDomain::new("a", [("y", 2), ("x", 1)]),
        ])
        .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, test_topology(1, 1));
    }

    #[test]
    fn test_export_shape() {
        let exported = test_topology(1, 2).export();
        assert_eq!(
            exported,
            serde_json::json!([{"id": "test", "hosts": {"client": 1, "ldap": 2}}])
        );
        assert_eq!(Topology::from_export(&exported).unwrap(), test_topology(1, 2));
    }

    #[test]
    fn test_get_unknown_domain() {
        let topology = test_topology(1, 1);
        assert!(topology.get("test").is_ok());
        assert!(topology.contains("test"));
        assert!(matches!(topology.get("nope"), Err(Error::Lookup(_))));
        assert_eq!(topology.get("test").unwrap().get("ldap").unwrap(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(test_topology(1, 2).to_string(), "test(client=1, ldap=2)");
    }
}
