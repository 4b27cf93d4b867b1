//! Topology marks.
//!
//! A [`TopologyMark`] names a [`Topology`], the controller that prepares it and
//! the fixture names a test uses to reach hosts. Marks are collected into
//! [`KnownTopologies`] and [`KnownTopologyGroup`]s and attached to tests
//! through [`TopologyRequirement`].

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

use crate::controller::{NoopController, TopologyController};
use crate::error::{Error, Result};
use crate::topology::Topology;

static HOST_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<domain>[A-Za-z0-9_-]+)\.(?P<role>[A-Za-z0-9_-]+)(\[(?P<index>\d+)\])?$")
        .expect("host path pattern is valid")
});

/// A parsed fixture path: `dom.role` or `dom.role[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPath {
    /// Domain id
    pub domain: String,
    /// Role name
    pub role: String,
    /// Index into the role's host list, `None` for the whole list
    pub index: Option<usize>,
}

impl HostPath {
    /// Parses a fixture path.
    pub fn parse(path: &str) -> Result<Self> {
        let caps = HOST_PATH
            .captures(path)
            .ok_or_else(|| Error::Lookup(format!("Invalid host path \"{path}\"")))?;

        let index = caps
            .name("index")
            .map(|m| m.as_str().parse::<usize>())
            .transpose()
            .map_err(|e| Error::Lookup(format!("Invalid host path \"{path}\": {e}")))?;

        Ok(Self {
            domain: caps["domain"].to_string(),
            role: caps["role"].to_string(),
            index,
        })
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}.{}[{}]", self.domain, self.role, i),
            None => write!(f, "{}.{}", self.domain, self.role),
        }
    }
}

/// A named topology attached to tests.
#[derive(Clone)]
pub struct TopologyMark {
    name: String,
    topology: Topology,
    controller: Arc<dyn TopologyController>,
    fixtures: IndexMap<String, String>,
}

impl TopologyMark {
    /// Creates a mark with a no-op controller and no fixtures.
    pub fn new(name: impl Into<String>, topology: Topology) -> Self {
        Self {
            name: name.into(),
            topology,
            controller: Arc::new(NoopController::default()),
            fixtures: IndexMap::new(),
        }
    }

    /// Sets the topology controller.
    pub fn with_controller(mut self, controller: Arc<dyn TopologyController>) -> Self {
        self.controller = controller;
        self
    }

    /// Adds a fixture name pointing at a host path.
    pub fn with_fixture(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.fixtures.insert(name.into(), path.into());
        self
    }

    /// Mark name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Required topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Topology controller.
    pub fn controller(&self) -> &Arc<dyn TopologyController> {
        &self.controller
    }

    /// Fixture name to host path.
    pub fn fixtures(&self) -> &IndexMap<String, String> {
        &self.fixtures
    }

    /// Fixture names a test or hook may ask for.
    pub fn args(&self) -> Vec<&str> {
        self.fixtures.keys().map(String::as_str).collect()
    }

    /// Host path to every fixture name pointing at it.
    pub fn mapping(&self) -> IndexMap<String, Vec<String>> {
        let mut mapping: IndexMap<String, Vec<String>> = IndexMap::new();
        for (name, path) in &self.fixtures {
            mapping.entry(path.clone()).or_default().push(name.clone());
        }
        mapping
    }

    /// Checks that every fixture path is well formed and points inside the
    /// topology.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_mark("", "name must not be empty"));
        }

        for (fixture, path) in &self.fixtures {
            let parsed = HostPath::parse(path)
                .map_err(|e| Error::invalid_mark(&self.name, format!("fixture {fixture}: {e}")))?;

            let domain = self.topology.get(&parsed.domain).map_err(|_| {
                Error::invalid_mark(
                    &self.name,
                    format!("fixture {fixture}: domain \"{}\" is not in the topology", parsed.domain),
                )
            })?;

            let count = domain.get(&parsed.role).map_err(|_| {
                Error::invalid_mark(
                    &self.name,
                    format!("fixture {fixture}: role \"{}\" is not in domain {}", parsed.role, parsed.domain),
                )
            })?;

            if let Some(index) = parsed.index {
                if index >= count {
                    return Err(Error::invalid_mark(
                        &self.name,
                        format!("fixture {fixture}: index {index} is out of range, {path} has {count} host(s)"),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Exports the mark as `{"name", "fixtures", "topology"}`.
    pub fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "fixtures": self.fixtures,
            "topology": self.topology.export(),
        })
    }
}

impl fmt::Debug for TopologyMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyMark")
            .field("name", &self.name)
            .field("topology", &self.topology)
            .field("fixtures", &self.fixtures)
            .finish_non_exhaustive()
    }
}

impl PartialEq for TopologyMark {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.topology == other.topology && self.fixtures == other.fixtures
    }
}

/// A named list of marks; attaching a group runs the test once per mark.
#[derive(Debug, Clone)]
pub struct KnownTopologyGroup {
    name: String,
    marks: Vec<TopologyMark>,
}

impl KnownTopologyGroup {
    /// Creates a group.
    pub fn new(name: impl Into<String>, marks: Vec<TopologyMark>) -> Self {
        Self {
            name: name.into(),
            marks,
        }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Marks in the group.
    pub fn marks(&self) -> &[TopologyMark] {
        &self.marks
    }
}

/// Registry of marks addressable by name.
#[derive(Debug, Clone, Default)]
pub struct KnownTopologies {
    marks: IndexMap<String, TopologyMark>,
}

impl KnownTopologies {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a mark. Re-registering a name fails.
    pub fn register(&mut self, mark: TopologyMark) -> Result<()> {
        mark.validate()?;
        if self.marks.contains_key(mark.name()) {
            return Err(Error::invalid_mark(mark.name(), "mark is already registered"));
        }
        self.marks.insert(mark.name().to_string(), mark);
        Ok(())
    }

    /// Builder form of [`KnownTopologies::register`].
    pub fn with(mut self, mark: TopologyMark) -> Result<Self> {
        self.register(mark)?;
        Ok(self)
    }

    /// Returns a registered mark.
    pub fn get(&self, name: &str) -> Result<&TopologyMark> {
        self.marks.get(name).ok_or_else(|| Error::name_not_found(name))
    }

    /// Builds a group out of registered marks.
    pub fn group(&self, name: impl Into<String>, members: &[&str]) -> Result<KnownTopologyGroup> {
        let marks = members
            .iter()
            .map(|m| self.get(m).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(KnownTopologyGroup::new(name, marks))
    }

    /// Iterates over registered marks.
    pub fn iter(&self) -> impl Iterator<Item = &TopologyMark> {
        self.marks.values()
    }
}

/// What a test declares it needs.
#[derive(Debug, Clone)]
pub enum TopologyRequirement {
    /// A single topology.
    Mark(TopologyMark),
    /// Several topologies, each producing its own test instance.
    List(Vec<TopologyMark>),
    /// A known group, each member producing its own test instance.
    Group(KnownTopologyGroup),
}

impl TopologyRequirement {
    /// Marks this requirement expands to.
    pub fn marks(&self) -> Vec<&TopologyMark> {
        match self {
            TopologyRequirement::Mark(m) => vec![m],
            TopologyRequirement::List(marks) => marks.iter().collect(),
            TopologyRequirement::Group(group) => group.marks().iter().collect(),
        }
    }

    /// Validates every mark.
    pub fn validate(&self) -> Result<()> {
        self.marks().into_iter().try_for_each(TopologyMark::validate)
    }
}

impl From<TopologyMark> for TopologyRequirement {
    fn from(mark: TopologyMark) -> Self {
        TopologyRequirement::Mark(mark)
    }
}

impl From<KnownTopologyGroup> for TopologyRequirement {
    fn from(group: KnownTopologyGroup) -> Self {
        TopologyRequirement::Group(group)
    }
}

impl From<Vec<TopologyMark>> for TopologyRequirement {
    fn from(marks: Vec<TopologyMark>) -> Self {
        TopologyRequirement::List(marks)
    }
}
