//! Test runner.
//!
//! This module drives multihost tests:
//! - [`TestCase`]: a named async test body with its topology requirements
//! - [`collection`]: expansion into one item per topology, selection and
//!   ordering
//! - [`Session`]: session, topology and test lifecycles
//! - [`SessionReport`]: outcomes
//!
//! ```rust,ignore
//! let case = TestCase::new("test_login", |ctx| async move {
//!     let client = ctx.mh()?.role::<Client>("client")?;
//!     client.login("user").await
//! })
//! .topology(known.get("client")?.clone());
//!
//! let mut session = Session::new(config, options);
//! session.register(case)?;
//! let report = session.run().await;
//! ```

pub mod collection;
pub mod report;
pub mod session;

pub use collection::{can_run, expand, order, select, Selection, TestItem};
pub use report::{SessionReport, TestReport};
pub use session::Session;

pub use crate::fixture::Outcome;

use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fixture::{MultihostFixture, Require};
use crate::marks::TopologyRequirement;

/// Test parameters, shared by every topology clone of a test.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSpec {
    params: IndexMap<String, Value>,
}

impl CallSpec {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(name.into(), value.into());
    }

    /// Value of parameter `name`.
    pub fn get(&self, name: &str) -> Result<&Value> {
        self.params.get(name).ok_or_else(|| Error::name_not_found(name))
    }

    /// All parameters.
    pub fn params(&self) -> &IndexMap<String, Value> {
        &self.params
    }
}

/// What a test body receives.
#[derive(Clone)]
pub struct TestContext {
    name: String,
    mh: Option<Arc<MultihostFixture>>,
    params: CallSpec,
}

impl TestContext {
    /// Test name, including the topology suffix of expanded tests.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The multihost fixture; fails for tests without a topology.
    pub fn mh(&self) -> Result<&MultihostFixture> {
        self.mh
            .as_deref()
            .ok_or_else(|| Error::hook(format!("Test {} does not use a multihost topology", self.name)))
    }

    /// Test parameters.
    pub fn params(&self) -> &CallSpec {
        &self.params
    }
}

/// Async test body.
pub type TestBody = Arc<dyn Fn(TestContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A registered test.
#[derive(Clone)]
pub struct TestCase {
    name: String,
    body: TestBody,
    requirement: Option<TopologyRequirement>,
    requires: Vec<Require>,
    params: CallSpec,
    preferred_topology: Option<String>,
    uses_multihost: bool,
}

impl TestCase {
    /// Creates a test. Tests use the multihost fixture unless
    /// [`TestCase::without_multihost`] is called.
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(move |ctx| body(ctx).boxed()),
            requirement: None,
            requires: Vec::new(),
            params: CallSpec::new(),
            preferred_topology: None,
            uses_multihost: true,
        }
    }

    /// Sets the topology requirement.
    pub fn topology(mut self, requirement: impl Into<TopologyRequirement>) -> Self {
        self.requirement = Some(requirement.into());
        self
    }

    /// Adds a run condition.
    pub fn require(mut self, require: Require) -> Self {
        self.requires.push(require);
        self
    }

    /// Adds a parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name, value);
        self
    }

    /// Runs only the clone with this topology name, unless overridden by
    /// options.
    pub fn preferred_topology(mut self, name: impl Into<String>) -> Self {
        self.preferred_topology = Some(name.into());
        self
    }

    /// Marks the test as not needing the multihost fixture.
    pub fn without_multihost(mut self) -> Self {
        self.uses_multihost = false;
        self
    }

    /// Test name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topology requirement, if any.
    pub fn requirement(&self) -> Option<&TopologyRequirement> {
        self.requirement.as_ref()
    }

    /// Run conditions.
    pub fn requires(&self) -> &[Require] {
        &self.requires
    }

    /// Parameters.
    pub fn params(&self) -> &CallSpec {
        &self.params
    }

    /// Preferred topology name.
    pub fn preferred(&self) -> Option<&str> {
        self.preferred_topology.as_deref()
    }

    /// True if the test needs the multihost fixture.
    pub fn uses_multihost(&self) -> bool {
        self.uses_multihost
    }

    /// Checks the topology requirement.
    pub fn validate(&self) -> Result<()> {
        match self.requirement {
            Some(ref requirement) => requirement.validate(),
            None => Ok(()),
        }
    }

    pub(crate) fn call(&self, name: &str, mh: Option<Arc<MultihostFixture>>) -> BoxFuture<'static, Result<()>> {
        (self.body)(TestContext {
            name: name.to_string(),
            mh,
            params: self.params.clone(),
        })
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("requirement", &self.requirement)
            .field("requires", &self.requires)
            .field("params", &self.params)
            .field("preferred_topology", &self.preferred_topology)
            .field("uses_multihost", &self.uses_multihost)
            .finish_non_exhaustive()
    }
}
