//! Per-test orchestration.
//!
//! [`MultihostFixture`] is created for every test that runs with a topology
//! mark. It creates the role objects of the test, decides whether the test
//! is skipped, prepares hosts, controller, utilities and roles before the
//! test body and undoes all of it afterwards.
//!
//! Every completed setup step pushes its undo onto a rollback stack. A failed
//! setup unwinds the stack right away; a finished test unwinds it in
//! [`MultihostFixture::exit`] and reports every teardown error at once.

use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::artifacts::{ArtifactsCollectable, ArtifactsType};
use crate::controller::TopologyController;
use crate::error::{AggregateError, AggregateKind, Error, ErrorCollector, Result};
use crate::inventory::{MultihostConfig, MultihostHost};
use crate::logging::MultihostLogger;
use crate::marks::TopologyMark;
use crate::role::{MultihostRole, RoleContext};
use crate::topology::Topology;
use crate::utility::{
    enter_utilities, exit_utilities, resolve_dependencies, setup_utilities, teardown_utilities, Utility,
};

/// Host utilities are entered at this place around every test.
pub const WHERE_TEST: &str = "test";

// ============================================================================
// Outcome
// ============================================================================

/// Result of a test or of a session level operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Finished without error
    Passed,
    /// The test body failed
    Failed,
    /// Not run
    Skipped,
    /// Setup, teardown or a skip callback failed
    Error,
    /// Not known yet
    #[default]
    Unknown,
}

impl Outcome {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::Error => "error",
            Outcome::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Fixture values
// ============================================================================

/// Role or roles a fixture name resolves to.
#[derive(Debug, Clone)]
pub enum FixtureValue {
    /// `dom.role[i]`
    Role(Arc<dyn MultihostRole>),
    /// `dom.role`
    Roles(Vec<Arc<dyn MultihostRole>>),
}

impl FixtureValue {
    /// The single role; fails for a list.
    pub fn role(&self) -> Result<&Arc<dyn MultihostRole>> {
        match self {
            FixtureValue::Role(role) => Ok(role),
            FixtureValue::Roles(_) => Err(Error::InvalidValue(
                "Fixture refers to a list of roles".to_string(),
            )),
        }
    }

    /// All roles; a single role is returned as a one element list.
    pub fn roles(&self) -> Vec<Arc<dyn MultihostRole>> {
        match self {
            FixtureValue::Role(role) => vec![Arc::clone(role)],
            FixtureValue::Roles(roles) => roles.clone(),
        }
    }
}

fn downcast_role<T: 'static>(role: &Arc<dyn MultihostRole>) -> Result<&T> {
    role.as_any().downcast_ref::<T>().ok_or_else(|| {
        Error::InvalidValue(format!(
            "Role {} on {} is not a {}",
            role.role(),
            role.host().hostname(),
            std::any::type_name::<T>()
        ))
    })
}

// ============================================================================
// Requirements
// ============================================================================

/// Answer of a [`Require`] condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// The test can run
    Met,
    /// The test is skipped, optionally with a reason
    NotMet(Option<String>),
}

impl From<bool> for Requirement {
    fn from(met: bool) -> Self {
        if met {
            Requirement::Met
        } else {
            Requirement::NotMet(None)
        }
    }
}

impl<S: Into<String>> From<(bool, S)> for Requirement {
    fn from((met, reason): (bool, S)) -> Self {
        if met {
            Requirement::Met
        } else {
            Requirement::NotMet(Some(reason.into()))
        }
    }
}

/// Values a [`Require`] condition can read: fixtures and test parameters.
#[derive(Debug, Default)]
pub struct RequireArgs {
    fixtures: IndexMap<String, FixtureValue>,
    params: IndexMap<String, Value>,
}

impl RequireArgs {
    /// Fixture `name`.
    pub fn fixture(&self, name: &str) -> Result<&FixtureValue> {
        self.fixtures.get(name).ok_or_else(|| Error::name_not_found(name))
    }

    /// Fixture `name` as a concrete role type.
    pub fn role<T: 'static>(&self, name: &str) -> Result<&T> {
        downcast_role(self.fixture(name)?.role()?)
    }

    /// Test parameter `name`.
    pub fn param(&self, name: &str) -> Result<&Value> {
        self.params.get(name).ok_or_else(|| Error::name_not_found(name))
    }
}

/// Condition evaluated by a [`Require`].
pub type RequireCondition =
    Arc<dyn for<'a> Fn(&'a RequireArgs) -> BoxFuture<'a, Result<Requirement>> + Send + Sync>;

/// A condition that must hold for a test to run.
///
/// The condition declares the fixture and parameter names it reads; an
/// undeclared name is not visible to it.
#[derive(Clone)]
pub struct Require {
    names: Vec<String>,
    condition: RequireCondition,
    reason: Option<String>,
}

impl Require {
    /// Default reason of a condition that is not met.
    pub const DEFAULT_REASON: &'static str = "Required condition was not met";

    /// Creates an asynchronous condition.
    pub fn new<F>(names: &[&str], condition: F) -> Self
    where
        F: for<'a> Fn(&'a RequireArgs) -> BoxFuture<'a, Result<Requirement>> + Send + Sync + 'static,
    {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            condition: Arc::new(condition),
            reason: None,
        }
    }

    /// Creates a condition that does not touch the hosts.
    pub fn sync<F, R>(names: &[&str], condition: F) -> Self
    where
        F: Fn(&RequireArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<Requirement>,
    {
        let condition = Arc::new(condition);
        Self::new(names, move |args| {
            let result = condition(args).map(Into::<Requirement>::into);
            async move { result }.boxed()
        })
    }

    /// Reason reported when the condition does not give one.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Declared names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl fmt::Debug for Require {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Require")
            .field("names", &self.names)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Fixture
// ============================================================================

/// Rollback entries, undone in reverse.
enum Undo {
    ExitHostUtils(Vec<Arc<dyn Utility>>),
    TeardownHost(Arc<dyn MultihostHost>),
    TeardownTopology,
    TeardownUtils(Vec<Arc<dyn Utility>>),
    TeardownRole(Arc<dyn MultihostRole>),
}

impl Undo {
    fn phase(&self) -> &'static str {
        match self {
            Undo::ExitHostUtils(_) => "TEARDOWN EXIT HOSTS UTILS",
            Undo::TeardownHost(_) => "TEARDOWN HOSTS",
            Undo::TeardownTopology => "TEARDOWN TOPOLOGY",
            Undo::TeardownUtils(_) => "TEARDOWN UTILS",
            Undo::TeardownRole(_) => "TEARDOWN ROLES",
        }
    }
}

/// Multihost state of one test.
pub struct MultihostFixture {
    config: Arc<MultihostConfig>,
    mark: TopologyMark,
    test_name: String,
    paths: IndexMap<String, FixtureValue>,
    fixtures: IndexMap<String, FixtureValue>,
    roles: Vec<Arc<dyn MultihostRole>>,
    hosts: Vec<Arc<dyn MultihostHost>>,
    undo: Mutex<Vec<Undo>>,
    outcome: Mutex<Outcome>,
    skipped: AtomicBool,
    logger: MultihostLogger,
}

impl MultihostFixture {
    /// Creates the roles of `test_name` for the hosts `mark` selects.
    pub fn new(config: Arc<MultihostConfig>, mark: TopologyMark, test_name: impl Into<String>) -> Result<Self> {
        let test_name = test_name.into();
        let mut paths = IndexMap::new();
        let mut roles: Vec<Arc<dyn MultihostRole>> = Vec::new();

        for domain in config.domains() {
            let Ok(required) = mark.topology().get(domain.id()) else {
                continue;
            };

            for role_name in domain.roles() {
                let Ok(count) = required.get(&role_name) else {
                    continue;
                };

                let objects = domain
                    .hosts_by_role(&role_name)
                    .into_iter()
                    .take(count)
                    .map(|host| domain.create_role(RoleContext::new(host, &test_name, mark.name())))
                    .collect::<Result<Vec<_>>>()?;

                for (i, role) in objects.iter().enumerate() {
                    paths.insert(
                        format!("{}.{role_name}[{i}]", domain.id()),
                        FixtureValue::Role(Arc::clone(role)),
                    );
                }
                roles.extend(objects.iter().cloned());
                paths.insert(format!("{}.{role_name}", domain.id()), FixtureValue::Roles(objects));
            }
        }

        roles.sort_by(|a, b| a.role().cmp(b.role()));

        let mut hosts: Vec<Arc<dyn MultihostHost>> = Vec::new();
        for role in &roles {
            if !hosts.iter().any(|h| Arc::ptr_eq(h, role.host())) {
                hosts.push(Arc::clone(role.host()));
            }
        }
        hosts.sort_by(|a, b| a.hostname().cmp(b.hostname()));

        let mut fixtures = IndexMap::new();
        for (name, path) in mark.fixtures() {
            let value = paths.get(path).cloned().ok_or_else(|| Error::name_not_found(path))?;
            fixtures.insert(name.clone(), value);
        }

        let logger = config.logger().child(format!("test={test_name}"));
        Ok(Self {
            config,
            mark,
            test_name,
            paths,
            fixtures,
            roles,
            hosts,
            undo: Mutex::new(Vec::new()),
            outcome: Mutex::new(Outcome::Unknown),
            skipped: AtomicBool::new(false),
            logger,
        })
    }

    /// Inventory.
    pub fn config(&self) -> &Arc<MultihostConfig> {
        &self.config
    }

    /// Topology mark of the test.
    pub fn mark(&self) -> &TopologyMark {
        &self.mark
    }

    /// Topology of the test.
    pub fn topology(&self) -> &Topology {
        self.mark.topology()
    }

    /// Topology controller.
    pub fn controller(&self) -> &Arc<dyn TopologyController> {
        self.mark.controller()
    }

    /// Test name.
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Test logger.
    pub fn logger(&self) -> &MultihostLogger {
        &self.logger
    }

    /// Every role of the test, sorted by role name.
    pub fn roles(&self) -> &[Arc<dyn MultihostRole>] {
        &self.roles
    }

    /// Hosts of the roles, sorted by hostname.
    pub fn hosts(&self) -> &[Arc<dyn MultihostHost>] {
        &self.hosts
    }

    /// Role or roles at `path`, such as `test.client[0]` or `test.ldap`.
    pub fn lookup(&self, path: &str) -> Result<&FixtureValue> {
        self.paths.get(path).ok_or_else(|| Error::name_not_found(path))
    }

    /// Role or roles bound to fixture `name` by the mark.
    pub fn fixture(&self, name: &str) -> Result<&FixtureValue> {
        self.fixtures.get(name).ok_or_else(|| Error::name_not_found(name))
    }

    /// Fixture `name` as a concrete role type.
    pub fn role<T: 'static>(&self, name: &str) -> Result<&T> {
        downcast_role(self.fixture(name)?.role()?)
    }

    /// Fixture `name` as a list of a concrete role type.
    pub fn roles_as<T: 'static>(&self, name: &str) -> Result<Vec<&T>> {
        match self.fixture(name)? {
            FixtureValue::Role(role) => Ok(vec![downcast_role(role)?]),
            FixtureValue::Roles(roles) => roles.iter().map(downcast_role).collect(),
        }
    }

    /// Current outcome.
    pub fn outcome(&self) -> Outcome {
        *self.outcome.lock()
    }

    /// Sets the outcome; it decides whether artifacts are collected.
    pub fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.lock() = outcome;
    }

    /// True if [`MultihostFixture::skip`] decided to skip the test.
    pub fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::SeqCst)
    }

    fn log_phase(&self, phase: &str) {
        self.logger.phase(format!("{phase} :: {}", self.test_name));
    }

    fn log_phase_done(&self, phase: &str) {
        self.logger.phase(format!("{phase} DONE :: {}", self.test_name));
    }

    fn push_undo(&self, undo: Undo) {
        self.undo.lock().push(undo);
    }

    // ------------------------------------------------------------------------
    // Skip
    // ------------------------------------------------------------------------

    /// Decides whether the test runs.
    ///
    /// Returns the skip reason, if any. A failing callback sets the outcome
    /// to [`Outcome::Error`] and is returned as a skip callback error.
    pub async fn skip(&self, requires: &[Require], params: &IndexMap<String, Value>) -> Result<Option<String>> {
        match self.skip_reason(requires, params).await {
            Ok(Some(reason)) => {
                self.skipped.store(true, Ordering::SeqCst);
                Ok(Some(reason))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.skipped.store(true, Ordering::SeqCst);
                self.set_outcome(Outcome::Error);
                Err(Error::Aggregate(AggregateError::new(AggregateKind::SkipCallback, vec![e])))
            }
        }
    }

    async fn skip_reason(&self, requires: &[Require], params: &IndexMap<String, Value>) -> Result<Option<String>> {
        self.log_phase("SKIP BY TOPOLOGY");
        let controller = self.controller();
        let reason = controller.skip(controller.state().args()?).await?;
        self.log_phase_done("SKIP BY TOPOLOGY");
        if reason.is_some() {
            return Ok(reason);
        }

        self.log_phase("SKIP BY REQUIRE MARKER");
        for require in requires {
            let mut args = RequireArgs::default();
            for name in &require.names {
                if let Some(value) = self.fixtures.get(name) {
                    args.fixtures.insert(name.clone(), value.clone());
                } else if let Some(value) = params.get(name) {
                    args.params.insert(name.clone(), value.clone());
                } else {
                    return Err(Error::Lookup(format!(
                        "Requirement asks for \"{name}\" which is neither a fixture nor a parameter"
                    )));
                }
            }

            if let Requirement::NotMet(reason) = (require.condition)(&args).await? {
                let reason = reason
                    .or_else(|| require.reason.clone())
                    .unwrap_or_else(|| Require::DEFAULT_REASON.to_string());
                return Ok(Some(reason));
            }
        }
        self.log_phase_done("SKIP BY REQUIRE MARKER");

        Ok(None)
    }

    // ------------------------------------------------------------------------
    // Enter
    // ------------------------------------------------------------------------

    /// Prepares everything before the test body.
    ///
    /// On failure the outcome becomes [`Outcome::Error`], artifacts are
    /// collected and the steps already done are undone.
    pub async fn enter(&self) -> Result<()> {
        let result = self.enter_phases().await;
        if let Err(ref e) = result {
            self.set_outcome(Outcome::Error);
            self.logger.error(format!("Test setup failed: {e}"));

            self.log_phase("COLLECT ARTIFACTS");
            for error in self.collect_artifacts().await {
                self.logger.error(format!("An error happened when collecting artifacts: {error}"));
            }
            self.log_phase_done("COLLECT ARTIFACTS");

            for error in self.unwind().await {
                self.logger.error(format!("Rollback after failed setup: {error}"));
            }
        }
        result
    }

    async fn enter_phases(&self) -> Result<()> {
        self.log_phase("SETUP ENTER HOSTS UTILS");
        for host in &self.hosts {
            let utils = resolve_dependencies(&host.utilities())?;
            self.push_undo(Undo::ExitHostUtils(utils.clone()));
            enter_utilities(&utils, WHERE_TEST).await?;
        }
        self.log_phase_done("SETUP ENTER HOSTS UTILS");

        self.log_phase("SETUP HOSTS");
        for host in &self.hosts {
            host.base().op_state().clear("setup");
            host.setup().await?;
            host.base().op_state().set_success("setup");
            self.push_undo(Undo::TeardownHost(Arc::clone(host)));
        }
        self.log_phase_done("SETUP HOSTS");

        self.log_phase("SETUP TOPOLOGY");
        let controller = self.controller();
        controller.state().op_state().clear("setup");
        controller.setup(controller.state().args()?).await?;
        controller.state().op_state().set_success("setup");
        self.push_undo(Undo::TeardownTopology);
        self.log_phase_done("SETUP TOPOLOGY");

        self.log_phase("SETUP UTILS");
        for role in &self.roles {
            let utils = resolve_dependencies(&role.utilities())?;
            self.push_undo(Undo::TeardownUtils(utils.clone()));
            setup_utilities(&utils).await?;
        }
        self.log_phase_done("SETUP UTILS");

        self.log_phase("SETUP ROLES");
        for role in &self.roles {
            role.setup().await?;
            self.push_undo(Undo::TeardownRole(Arc::clone(role)));
        }
        self.log_phase_done("SETUP ROLES");

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Exit
    // ------------------------------------------------------------------------

    /// Collects artifacts and undoes the setup.
    ///
    /// Artifact and teardown errors are returned together in one aggregate.
    pub async fn exit(&self) -> Result<()> {
        if self.is_skipped() {
            return Ok(());
        }

        self.log_phase("COLLECT ARTIFACTS");
        let mut errors = self.collect_artifacts().await;
        self.log_phase_done("COLLECT ARTIFACTS");

        errors.extend(self.unwind().await);
        if errors.is_empty() {
            return Ok(());
        }

        for error in &errors {
            self.logger.error(error.to_string());
        }
        Err(Error::Aggregate(AggregateError::with_message(
            AggregateKind::Teardown,
            "One or more error occurred during test teardown",
            errors,
        )))
    }

    async fn collect_artifacts(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        let collector = self.config.artifacts();
        let controller = Arc::clone(self.controller());
        let outcome = self.outcome();

        for host in &self.hosts {
            let roles: Vec<Arc<dyn MultihostRole>> = self
                .roles
                .iter()
                .filter(|r| Arc::ptr_eq(r.host(), host))
                .cloned()
                .collect();

            let mut utils = Vec::new();
            for role in &roles {
                match resolve_dependencies(&role.utilities()) {
                    Ok(deps) => utils.extend(deps),
                    Err(e) => errors.push(e),
                }
            }

            let mut collectables: Vec<&dyn ArtifactsCollectable> = Vec::new();
            collectables.push(host);
            collectables.push(&controller);
            collectables.extend(roles.iter().map(|r| r as &dyn ArtifactsCollectable));
            collectables.extend(utils.iter().map(|u| u as &dyn ArtifactsCollectable));

            let path = format!("tests/{}/{}/{}", self.test_name, host.role(), host.hostname());
            if let Err(e) = collector
                .collect(host.as_ref(), ArtifactsType::Test, &path, outcome, &collectables)
                .await
            {
                errors.push(e);
            }
        }
        errors
    }

    async fn unwind(&self) -> Vec<Error> {
        let steps = std::mem::take(&mut *self.undo.lock());
        let mut errors = ErrorCollector::new();
        let mut current: Option<&'static str> = None;

        for step in steps.into_iter().rev() {
            let phase = step.phase();
            if current != Some(phase) {
                if let Some(done) = current {
                    self.log_phase_done(done);
                }
                self.log_phase(phase);
                current = Some(phase);
            }

            errors.record(self.undo_step(step).await);
        }

        if let Some(done) = current {
            self.log_phase_done(done);
        }
        errors.into_errors()
    }

    async fn undo_step(&self, step: Undo) -> Result<()> {
        match step {
            Undo::TeardownRole(role) => role.teardown().await,
            Undo::TeardownUtils(utils) => teardown_utilities(&utils).await,
            Undo::TeardownTopology => {
                let controller = self.controller();
                controller.teardown(controller.state().args()?).await
            }
            Undo::TeardownHost(host) => host.teardown().await,
            Undo::ExitHostUtils(utils) => exit_utilities(&utils, WHERE_TEST).await,
        }
    }
}

impl fmt::Debug for MultihostFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultihostFixture")
            .field("test_name", &self.test_name)
            .field("mark", &self.mark.name())
            .field("paths", &self.paths.keys().collect::<Vec<_>>())
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}
