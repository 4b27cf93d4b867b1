//! Session lifecycle.
//!
//! A [`Session`] runs registered tests against one inventory:
//!
//! 1. tests are expanded, filtered and grouped by topology
//! 2. required hosts are connected and set up (`pytest_setup`)
//! 3. every topology group is set up once, before its first test that is not
//!    skipped; its tests run one at a time and the topology is torn down when
//!    the next test uses a different one
//! 4. hosts are torn down (`pytest_teardown`) and disconnected
//!
//! The first SIGINT lets the current test finish and then stops the session
//! with a regular teardown; a second one exits immediately.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use super::collection::{expand, order, select, TestItem};
use super::report::{SessionReport, TestReport};
use super::{Outcome, TestCase};
use crate::artifacts::{sanitize_path, should_collect_artifacts, ArtifactsCollectable, ArtifactsCollector, ArtifactsType};
use crate::controller::TopologyController;
use crate::error::{AggregateKind, Error, ErrorCollector, Result};
use crate::fixture::MultihostFixture;
use crate::inventory::{ConfigSettings, MultihostConfig, MultihostHost, MultihostRegistry};
use crate::logging::MultihostLogger;
use crate::marks::TopologyMark;
use crate::options::MultihostOptions;
use crate::utility::{
    enter_utilities, exit_utilities, resolve_dependencies, setup_utilities, teardown_utilities, Utility,
};

/// Host utilities are entered at this place around every topology.
pub const WHERE_TOPOLOGY: &str = "topology_setup";

fn host_utilities(host: &Arc<dyn MultihostHost>) -> Result<Vec<Arc<dyn Utility>>> {
    resolve_dependencies(&host.utilities())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("Test panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("Test panicked: {message}")
    } else {
        "Test panicked".to_string()
    }
}

/// One run of registered tests against one inventory.
pub struct Session {
    config: Arc<MultihostConfig>,
    options: MultihostOptions,
    cases: Vec<Arc<TestCase>>,
    interrupted: Arc<AtomicBool>,
}

impl Session {
    /// Creates a session over a loaded inventory.
    pub fn new(config: Arc<MultihostConfig>, options: MultihostOptions) -> Self {
        Self {
            config,
            options,
            cases: Vec::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Loads the inventory named by `--mh-config` and creates a session.
    pub fn from_options(options: MultihostOptions, registry: &MultihostRegistry) -> Result<Self> {
        let path = options
            .config
            .clone()
            .ok_or_else(|| Error::Config("Multihost configuration file is not set (--mh-config)".to_string()))?;

        let logger = match options.log_path {
            Some(ref log_path) => MultihostLogger::with_log_file(log_path)?,
            None => MultihostLogger::new(),
        };
        let settings = ConfigSettings {
            lazy_connect: options.lazy_ssh,
            artifacts: ArtifactsCollector::new(
                options.artifacts_dir.clone(),
                options.collect_artifacts,
                options.compress_artifacts,
            ),
            logger,
        };

        let config = MultihostConfig::from_yaml_file(path, registry, settings)?;
        Ok(Self::new(Arc::new(config), options))
    }

    /// Registers a test after validating its topology requirement.
    pub fn register(&mut self, case: TestCase) -> Result<()> {
        case.validate()?;
        self.cases.push(Arc::new(case));
        Ok(())
    }

    /// Inventory.
    pub fn config(&self) -> &Arc<MultihostConfig> {
        &self.config
    }

    /// Options.
    pub fn options(&self) -> &MultihostOptions {
        &self.options
    }

    /// Flag set by SIGINT; setting it stops the session after the current test.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    fn logger(&self) -> &MultihostLogger {
        self.config.logger()
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn phase(&self, name: &str, target: &str) {
        self.logger().phase(format!("{name} :: {target}"));
    }

    fn phase_done(&self, name: &str, target: &str) {
        self.logger().phase(format!("{name} DONE :: {target}"));
    }

    // ------------------------------------------------------------------------
    // Run
    // ------------------------------------------------------------------------

    /// Runs every registered test and returns the report.
    #[instrument(skip(self), fields(tests = self.cases.len()))]
    pub async fn run(&self) -> SessionReport {
        let mut report = SessionReport::default();
        self.log_configuration();

        let topology = self.config.topology();
        let items: Vec<TestItem> = self.cases.iter().flat_map(|c| expand(Arc::clone(c))).collect();
        let selection = select(items, &topology, &self.options);
        for item in &selection.deselected {
            self.logger().info(format!("Deselected {}: topology is not available", item.name));
        }
        report.deselected = selection.deselected.iter().map(|i| i.name.clone()).collect();

        let mut runnable = Vec::new();
        for item in order(selection.selected) {
            if let Some(ref mark) = item.mark {
                let state = mark.controller().state();
                if let Err(e) = state.init(mark.name(), &self.config, mark.topology(), mark.fixtures()) {
                    report.tests.push(Self::report(&item, Outcome::Error, Some(e.to_string()), Instant::now()));
                    continue;
                }
            }
            runnable.push(item);
        }

        let hosts = self.required_hosts(&runnable);
        if !hosts.is_empty() {
            self.logger().info("Selected tests will use the following hosts:");
            for host in &hosts {
                self.logger().info(format!("  {}: {}", host.role(), host.hostname()));
            }
        }

        let sigint = self.install_sigint_handler();

        let setup = if self.config.lazy_connect() {
            Ok(())
        } else {
            MultihostConfig::connect(&hosts).await
        };
        let setup = match setup {
            Ok(()) => self.setup_hosts(&hosts).await,
            Err(e) => Err(e),
        };

        match setup {
            Ok(()) => self.run_items(&runnable, &mut report).await,
            Err(e) => {
                self.logger().error(format!("Session setup failed: {e}"));
                report.errors.push(e.to_string());
                for item in &runnable {
                    report.tests.push(Self::report(
                        item,
                        Outcome::Error,
                        Some("Session setup failed".to_string()),
                        Instant::now(),
                    ));
                }
            }
        }

        if let Err(e) = self.teardown_hosts(&hosts).await {
            report.errors.push(e.to_string());
        }
        self.config.disconnect().await;
        sigint.abort();

        report.interrupted = self.interrupted();
        if report.interrupted {
            self.logger().error("Aborted because SIGINT was received.");
        }
        info!(summary = %report, "Session finished");
        report
    }

    fn log_configuration(&self) {
        let logger = self.logger();
        logger.info("Multihost configuration:");
        match serde_yaml::to_string(self.config.raw()) {
            Ok(yaml) => yaml.lines().for_each(|line| logger.info(format!("  {line}"))),
            Err(e) => logger.warning(format!("  unable to render configuration: {e}")),
        }

        logger.info("Detected topology:");
        for domain in self.config.topology().domains() {
            logger.info(format!("  {}", domain.export()));
        }

        self.options.log(logger);
    }

    fn required_hosts(&self, items: &[TestItem]) -> Vec<Arc<dyn MultihostHost>> {
        let mut hosts: Vec<Arc<dyn MultihostHost>> = Vec::new();
        for mark in items.iter().filter_map(|i| i.mark.as_ref()) {
            for host in self.config.topology_hosts(mark.topology()) {
                if !hosts.iter().any(|h| Arc::ptr_eq(h, &host)) {
                    hosts.push(host);
                }
            }
        }
        hosts.sort_by(|a, b| a.hostname().cmp(b.hostname()));
        hosts
    }

    fn install_sigint_handler(&self) -> JoinHandle<()> {
        let interrupted = Arc::clone(&self.interrupted);
        let logger = self.logger().clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if interrupted.swap(true, Ordering::SeqCst) {
                    logger.error(
                        "SIGINT received, terminating immediately. \
                         Teardown was not run, therefore hosts are in undefined state.",
                    );
                    std::process::exit(1);
                }
                logger.warning("SIGINT received, finishing current test and exiting gracefully.");
            }
        })
    }

    async fn run_items(&self, items: &[TestItem], report: &mut SessionReport) {
        // Topology of the current group; the flag is `None` until its setup ran.
        let mut active: Option<(TopologyMark, Option<bool>)> = None;

        for (i, item) in items.iter().enumerate() {
            if self.interrupted() {
                break;
            }

            if let Some(ref mark) = item.mark {
                if active.as_ref().map(|(m, _)| m.name()) != Some(mark.name()) {
                    active = Some((mark.clone(), None));
                }
            }

            let start = Instant::now();
            let (outcome, message) = match (&item.mark, active.as_mut()) {
                (Some(mark), Some((_, setup))) => self.run_multihost(item, mark, setup).await,
                _ => self.run_body(item, None).await,
            };
            let test = Self::report(item, outcome, message, start);
            info!(test = %test.name, outcome = %test.outcome, "Test finished");
            report.tests.push(test);

            let switch = match (items.get(i + 1), &item.mark) {
                (Some(next), Some(mark)) => next.topology_name() != mark.name(),
                _ => true,
            };
            if switch || self.interrupted() {
                self.leave_topology(active.take(), report).await;
            }
        }

        self.leave_topology(active.take(), report).await;
    }

    async fn leave_topology(&self, active: Option<(TopologyMark, Option<bool>)>, report: &mut SessionReport) {
        if let Some((mark, Some(_))) = active {
            if let Err(e) = self.teardown_topology(&mark).await {
                report.errors.push(e.to_string());
            }
        }
    }

    fn report(item: &TestItem, outcome: Outcome, message: Option<String>, start: Instant) -> TestReport {
        TestReport {
            name: item.name.clone(),
            topology: item.mark.as_ref().map(|m| m.name().to_string()),
            outcome,
            message,
            duration: start.elapsed(),
        }
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    async fn run_body(&self, item: &TestItem, mh: Option<Arc<MultihostFixture>>) -> (Outcome, Option<String>) {
        let body = item.case.call(&item.name, mh);
        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(())) => (Outcome::Passed, None),
            Ok(Err(Error::Skipped(reason))) => (Outcome::Skipped, Some(reason)),
            Ok(Err(e)) => (Outcome::Failed, Some(e.to_string())),
            Err(panic) => (Outcome::Failed, Some(panic_message(panic.as_ref()))),
        }
    }

    /// Runs one test of a topology group. `topology` holds the result of the
    /// group's topology setup, which runs here for the first test that is not
    /// skipped.
    async fn run_multihost(
        &self,
        item: &TestItem,
        mark: &TopologyMark,
        topology: &mut Option<bool>,
    ) -> (Outcome, Option<String>) {
        let logger = self.logger();
        let mut logs: Vec<(&str, Vec<String>)> = Vec::new();

        let fixture = match MultihostFixture::new(Arc::clone(&self.config), mark.clone(), &item.name) {
            Ok(fixture) => Arc::new(fixture),
            Err(e) => return (Outcome::Error, Some(e.to_string())),
        };

        let skip = fixture.skip(item.case.requires(), item.case.params().params()).await;
        let mut setup_records = logger.split();
        let early = match skip {
            Ok(None) => {
                let ready = match *topology {
                    Some(ready) => ready,
                    None => {
                        let ready = self.setup_topology(mark).await;
                        *topology = Some(ready);
                        ready
                    }
                };

                if !ready {
                    Some((Outcome::Skipped, Some("Error in topology setup".to_string())))
                } else {
                    match fixture.enter().await {
                        Ok(()) => None,
                        Err(e) => Some((Outcome::Error, Some(e.to_string()))),
                    }
                }
            }
            Ok(Some(reason)) => Some((Outcome::Skipped, Some(reason))),
            Err(e) => Some((Outcome::Error, Some(e.to_string()))),
        };
        setup_records.extend(logger.split());
        logs.push(("setup.log", setup_records));

        if let Some((outcome, message)) = early {
            self.flush_test_logs(item, logs, outcome);
            return (outcome, message);
        }

        let (mut outcome, mut message) = self.run_body(item, Some(Arc::clone(&fixture))).await;
        fixture.set_outcome(outcome);
        logs.push(("test.log", logger.split()));

        if let Err(e) = fixture.exit().await {
            match outcome {
                Outcome::Passed | Outcome::Skipped => {
                    outcome = Outcome::Error;
                    message = Some(e.to_string());
                }
                _ => {
                    message = Some(match message {
                        Some(m) => format!("{m}\n{e}"),
                        None => e.to_string(),
                    });
                }
            }
        }
        logs.push(("teardown.log", logger.split()));

        self.flush_test_logs(item, logs, outcome);
        (outcome, message)
    }

    fn flush_test_logs(&self, item: &TestItem, logs: Vec<(&str, Vec<String>)>, outcome: Outcome) {
        for (file, records) in logs {
            self.write_log(&format!("tests/{}/{file}", item.name), &records, outcome);
        }
    }

    fn flush_log(&self, path: &str, outcome: Outcome) {
        let records = self.logger().split();
        self.write_log(path, &records, outcome);
    }

    fn write_log(&self, path: &str, records: &[String], outcome: Outcome) {
        if records.is_empty() || !should_collect_artifacts(self.options.collect_logs(), outcome) {
            return;
        }

        let dest = self.config.artifacts().dir().join(sanitize_path(path));
        if let Err(e) = MultihostLogger::write_records(&dest, records) {
            tracing::warn!(path = %dest.display(), "Unable to write log: {e}");
        }
    }

    async fn collect(
        &self,
        host: &Arc<dyn MultihostHost>,
        kind: ArtifactsType,
        path: &str,
        outcome: Outcome,
        controller: Option<&Arc<dyn TopologyController>>,
    ) -> Result<()> {
        let utils = host_utilities(host)?;
        let mut collectables: Vec<&dyn ArtifactsCollectable> = Vec::new();
        collectables.push(host);
        collectables.extend(utils.iter().map(|u| u as &dyn ArtifactsCollectable));
        if let Some(controller) = controller {
            collectables.push(controller);
        }

        self.config
            .artifacts()
            .collect(host.as_ref(), kind, path, outcome, &collectables)
            .await
            .map(|_| ())
    }

    fn log_collect_error(&self, result: Result<()>) {
        if let Err(e) = result {
            self.logger().error(format!("An error happened when collecting artifacts: {e}"));
        }
    }

    // ------------------------------------------------------------------------
    // Hosts
    // ------------------------------------------------------------------------

    async fn setup_hosts(&self, hosts: &[Arc<dyn MultihostHost>]) -> Result<()> {
        for host in hosts {
            let result = self.setup_host(host).await;
            let outcome = match result {
                Ok(()) => Outcome::Passed,
                Err(ref e) => {
                    host.base().logger().error(format!("Host setup failed: {e}"));
                    Outcome::Error
                }
            };

            let hostname = host.hostname();
            let collected = self
                .collect(
                    host,
                    ArtifactsType::PytestSetup,
                    &format!("hosts/{hostname}/pytest_setup"),
                    outcome,
                    None,
                )
                .await;
            self.log_collect_error(collected);
            self.flush_log(&format!("hosts/{hostname}/pytest_setup.log"), outcome);
            result?;
        }
        Ok(())
    }

    async fn setup_host(&self, host: &Arc<dyn MultihostHost>) -> Result<()> {
        let hostname = host.hostname();
        let op_state = host.base().op_state();

        self.phase("PYTEST SETUP HOST UTILS", hostname);
        op_state.clear("pytest_setup_utils");
        setup_utilities(&host_utilities(host)?).await?;
        op_state.set_success("pytest_setup_utils");
        self.phase_done("PYTEST SETUP HOST UTILS", hostname);

        self.phase("PYTEST SETUP", hostname);
        op_state.clear("pytest_setup");
        host.pytest_setup().await?;
        if let Some(backup_host) = host.as_backup() {
            host.base().set_vanilla_backup(Some(backup_host.backup().await?));
        }
        op_state.set_success("pytest_setup");
        self.phase_done("PYTEST SETUP", hostname);

        Ok(())
    }

    async fn teardown_hosts(&self, hosts: &[Arc<dyn MultihostHost>]) -> Result<()> {
        let mut errors = ErrorCollector::new();
        for host in hosts {
            let result = self.teardown_host(host).await;
            let outcome = match result {
                Ok(()) => Outcome::Passed,
                Err(_) => Outcome::Error,
            };

            let hostname = host.hostname();
            let collected = self
                .collect(
                    host,
                    ArtifactsType::PytestTeardown,
                    &format!("hosts/{hostname}/pytest_teardown"),
                    outcome,
                    None,
                )
                .await;
            self.flush_log(&format!("hosts/{hostname}/pytest_teardown.log"), outcome);
            errors.record(result);
            errors.record(collected);
        }
        errors.finish(
            AggregateKind::Teardown,
            "Unable to teardown some hosts (host.pytest_teardown)",
        )
    }

    async fn teardown_host(&self, host: &Arc<dyn MultihostHost>) -> Result<()> {
        let hostname = host.hostname();
        let mut errors = ErrorCollector::new();

        self.phase("PYTEST TEARDOWN", hostname);
        if host.base().op_state().check_success("pytest_setup") {
            errors.record(host.pytest_teardown().await);
            if let (Some(backup_host), Some(backup)) = (host.as_backup(), host.base().vanilla_backup()) {
                errors.record(backup_host.remove_backup(&backup).await);
                host.base().set_vanilla_backup(None);
            }
        }
        host.base().op_state().clear("pytest_setup");
        self.phase_done("PYTEST TEARDOWN", hostname);

        self.phase("PYTEST TEARDOWN HOST UTILS", hostname);
        match host_utilities(host) {
            Ok(utils) => {
                errors.record(teardown_utilities(&utils).await);
            }
            Err(e) => errors.push(e),
        }
        self.phase_done("PYTEST TEARDOWN HOST UTILS", hostname);

        errors.finish_flat()
    }

    // ------------------------------------------------------------------------
    // Topologies
    // ------------------------------------------------------------------------

    async fn setup_topology(&self, mark: &TopologyMark) -> bool {
        let name = mark.name();
        let controller = mark.controller();
        let result = self.setup_topology_hooks(controller.as_ref(), name).await;
        let outcome = match result {
            Ok(()) => Outcome::Passed,
            Err(ref e) => {
                self.logger().error(format!("Topology {name} setup failed: {e}"));
                Outcome::Error
            }
        };

        if let Ok(hosts) = controller.state().hosts() {
            for host in hosts {
                let collected = self
                    .collect(
                        host,
                        ArtifactsType::TopologySetup,
                        &format!("topologies/{name}/topology_setup/{}", host.hostname()),
                        outcome,
                        Some(controller),
                    )
                    .await;
                self.log_collect_error(collected);
            }
        }
        self.flush_log(&format!("topologies/{name}/topology_setup.log"), outcome);

        result.is_ok()
    }

    async fn setup_topology_hooks(&self, controller: &dyn TopologyController, name: &str) -> Result<()> {
        let state = controller.state();

        self.phase("TOPOLOGY SETUP ENTER HOST UTILS", name);
        for host in state.hosts()? {
            enter_utilities(&host_utilities(host)?, WHERE_TOPOLOGY).await?;
        }
        self.phase_done("TOPOLOGY SETUP ENTER HOST UTILS", name);

        self.phase("TOPOLOGY SETUP", name);
        state.op_state().clear("topology_setup");
        controller.set_artifacts(state.args()?).await?;
        controller.topology_setup(state.args()?).await?;
        state.op_state().set_success("topology_setup");
        self.phase_done("TOPOLOGY SETUP", name);

        Ok(())
    }

    async fn teardown_topology(&self, mark: &TopologyMark) -> Result<()> {
        let name = mark.name();
        let controller = mark.controller();
        let state = controller.state();
        let mut errors = ErrorCollector::new();

        self.phase("TOPOLOGY TEARDOWN", name);
        if state.op_state().check_success("topology_setup") {
            match state.args() {
                Ok(args) => {
                    errors.record(controller.topology_teardown(args).await);
                }
                Err(e) => errors.push(e),
            }
        }
        state.op_state().clear("topology_setup");
        self.phase_done("TOPOLOGY TEARDOWN", name);

        self.phase("TOPOLOGY TEARDOWN EXIT HOST UTILS", name);
        let hosts = state.hosts().unwrap_or_default();
        for host in hosts {
            match host_utilities(host) {
                Ok(utils) => {
                    errors.record(exit_utilities(&utils, WHERE_TOPOLOGY).await);
                }
                Err(e) => errors.push(e),
            }
        }
        self.phase_done("TOPOLOGY TEARDOWN EXIT HOST UTILS", name);

        let outcome = if errors.is_empty() {
            Outcome::Passed
        } else {
            Outcome::Error
        };
        for host in hosts {
            let collected = self
                .collect(
                    host,
                    ArtifactsType::TopologyTeardown,
                    &format!("topologies/{name}/topology_teardown/{}", host.hostname()),
                    outcome,
                    Some(controller),
                )
                .await;
            errors.record(collected);
        }
        self.flush_log(&format!("topologies/{name}/topology_teardown.log"), outcome);

        errors.finish(
            AggregateKind::Teardown,
            "Unable to teardown topology (topology_controller.topology_teardown)",
        )
    }
}
