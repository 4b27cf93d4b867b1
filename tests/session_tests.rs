//! Session lifecycle tests
//!
//! Runs whole sessions over an inventory of local hosts and checks the order
//! of host and topology hooks, test outcomes, topology switching, failure
//! handling and the logs written for each test.

#![cfg(feature = "local")]

mod common;

use common::*;
use multihost::artifacts::ArtifactsMode;
use multihost::controller::BackupTopologyController;
use multihost::error::Error;
use multihost::fixture::Require;
use multihost::inventory::MultihostHost;
use multihost::marks::TopologyMark;
use multihost::options::MultihostOptions;
use multihost::role::MultihostRole;
use multihost::runner::{Outcome, Session, TestCase};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    events: Events,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            events: Events::new(),
            dir: TempDir::new().unwrap(),
        }
    }

    fn session(&self, inventory: &str, options: MultihostOptions) -> Session {
        let config = load_inventory(
            inventory,
            &recording_registry(&self.events),
            self.dir.path(),
            options.collect_artifacts,
        );
        Session::new(config, options)
    }

    fn mark(&self, name: &str, roles: &[(&str, usize)]) -> TopologyMark {
        recording_mark(name, roles, RecordingController::new(self.events.clone()))
    }
}

fn never() -> MultihostOptions {
    MultihostOptions {
        collect_artifacts: ArtifactsMode::Never,
        ..Default::default()
    }
}

fn passing(name: &str) -> TestCase {
    TestCase::new(name, |_| async { Ok(()) })
}

#[tokio::test]
async fn test_topology_groups_and_hook_order() {
    let fx = Fixture::new();
    let client = fx.mark("client", &[("client", 1)]);
    let ldap = fx.mark("ldap", &[("client", 1), ("ldap", 1)]);

    let mut session = fx.session(INVENTORY, never());
    session
        .register(
            TestCase::new("test_a", |ctx| async move {
                let mh = ctx.mh()?;
                assert_eq!(mh.fixture("ldap")?.role()?.host().hostname(), "master.ldap.test");
                Ok(())
            })
            .topology(ldap.clone()),
        )
        .unwrap();
    session.register(passing("test_b").topology(client)).unwrap();
    session.register(passing("test_c").topology(ldap)).unwrap();

    let report = session.run().await;

    let names: Vec<_> = report.tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["test_b", "test_a", "test_c"]);
    assert_eq!(report.count(Outcome::Passed), 3);
    assert!(report.success());

    assert_eq!(
        fx.events.matching("controller.topology_"),
        vec![
            "controller.topology_setup:client",
            "controller.topology_teardown:client",
            "controller.topology_setup:ldap",
            "controller.topology_teardown:ldap",
        ]
    );
    assert_eq!(
        fx.events.matching("host.pytest_setup"),
        vec!["host.pytest_setup:client.test", "host.pytest_setup:master.ldap.test"]
    );
    assert_eq!(fx.events.matching("host.setup:client.test").len(), 3);
    assert_eq!(fx.events.matching("host.setup:master.ldap.test").len(), 2);
    assert!(fx.events.matching("host.setup:replica").is_empty());

    let last_topology = fx.events.position("controller.topology_teardown:ldap").unwrap();
    let teardown = fx.events.position("host.pytest_teardown:client.test").unwrap();
    assert!(teardown > last_topology);
}

#[tokio::test]
async fn test_hooks_around_one_test() {
    let fx = Fixture::new();
    let mut session = fx.session(INVENTORY, never());
    session
        .register(passing("test_one").topology(fx.mark("client", &[("client", 1)])))
        .unwrap();

    session.run().await;

    assert_eq!(
        fx.events.all(),
        vec![
            "host.pytest_setup:client.test",
            "host.backup:client.test:0",
            "controller.topology_setup:client",
            "host.setup:client.test",
            "controller.setup:client",
            "controller.teardown:client",
            "host.teardown:client.test",
            "controller.topology_teardown:client",
            "host.pytest_teardown:client.test",
            "host.remove_backup:client.test:0",
        ]
    );
}

#[tokio::test]
async fn test_outcomes() {
    let fx = Fixture::new();
    let mark = fx.mark("client", &[("client", 1)]);

    let mut session = fx.session(INVENTORY, never());
    session.register(passing("test_pass").topology(mark.clone())).unwrap();
    session
        .register(
            TestCase::new("test_fail", |_| async { Err(Error::hook("assertion failed")) }).topology(mark.clone()),
        )
        .unwrap();
    session
        .register(
            TestCase::new("test_panic", |_| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .topology(mark.clone()),
        )
        .unwrap();
    session
        .register(
            TestCase::new("test_skip", |_| async { Err(Error::skip("not today")) }).topology(mark.clone()),
        )
        .unwrap();
    session
        .register(passing("test_plain").without_multihost())
        .unwrap();
    session.register(passing("test_untopologized")).unwrap();

    let report = session.run().await;

    assert_eq!(report.test("test_pass").unwrap().outcome, Outcome::Passed);
    assert_eq!(report.test("test_fail").unwrap().outcome, Outcome::Failed);
    assert!(report
        .test("test_fail")
        .unwrap()
        .message
        .as_deref()
        .unwrap()
        .contains("assertion failed"));

    let panicked = report.test("test_panic").unwrap();
    assert_eq!(panicked.outcome, Outcome::Failed);
    assert_eq!(panicked.message.as_deref(), Some("Test panicked: boom"));

    let skipped = report.test("test_skip").unwrap();
    assert_eq!(skipped.outcome, Outcome::Skipped);
    assert_eq!(skipped.message.as_deref(), Some("not today"));

    assert_eq!(report.test("test_plain").unwrap().outcome, Outcome::Passed);
    assert_eq!(report.deselected, vec!["test_untopologized"]);
    assert_eq!(report.exit_code(), 1);

    // A panic does not prevent teardown of the test.
    assert_eq!(fx.events.matching("host.teardown:client.test").len(), 4);
}

#[tokio::test]
async fn test_topology_setup_failure_skips_its_tests() {
    let fx = Fixture::new();
    let broken = recording_mark(
        "broken",
        &[("client", 1)],
        RecordingController::new(fx.events.clone()).failing_topology_setup(),
    );
    let healthy = fx.mark("ldap", &[("ldap", 1)]);

    let mut session = fx.session(INVENTORY, never());
    session.register(passing("test_a").topology(broken.clone())).unwrap();
    session.register(passing("test_b").topology(broken)).unwrap();
    session.register(passing("test_c").topology(healthy)).unwrap();

    let report = session.run().await;

    for name in ["test_a", "test_b"] {
        let test = report.test(name).unwrap();
        assert_eq!(test.outcome, Outcome::Skipped);
        assert_eq!(test.message.as_deref(), Some("Error in topology setup"));
    }
    assert_eq!(report.test("test_c").unwrap().outcome, Outcome::Passed);

    // Teardown of a topology that never finished setup is not called.
    assert!(fx.events.position("controller.topology_teardown:broken").is_none());
    assert!(fx.events.position("controller.topology_teardown:ldap").is_some());
}

#[tokio::test]
async fn test_host_setup_failure_errors_every_test() {
    let fx = Fixture::new();
    let inventory = r#"
domains:
- id: test
  hosts:
  - hostname: client.test
    role: client
    conn: {type: local}
    config: {fail: [pytest_setup]}
  - {hostname: master.ldap.test, role: ldap, conn: {type: local}}
"#;

    let mut session = fx.session(inventory, never());
    session
        .register(passing("test_a").topology(fx.mark("ldap", &[("client", 1), ("ldap", 1)])))
        .unwrap();

    let report = session.run().await;

    let test = report.test("test_a").unwrap();
    assert_eq!(test.outcome, Outcome::Error);
    assert_eq!(test.message.as_deref(), Some("Session setup failed"));
    assert_eq!(report.errors.len(), 1);
    assert!(!report.success());

    // Setup stops at the first failing host; nothing was set up, so nothing
    // is torn down.
    assert!(fx.events.position("host.pytest_setup:master.ldap.test").is_none());
    assert!(fx.events.matching("host.pytest_teardown").is_empty());
    assert!(fx.events.matching("controller.").is_empty());
}

#[tokio::test]
async fn test_teardown_error_turns_pass_into_error() {
    let fx = Fixture::new();
    let inventory = r#"
domains:
- id: test
  hosts:
  - hostname: client.test
    role: client
    conn: {type: local}
    config: {fail: [teardown]}
"#;
    let mark = fx.mark("client", &[("client", 1)]);

    let mut session = fx.session(inventory, never());
    session.register(passing("test_pass").topology(mark.clone())).unwrap();
    session
        .register(TestCase::new("test_fail", |_| async { Err(Error::hook("first")) }).topology(mark))
        .unwrap();

    let report = session.run().await;

    assert_eq!(report.test("test_pass").unwrap().outcome, Outcome::Error);

    let failed = report.test("test_fail").unwrap();
    assert_eq!(failed.outcome, Outcome::Failed);
    let message = failed.message.as_deref().unwrap();
    assert!(message.contains("first"));
    assert!(message.lines().count() > 1);
}

#[tokio::test]
async fn test_controller_skip() {
    let fx = Fixture::new();
    let mark = recording_mark(
        "client",
        &[("client", 1)],
        RecordingController::new(fx.events.clone()).skipping("no client today"),
    );

    let mut session = fx.session(INVENTORY, never());
    session.register(passing("test_a").topology(mark)).unwrap();

    let report = session.run().await;

    let test = report.test("test_a").unwrap();
    assert_eq!(test.outcome, Outcome::Skipped);
    assert_eq!(test.message.as_deref(), Some("no client today"));
    assert!(fx.events.matching("host.setup").is_empty());
    assert!(fx.events.matching("controller.topology_").is_empty());
}

#[tokio::test]
async fn test_topology_setup_waits_for_first_running_test() {
    let fx = Fixture::new();
    let mark = fx.mark("client", &[("client", 1)]);

    let mut session = fx.session(INVENTORY, never());
    session
        .register(
            passing("test_a")
                .topology(mark.clone())
                .require(Require::sync(&[], |_| Ok(false)).reason("not needed")),
        )
        .unwrap();
    session.register(passing("test_b").topology(mark)).unwrap();

    let report = session.run().await;

    let skipped = report.test("test_a").unwrap();
    assert_eq!(skipped.outcome, Outcome::Skipped);
    assert_eq!(skipped.message.as_deref(), Some("not needed"));
    assert_eq!(report.test("test_b").unwrap().outcome, Outcome::Passed);
    assert_eq!(
        fx.events.matching("controller.topology_"),
        vec!["controller.topology_setup:client", "controller.topology_teardown:client"]
    );
    assert_eq!(fx.events.matching("host.setup:"), vec!["host.setup:client.test"]);
}

#[tokio::test]
async fn test_failed_host_setup_rolls_back_hosts_already_set_up() {
    let fx = Fixture::new();
    let inventory = r#"
domains:
- id: test
  hosts:
  - {hostname: a.test, role: client, conn: {type: local}}
  - {hostname: b.test, role: ldap, conn: {type: local}, config: {fail: [setup]}}
  - {hostname: c.test, role: kdc, conn: {type: local}}
"#;
    let mark = fx.mark("all", &[("client", 1), ("ldap", 1), ("kdc", 1)]);

    let mut session = fx.session(inventory, never());
    session.register(passing("test_a").topology(mark)).unwrap();

    let report = session.run().await;

    let test = report.test("test_a").unwrap();
    assert_eq!(test.outcome, Outcome::Error);
    assert!(test.message.as_deref().unwrap().contains("setup failed on b.test"));

    assert_eq!(fx.events.matching("host.setup:"), vec!["host.setup:a.test", "host.setup:b.test"]);
    assert_eq!(fx.events.matching("host.teardown:"), vec!["host.teardown:a.test"]);
    assert!(fx.events.position("controller.setup:all").is_none());
    assert!(fx.events.position("controller.teardown:all").is_none());
}

#[tokio::test]
async fn test_every_teardown_error_is_reported() {
    let fx = Fixture::new();
    let inventory = r#"
domains:
- id: test
  hosts:
  - {hostname: a.test, role: client, conn: {type: local}, config: {fail: [teardown]}}
  - {hostname: b.test, role: ldap, conn: {type: local}, config: {fail: [teardown]}}
  - {hostname: c.test, role: kdc, conn: {type: local}, config: {fail: [teardown]}}
"#;
    let mark = fx.mark("all", &[("client", 1), ("ldap", 1), ("kdc", 1)]);

    let mut session = fx.session(inventory, never());
    session.register(passing("test_a").topology(mark)).unwrap();

    let report = session.run().await;

    let test = report.test("test_a").unwrap();
    assert_eq!(test.outcome, Outcome::Error);
    let message = test.message.as_deref().unwrap();
    for host in ["a.test", "b.test", "c.test"] {
        assert!(message.contains(&format!("teardown failed on {host}")), "{host} missing in {message}");
    }
    assert_eq!(fx.events.matching("host.teardown:").len(), 3);
}

#[tokio::test]
async fn test_artifacts_collected_when_setup_fails() {
    let fx = Fixture::new();
    let source = TempDir::new().unwrap();
    let file = source.path().join("client.log");
    std::fs::write(&file, "setup output").unwrap();

    let inventory = format!(
        r#"
domains:
- id: test
  hosts:
  - hostname: client.test
    role: client
    conn: {{type: local}}
    artifacts: ["{}"]
    config: {{fail: [setup]}}
"#,
        file.display()
    );
    let options = MultihostOptions {
        collect_artifacts: ArtifactsMode::Always,
        ..Default::default()
    };

    let mut session = fx.session(&inventory, options);
    session
        .register(passing("test_a").topology(fx.mark("client", &[("client", 1)])))
        .unwrap();

    let report = session.run().await;
    assert_eq!(report.test("test_a").unwrap().outcome, Outcome::Error);

    let dest = fx.dir.path().join("tests/test_a/client/client.test");
    assert!(dest.is_dir());
    let stored = dest.join(file.strip_prefix("/").unwrap());
    assert_eq!(std::fs::read_to_string(stored).unwrap(), "setup output");
}

#[tokio::test]
async fn test_artifacts_error_turns_pass_into_error() {
    let fx = Fixture::new();
    let inventory = r#"
domains:
- id: test
  hosts:
  - hostname: client.test
    role: client
    os: {family: windows}
    conn: {type: local}
    artifacts: [/var/log/client.log]
"#;
    let options = MultihostOptions {
        collect_artifacts: ArtifactsMode::Always,
        ..Default::default()
    };

    let mut session = fx.session(inventory, options);
    session
        .register(passing("test_a").topology(fx.mark("client", &[("client", 1)])))
        .unwrap();

    let report = session.run().await;

    let test = report.test("test_a").unwrap();
    assert_eq!(test.outcome, Outcome::Error);
    assert!(test
        .message
        .as_deref()
        .unwrap()
        .contains("Artifacts are not supported on Windows machine"));
    // Teardown still ran to the end.
    assert!(fx.events.position("host.teardown:client.test").is_some());
    assert!(fx.events.position("controller.topology_teardown:client").is_some());
}

#[tokio::test]
async fn test_interrupted_session_runs_no_tests() {
    let fx = Fixture::new();
    let mut session = fx.session(INVENTORY, never());
    session
        .register(passing("test_a").topology(fx.mark("client", &[("client", 1)])))
        .unwrap();

    session.interrupt_flag().store(true, Ordering::SeqCst);
    let report = session.run().await;

    assert!(report.interrupted);
    assert!(report.tests.is_empty());
    assert_eq!(report.exit_code(), 1);
    assert!(fx.events.position("host.pytest_teardown:client.test").is_some());
}

#[tokio::test]
async fn test_backup_controller_restores_hosts() {
    let fx = Fixture::new();
    let mark = TopologyMark::new("client", test_topology(&[("client", 1)]))
        .with_controller(Arc::new(BackupTopologyController::new()))
        .with_fixture("client", "test.client[0]");

    let mut session = fx.session(INVENTORY, never());
    session.register(passing("test_a").topology(mark.clone())).unwrap();
    session.register(passing("test_b").topology(mark)).unwrap();

    let report = session.run().await;
    assert!(report.success());

    let backups: Vec<String> = fx
        .events
        .all()
        .into_iter()
        .filter(|e| e.contains("backup") || e.contains("restore"))
        .collect();
    assert_eq!(
        backups,
        vec![
            "host.backup:client.test:0",
            "host.backup:client.test:1",
            "host.restore:client.test:1",
            "host.restore:client.test:1",
            "host.remove_backup:client.test:1",
            "host.restore:client.test:0",
            "host.remove_backup:client.test:0",
        ]
    );
}

#[tokio::test]
async fn test_failed_topology_backup_removes_taken_backups() {
    let fx = Fixture::new();
    let inventory = r#"
domains:
- id: test
  hosts:
  - {hostname: client.test, role: client, conn: {type: local}}
  - hostname: master.ldap.test
    role: ldap
    conn: {type: local}
    config: {fail: [topology_backup]}
"#;
    let mark = TopologyMark::new("ldap", test_topology(&[("client", 1), ("ldap", 1)]))
        .with_controller(Arc::new(BackupTopologyController::new()))
        .with_fixture("client", "test.client[0]");

    let mut session = fx.session(inventory, never());
    session.register(passing("test_a").topology(mark)).unwrap();

    let report = session.run().await;

    let test = report.test("test_a").unwrap();
    assert_eq!(test.outcome, Outcome::Skipped);
    assert_eq!(test.message.as_deref(), Some("Error in topology setup"));

    let backups: Vec<String> = fx
        .events
        .all()
        .into_iter()
        .filter(|e| e.contains("backup") || e.contains("restore"))
        .collect();
    assert_eq!(
        backups,
        vec![
            "host.backup:client.test:0",
            "host.backup:master.ldap.test:0",
            "host.backup:client.test:1",
            "host.restore:client.test:0",
            "host.restore:master.ldap.test:0",
            "host.remove_backup:client.test:1",
            "host.remove_backup:client.test:0",
            "host.remove_backup:master.ldap.test:0",
        ]
    );
}

#[tokio::test]
async fn test_logs_are_written_per_test() {
    let fx = Fixture::new();
    let options = MultihostOptions {
        collect_artifacts: ArtifactsMode::Always,
        ..Default::default()
    };

    let mut session = fx.session(INVENTORY, options);
    session
        .register(
            TestCase::new("test_logs", |ctx| async move {
                ctx.mh()?.logger().info("hello from the test body");
                Ok(())
            })
            .topology(fx.mark("client", &[("client", 1)])),
        )
        .unwrap();

    let report = session.run().await;
    assert!(report.success());

    let test_dir = fx.dir.path().join("tests").join("test_logs");
    let body = std::fs::read_to_string(test_dir.join("test.log")).unwrap();
    assert!(body.contains("hello from the test body"));

    let setup = std::fs::read_to_string(test_dir.join("setup.log")).unwrap();
    assert!(setup.contains("SETUP HOSTS"));
    assert!(test_dir.join("teardown.log").exists());

    assert!(fx
        .dir
        .path()
        .join("hosts/client.test/pytest_setup.log")
        .exists());
    assert!(fx
        .dir
        .path()
        .join("topologies/client/topology_setup.log")
        .exists());
}

#[tokio::test]
async fn test_logs_not_written_when_never() {
    let fx = Fixture::new();
    let mut session = fx.session(INVENTORY, never());
    session
        .register(passing("test_quiet").topology(fx.mark("client", &[("client", 1)])))
        .unwrap();

    session.run().await;

    assert!(!fx.dir.path().join("tests").exists());
}
