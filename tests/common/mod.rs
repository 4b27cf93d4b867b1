//! Shared test utilities for the multihost test suite.
//!
//! This module provides:
//! - [`MockConnection`], a scripted [`Connection`] that records commands
//! - [`RecordingHost`] and [`RecordingController`], which log every hook
//!   call into a shared [`Events`] list
//! - Inventory and topology mark builders
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use multihost::artifacts::{ArtifactsCollector, ArtifactsMode};
use multihost::connection::{
    Connection, ConnectionError, ConnectionResult, ProcessControl, Shell, SpawnedProcess,
};
use multihost::controller::{ControllerState, HookArgs, TopologyController};
use multihost::error::{Error, Result};
use multihost::inventory::{
    BackupHost, ConfigSettings, DomainLayout, HostBase, MultihostConfig, MultihostHost,
    MultihostRegistry,
};
use multihost::logging::MultihostLogger;
use multihost::marks::TopologyMark;
use multihost::topology::{Topology, TopologyDomain};

// ============================================================================
// Events
// ============================================================================

/// Ordered list of hook calls shared by hosts and controllers.
#[derive(Debug, Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Events starting with `prefix`, in order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Position of the first event equal to `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

// ============================================================================
// Mock Connection Implementation
// ============================================================================

/// A scripted response of [`MockConnection`].
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    pub rc: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl MockResponse {
    pub fn ok(stdout: &[&str]) -> Self {
        Self {
            rc: 0,
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            stderr: Vec::new(),
        }
    }

    pub fn fail(rc: i32, stderr: &[&str]) -> Self {
        Self {
            rc,
            stdout: Vec::new(),
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A mock connection for testing purposes.
///
/// Commands are answered by the first response whose pattern is contained
/// in the command line; unmatched commands succeed with no output.
#[derive(Debug)]
pub struct MockConnection {
    identifier: String,
    logger: MultihostLogger,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    connect_count: AtomicU32,
    commands: Mutex<Vec<String>>,
    stdin: Arc<Mutex<Vec<u8>>>,
    responses: Mutex<Vec<(String, MockResponse)>>,
}

impl MockConnection {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            logger: MultihostLogger::new(),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            commands: Mutex::new(Vec::new()),
            stdin: Arc::new(Mutex::new(Vec::new())),
            responses: Mutex::new(Vec::new()),
        }
    }

    /// Answers commands containing `pattern` with `response`.
    pub fn respond(&self, pattern: impl Into<String>, response: MockResponse) {
        self.responses.lock().push((pattern.into(), response));
    }

    /// Makes every following connect attempt fail.
    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Everything written to standard input so far.
    pub fn stdin(&self) -> String {
        String::from_utf8_lossy(&self.stdin.lock()).into_owned()
    }

    fn response_for(&self, command_line: &str) -> MockResponse {
        self.responses
            .lock()
            .iter()
            .find(|(pattern, _)| command_line.contains(pattern.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_default()
    }
}

struct MockControl {
    rc: i32,
    stdin: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl ProcessControl for MockControl {
    async fn write_stdin(&mut self, data: &[u8]) -> ConnectionResult<()> {
        self.stdin.lock().extend_from_slice(data);
        Ok(())
    }

    async fn send_eof(&mut self) -> ConnectionResult<()> {
        Ok(())
    }

    async fn send_signal(&mut self, _signal: Signal) -> ConnectionResult<()> {
        Ok(())
    }

    async fn wait(&mut self) -> ConnectionResult<i32> {
        Ok(self.rc)
    }

    async fn kill(&mut self) -> ConnectionResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn shell(&self) -> Shell {
        Shell::Bash
    }

    fn logger(&self) -> &MultihostLogger {
        &self.logger
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionFailed(format!("{} is unreachable", self.identifier)).into());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn spawn(&self, command_line: &str) -> ConnectionResult<SpawnedProcess> {
        self.commands.lock().push(command_line.to_string());
        let response = self.response_for(command_line);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        for line in response.stdout {
            let _ = out_tx.send(line);
        }
        for line in response.stderr {
            let _ = err_tx.send(line);
        }

        Ok(SpawnedProcess {
            control: Box::new(MockControl {
                rc: response.rc,
                stdin: Arc::clone(&self.stdin),
            }),
            stdout: out_rx,
            stderr: err_rx,
        })
    }
}

// ============================================================================
// Recording host
// ============================================================================

/// Host that records its hooks and supports backup.
///
/// Hooks listed in the host's `config.fail` list return an error.
/// `topology_backup` in that list fails every backup except the first.
#[derive(Debug)]
pub struct RecordingHost {
    base: HostBase,
    events: Events,
    backups: AtomicU32,
}

impl RecordingHost {
    pub fn new(base: HostBase, events: Events) -> Self {
        Self {
            base,
            events,
            backups: AtomicU32::new(0),
        }
    }

    fn fails(&self, name: &str) -> bool {
        self.base.config()["fail"]
            .as_array()
            .is_some_and(|list| list.iter().any(|v| v.as_str() == Some(name)))
    }

    fn hook(&self, name: &str) -> Result<()> {
        self.events.push(format!("host.{name}:{}", self.hostname()));
        if self.fails(name) {
            return Err(Error::hook(format!("{name} failed on {}", self.hostname())));
        }
        Ok(())
    }
}

#[async_trait]
impl MultihostHost for RecordingHost {
    fn base(&self) -> &HostBase {
        &self.base
    }

    async fn pytest_setup(&self) -> Result<()> {
        self.hook("pytest_setup")
    }

    async fn pytest_teardown(&self) -> Result<()> {
        self.hook("pytest_teardown")
    }

    async fn setup(&self) -> Result<()> {
        self.hook("setup")
    }

    async fn teardown(&self) -> Result<()> {
        self.hook("teardown")
    }

    fn as_backup(&self) -> Option<&dyn BackupHost> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl BackupHost for RecordingHost {
    async fn backup(&self) -> Result<Value> {
        let n = self.backups.fetch_add(1, Ordering::SeqCst);
        // The first backup is the session start one; `topology_backup` fails
        // every later backup.
        if n > 0 && self.fails("topology_backup") {
            return Err(Error::hook(format!("topology_backup failed on {}", self.hostname())));
        }
        self.events.push(format!("host.backup:{}:{n}", self.hostname()));
        Ok(json!(n))
    }

    async fn restore(&self, backup: &Value) -> Result<()> {
        self.events.push(format!("host.restore:{}:{backup}", self.hostname()));
        Ok(())
    }

    async fn remove_backup(&self, backup: &Value) -> Result<()> {
        self.events.push(format!("host.remove_backup:{}:{backup}", self.hostname()));
        Ok(())
    }
}

// ============================================================================
// Recording controller
// ============================================================================

/// Topology controller that records its hooks.
#[derive(Default)]
pub struct RecordingController {
    state: ControllerState,
    events: Events,
    fail_topology_setup: bool,
    skip_reason: Option<String>,
}

impl RecordingController {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn failing_topology_setup(mut self) -> Self {
        self.fail_topology_setup = true;
        self
    }

    pub fn skipping(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    fn record(&self, hook: &str) {
        let name = self.state.name().unwrap_or("?");
        self.events.push(format!("controller.{hook}:{name}"));
    }
}

#[async_trait]
impl TopologyController for RecordingController {
    fn state(&self) -> &ControllerState {
        &self.state
    }

    async fn skip(&self, _args: &HookArgs) -> Result<Option<String>> {
        Ok(self.skip_reason.clone())
    }

    async fn topology_setup(&self, _args: &HookArgs) -> Result<()> {
        self.record("topology_setup");
        if self.fail_topology_setup {
            return Err(Error::hook("topology setup failed"));
        }
        Ok(())
    }

    async fn topology_teardown(&self, _args: &HookArgs) -> Result<()> {
        self.record("topology_teardown");
        Ok(())
    }

    async fn setup(&self, _args: &HookArgs) -> Result<()> {
        self.record("setup");
        Ok(())
    }

    async fn teardown(&self, _args: &HookArgs) -> Result<()> {
        self.record("teardown");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Inventory used by most tests: one `test` domain with a client and two
/// ldap servers, all reachable through the local transport.
pub const INVENTORY: &str = r#"
domains:
- id: test
  hosts:
  - {hostname: client.test, role: client, conn: {type: local}}
  - {hostname: master.ldap.test, role: ldap, conn: {type: local}}
  - {hostname: replica.ldap.test, role: ldap, conn: {type: local}}
"#;

/// Registry whose hosts are [`RecordingHost`]s reporting into `events`.
pub fn recording_registry(events: &Events) -> MultihostRegistry {
    let events = events.clone();
    MultihostRegistry::new().default_domain(
        DomainLayout::generic().default_host(move |base| Ok(RecordingHost::new(base, events.clone()))),
    )
}

/// Loads `yaml` with artifacts and logs stored under `artifacts`.
pub fn load_inventory(
    yaml: &str,
    registry: &MultihostRegistry,
    artifacts: &Path,
    mode: ArtifactsMode,
) -> Arc<MultihostConfig> {
    let settings = ConfigSettings {
        lazy_connect: false,
        artifacts: ArtifactsCollector::new(artifacts, mode, false),
        logger: MultihostLogger::new(),
    };
    Arc::new(MultihostConfig::from_yaml_str(yaml, registry, settings).unwrap())
}

/// Topology with a single `test` domain.
pub fn test_topology(roles: &[(&str, usize)]) -> Topology {
    Topology::new([TopologyDomain::new("test", roles.iter().map(|(r, c)| (r.to_string(), *c)))]).unwrap()
}

/// Mark over the `test` domain with a recording controller and one fixture
/// per role pointing at its first host.
pub fn recording_mark(name: &str, roles: &[(&str, usize)], controller: RecordingController) -> TopologyMark {
    roles.iter().fold(
        TopologyMark::new(name, test_topology(roles)).with_controller(Arc::new(controller)),
        |mark, (role, _)| mark.with_fixture(*role, format!("test.{role}[0]")),
    )
}
