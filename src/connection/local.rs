//! Local connection module
//!
//! Runs commands on the machine executing the tests. Used for self tests and
//! for inventories that describe the local host.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, trace};

use super::process::spawn_child;
use super::{Connection, ConnectionResult, Shell, SpawnedProcess};
use crate::error::Result;
use crate::logging::MultihostLogger;

/// Local connection for executing commands on the current host
#[derive(Debug)]
pub struct LocalConnection {
    identifier: String,
    shell: Shell,
    logger: MultihostLogger,
    connected: AtomicBool,
}

impl LocalConnection {
    /// Create a new local connection
    pub fn new(identifier: impl Into<String>, shell: Shell, logger: MultihostLogger) -> Self {
        Self {
            identifier: identifier.into(),
            shell,
            logger,
            connected: AtomicBool::new(false),
        }
    }

    /// Create a local connection named after this machine
    pub fn localhost(logger: MultihostLogger) -> Self {
        let identifier = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self::new(identifier, Shell::Bash, logger)
    }

    fn build_command(&self, command_line: &str) -> Command {
        let argv = self.shell.argv();
        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..])
            .arg(command_line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn shell(&self) -> Shell {
        self.shell
    }

    fn logger(&self) -> &MultihostLogger {
        &self.logger
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn spawn(&self, command_line: &str) -> ConnectionResult<SpawnedProcess> {
        debug!(host = %self.identifier, "Spawning local command");
        trace!(command = %command_line, "Local command line");

        spawn_child(self.build_command(command_line))
    }
}
