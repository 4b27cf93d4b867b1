//! Container connection module
//!
//! Runs commands inside a podman or docker container through the engine's
//! command line interface, optionally through `sudo`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, trace};

use super::process::spawn_child;
use super::{
    Connection, ConnectionError, ConnectionResult, ContainerConfig, LogLevel, Process, RunOptions,
    Shell, SpawnedProcess,
};
use crate::error::Result;
use crate::logging::MultihostLogger;

/// Connection to a podman or docker container.
#[derive(Debug)]
pub struct ContainerConnection {
    identifier: String,
    config: ContainerConfig,
    shell: Shell,
    logger: MultihostLogger,
    connected: AtomicBool,
    connect_lock: Mutex<()>,
}

impl ContainerConnection {
    /// Create a new container connection.
    pub fn new(
        identifier: impl Into<String>,
        config: ContainerConfig,
        shell: Shell,
        logger: MultihostLogger,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            config,
            shell,
            logger,
            connected: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
        }
    }

    /// Connection parameters.
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Argument vector that runs `command_line` inside the container.
    pub fn build_argv(&self, command_line: &str) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();

        if self.config.sudo {
            argv.extend(["sudo", "-k", "-S", "--prompt="].map(String::from));
        }

        argv.push(self.config.engine.program().to_string());
        argv.push("exec".to_string());
        argv.push("--interactive".to_string());
        argv.push("--user".to_string());
        argv.push(self.config.user.clone());
        argv.push(self.config.container.clone());
        argv.extend(self.shell.argv().iter().map(|s| (*s).to_string()));
        argv.push(command_line.to_string());
        argv
    }

    fn build_command(&self, command_line: &str) -> Command {
        let argv = self.build_argv(command_line);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn connect_error(&self) -> ConnectionError {
        ConnectionError::ConnectionFailed(format!(
            "Unable to connect to {} container {}, user={}, sudo={}",
            self.config.engine.program(),
            self.config.container,
            self.config.user,
            self.config.sudo
        ))
    }
}

#[async_trait]
impl Connection for ContainerConnection {
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
        if self.connected() {
            return Ok(());
        }

        which::which(self.config.engine.program()).map_err(|e| {
            ConnectionError::ConnectionFailed(format!(
                "{} is not available: {e}",
                self.config.engine.program()
            ))
        })?;

        debug!(host = %self.identifier, container = %self.config.container, "Connecting to container");
        let spawned = self.spawn("exit 0").await?;
        let options = RunOptions::new().log_level(LogLevel::Error).raise_on_error(false);
        let mut process = Process::new(&self.identifier, "exit 0", options, spawned, self.logger.clone());
        process.start().await?;
        let result = process.wait(false).await?;

        if result.rc != 0 {
            return Err(self.connect_error().into());
        }

        let _guard = self.connect_lock.lock();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn spawn(&self, command_line: &str) -> ConnectionResult<SpawnedProcess> {
        trace!(command = %command_line, container = %self.config.container, "Container command line");
        let mut spawned = spawn_child(self.build_command(command_line))?;

        if self.config.sudo {
            let password = self.config.sudo_password.clone().unwrap_or_default();
            spawned
                .control
                .write_stdin(format!("{password}\n").as_bytes())
                .await?;
        }

        Ok(spawned)
    }
}
