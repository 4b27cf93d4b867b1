//! Remote command execution.
//!
//! Every host owns one [`Connection`]. Transports implement the low level
//! [`Connection::spawn`] call; running scripts, quoting argument vectors,
//! logging, timeouts and error reporting are provided on top of it.
//!
//! # Transports
//!
//! - `ssh`: [`ssh::SshConnection`] (feature `russh`, enabled by default)
//! - `podman` / `docker`: [`container::ContainerConnection`]
//! - `local`: [`local::LocalConnection`] (feature `local`)
//!
//! # Example
//!
//! ```rust,ignore
//! use multihost::connection::{Connection, RunOptions};
//!
//! let result = conn.run("hostname -f", RunOptions::default()).await?;
//! println!("{}", result.stdout());
//!
//! let result = conn
//!     .exec(&["cat", "/etc/hosts"], RunOptions::new().raise_on_error(false))
//!     .await?;
//! ```

pub mod container;
#[cfg(feature = "local")]
pub mod local;
pub mod process;
#[cfg(feature = "russh")]
pub mod ssh;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use process::{Process, ProcessControl, SpawnedProcess};

use crate::error::{Error, Result};
use crate::inventory::validate::{require_str, ConfigValue};
use crate::logging::MultihostLogger;

/// Default time a command may run before it is closed.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors that can occur at the transport level.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish initial connection to the host.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("{0}")]
    AuthenticationFailed(String),

    /// Command could not be started or driven (not a non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// Transport configuration is invalid or incomplete.
    #[error("{0}")]
    InvalidConfig(String),

    /// SSH protocol error.
    #[error("SSH error: {0}")]
    SshError(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Connection was closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The requested operation is not supported by this transport.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Result type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

// ============================================================================
// Shell
// ============================================================================

/// Shell that interprets commands on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    /// `/bin/bash`, used by Linux hosts
    Bash,
    /// `powershell`, used by Windows hosts
    Powershell,
}

impl Shell {
    /// Shell name.
    pub fn name(&self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Powershell => "powershell",
        }
    }

    /// Program and arguments that run a script passed as the last argument.
    pub fn argv(&self) -> &'static [&'static str] {
        match self {
            Shell::Bash => &["/bin/bash", "-c"],
            Shell::Powershell => &["powershell", "-NonInteractive", "-Command"],
        }
    }

    /// Quotes a single argument.
    pub fn quote(&self, value: &str) -> String {
        match self {
            Shell::Bash => format!("'{}'", value.replace('\'', "'\\''")),
            Shell::Powershell => format!("'{}'", value.replace('\'', "''")),
        }
    }

    /// Joins an argument vector into one command.
    pub fn join(&self, argv: &[&str]) -> String {
        match self {
            Shell::Bash => shell_words::join(argv),
            Shell::Powershell => {
                let quoted: Vec<String> = argv.iter().map(|a| self.quote(a)).collect();
                format!("& {}", quoted.join(" "))
            }
        }
    }

    /// Builds the full command line: environment, working directory, script.
    pub fn build_command_line(
        &self,
        script: &str,
        cwd: Option<&str>,
        env: &IndexMap<String, String>,
    ) -> String {
        let mut out = String::new();

        for (key, value) in env {
            match self {
                Shell::Bash => out.push_str(&format!("export {key}={}\n", self.quote(value))),
                Shell::Powershell => {
                    out.push_str(&format!("$env:{key} = {}\n", self.quote(value)));
                }
            }
        }

        if let Some(cwd) = cwd {
            out.push_str(&format!("cd {}\n", self.quote(cwd)));
        }

        if !out.is_empty() {
            out.push('\n');
        }

        out.push_str(script);
        out
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Run options and results
// ============================================================================

/// How much of a command is logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Nothing is logged.
    Silent,
    /// Only the command is logged.
    Short,
    /// Command and output are logged.
    #[default]
    Full,
    /// Command and output are logged only if it fails.
    Error,
}

impl LogLevel {
    /// Level to use: `MH_SSH_DEBUG=yes` forces [`LogLevel::Full`].
    pub fn effective(self) -> Self {
        match std::env::var("MH_SSH_DEBUG").ok().as_deref() {
            Some("yes" | "1" | "true") => LogLevel::Full,
            _ => self,
        }
    }
}

/// Options for running a command.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Working directory
    pub cwd: Option<String>,
    /// Additional environment variables
    pub env: IndexMap<String, String>,
    /// Data written to standard input after start
    pub input: Option<String>,
    /// Logging verbosity
    pub log_level: LogLevel,
    /// Return an error on non-zero exit code
    pub raise_on_error: bool,
    /// Time limit, `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: IndexMap::new(),
            input: None,
            log_level: LogLevel::default(),
            raise_on_error: true,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl RunOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set data for standard input.
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Return an error on non-zero exit code.
    pub fn raise_on_error(mut self, raise: bool) -> Self {
        self.raise_on_error = raise;
        self
    }

    /// Set the time limit.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// Return code
    pub rc: i32,
    /// Standard output, one entry per line
    pub stdout_lines: Vec<String>,
    /// Standard error output, one entry per line
    pub stderr_lines: Vec<String>,
}

impl ProcessResult {
    /// Standard output joined with newlines.
    pub fn stdout(&self) -> String {
        self.stdout_lines.join("\n")
    }

    /// Standard error output joined with newlines.
    pub fn stderr(&self) -> String {
        self.stderr_lines.join("\n")
    }

    /// True if the return code is zero.
    pub fn success(&self) -> bool {
        self.rc == 0
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, title: &str, lines: &[String]) -> fmt::Result {
    if lines.is_empty() {
        return Ok(());
    }
    write!(f, "\n  {title}:")?;
    for line in lines {
        write!(f, "\n    {line}")?;
    }
    Ok(())
}

/// A command exited with a non-zero return code.
#[derive(Debug, Clone)]
pub struct ProcessError {
    /// Process id within this test run
    pub id: u64,
    /// Host the command ran on
    pub host: String,
    /// Command as given by the caller
    pub command: String,
    /// Return code
    pub rc: i32,
    /// Working directory
    pub cwd: Option<String>,
    /// Additional environment
    pub env: IndexMap<String, String>,
    /// Standard input
    pub input: Option<String>,
    /// Captured standard output lines
    pub stdout_lines: Vec<String>,
    /// Captured standard error lines
    pub stderr_lines: Vec<String>,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command #{} exited with return code {}", self.id, self.rc)?;
        write_block(f, "Host", &[self.host.clone()])?;
        write_block(f, "Command", &self.command.lines().map(String::from).collect::<Vec<_>>())?;
        if let Some(ref cwd) = self.cwd {
            write_block(f, "CWD", &[cwd.clone()])?;
        }
        let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write_block(f, "Env", &env)?;
        if let Some(ref input) = self.input {
            write_block(f, "Input", &input.lines().map(String::from).collect::<Vec<_>>())?;
        }
        write_block(f, "Output", &self.stdout_lines)?;
        write_block(f, "Error output", &self.stderr_lines)
    }
}

impl std::error::Error for ProcessError {}

/// A command did not finish within its time limit and was closed.
#[derive(Debug, Clone, Error)]
#[error("Command #{id} on {host} timed out after {} seconds: {command}", .timeout.as_secs())]
pub struct ProcessTimeout {
    /// Process id within this test run
    pub id: u64,
    /// Host the command ran on
    pub host: String,
    /// Command as given by the caller
    pub command: String,
    /// Exceeded limit
    pub timeout: Duration,
    /// Output captured before the limit
    pub stdout_lines: Vec<String>,
    /// Error output captured before the limit
    pub stderr_lines: Vec<String>,
}

// ============================================================================
// Connection trait
// ============================================================================

/// A connection to one host.
///
/// `connect` and `disconnect` are idempotent.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Identifier used in logs, usually the hostname.
    fn identifier(&self) -> &str;

    /// Shell used to interpret commands.
    fn shell(&self) -> Shell;

    /// Logger that receives command records.
    fn logger(&self) -> &MultihostLogger;

    /// True if [`Connection::connect`] succeeded and no disconnect followed.
    fn connected(&self) -> bool;

    /// Opens the connection.
    async fn connect(&self) -> Result<()>;

    /// Closes the connection.
    async fn disconnect(&self) -> Result<()>;

    /// Starts `command_line` with the connection's shell.
    async fn spawn(&self, command_line: &str) -> ConnectionResult<SpawnedProcess>;

    /// Starts a script and returns the live process.
    async fn async_run(&self, script: &str, options: RunOptions) -> Result<Process> {
        if !self.connected() {
            self.connect().await?;
        }

        let line = self
            .shell()
            .build_command_line(script, options.cwd.as_deref(), &options.env);
        let spawned = self.spawn(&line).await?;
        let mut process = Process::new(
            self.identifier(),
            script,
            options,
            spawned,
            self.logger().clone(),
        );
        process.start().await?;
        Ok(process)
    }

    /// Runs a script and waits for it.
    async fn run(&self, script: &str, options: RunOptions) -> Result<ProcessResult> {
        let raise_on_error = options.raise_on_error;
        let process = self.async_run(script, options).await?;
        process.wait(raise_on_error).await
    }

    /// Starts an argument vector and returns the live process.
    async fn async_exec(&self, argv: &[&str], options: RunOptions) -> Result<Process> {
        let script = self.shell().join(argv);
        self.async_run(&script, options).await
    }

    /// Runs an argument vector and waits for it.
    async fn exec(&self, argv: &[&str], options: RunOptions) -> Result<ProcessResult> {
        let script = self.shell().join(argv);
        self.run(&script, options).await
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Default password used when neither a password nor a key is configured.
pub const DEFAULT_SSH_PASSWORD: &str = "Secret123";

/// Container engine used by [`container::ContainerConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerEngine {
    /// podman
    Podman,
    /// docker
    Docker,
}

impl ContainerEngine {
    /// Engine executable name.
    pub fn program(&self) -> &'static str {
        match self {
            ContainerEngine::Podman => "podman",
            ContainerEngine::Docker => "docker",
        }
    }
}

/// SSH transport parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    /// Address to connect to
    pub host: String,
    /// Port
    pub port: u16,
    /// User name
    pub username: String,
    /// Password
    pub password: Option<String>,
    /// Path to a private key
    pub private_key: Option<String>,
    /// Passphrase of the private key
    pub private_key_password: Option<String>,
}

/// Container transport parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Engine
    pub engine: ContainerEngine,
    /// Container name or id
    pub container: String,
    /// User inside the container
    pub user: String,
    /// Run the engine through sudo
    pub sudo: bool,
    /// Password written to sudo
    pub sudo_password: Option<String>,
}

/// Parsed `conn` section of a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConfig {
    /// `type: ssh`
    Ssh(SshConfig),
    /// `type: podman` or `type: docker`
    Container(ContainerConfig),
    /// `type: local`
    Local,
}

impl ConnectionConfig {
    /// Parses a `conn` section; a missing section means SSH to `hostname`.
    pub fn from_value(conn: Option<&serde_json::Value>, hostname: &str) -> Result<Self> {
        let empty = serde_json::Value::Object(serde_json::Map::new());
        let conn = conn.unwrap_or(&empty);
        let kind = conn.opt_str("type")?.unwrap_or_else(|| "ssh".to_string());

        match kind.as_str() {
            "ssh" => {
                let password = conn.opt_str("password")?;
                let private_key = conn.opt_str("private_key")?;
                let password = match (&password, &private_key) {
                    (None, None) => Some(DEFAULT_SSH_PASSWORD.to_string()),
                    _ => password,
                };
                let port = match conn.get("port") {
                    Some(v) => v
                        .as_u64()
                        .and_then(|p| u16::try_from(p).ok())
                        .ok_or_else(|| Error::InvalidValue(format!("Invalid SSH port: {v}")))?,
                    None => 22,
                };

                Ok(ConnectionConfig::Ssh(SshConfig {
                    host: conn.opt_str("host")?.unwrap_or_else(|| hostname.to_string()),
                    port,
                    username: conn.opt_str("username")?.unwrap_or_else(|| "root".to_string()),
                    password,
                    private_key,
                    private_key_password: conn.opt_str("private_key_password")?,
                }))
            }
            "podman" | "docker" => {
                let engine = if kind == "podman" {
                    ContainerEngine::Podman
                } else {
                    ContainerEngine::Docker
                };
                let container = require_str(conn, "container", "connection")
                    .map_err(|_| Error::InvalidValue("Container name is not set!".to_string()))?;

                Ok(ConnectionConfig::Container(ContainerConfig {
                    engine,
                    container,
                    user: conn.opt_str("user")?.unwrap_or_else(|| "root".to_string()),
                    sudo: conn.get("sudo").and_then(serde_json::Value::as_bool).unwrap_or(false),
                    sudo_password: conn.opt_str("sudo_password")?,
                }))
            }
            "local" => Ok(ConnectionConfig::Local),
            other => Err(Error::InvalidValue(format!(
                "Unsupported connection type {other}, expected ssh, podman, docker or local!"
            ))),
        }
    }

    /// Creates the transport described by this configuration.
    pub fn build(
        &self,
        hostname: &str,
        shell: Shell,
        logger: MultihostLogger,
    ) -> Result<Arc<dyn Connection>> {
        match self {
            #[cfg(feature = "russh")]
            ConnectionConfig::Ssh(config) => Ok(Arc::new(ssh::SshConnection::new(
                hostname,
                config.clone(),
                shell,
                logger,
            ))),
            #[cfg(not(feature = "russh"))]
            ConnectionConfig::Ssh(_) => Err(Error::NotImplemented(
                "SSH transport requires the \"russh\" feature".to_string(),
            )),
            ConnectionConfig::Container(config) => Ok(Arc::new(
                container::ContainerConnection::new(hostname, config.clone(), shell, logger),
            )),
            #[cfg(feature = "local")]
            ConnectionConfig::Local => Ok(Arc::new(local::LocalConnection::new(hostname, shell, logger))),
            #[cfg(not(feature = "local"))]
            ConnectionConfig::Local => Err(Error::NotImplemented(
                "Local transport requires the \"local\" feature".to_string(),
            )),
        }
    }
}
