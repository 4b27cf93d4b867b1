//! Running processes.
//!
//! Transports return a [`SpawnedProcess`]: a [`ProcessControl`] driver plus
//! two line channels fed by background reader tasks. [`Process`] wraps it
//! with logging, input handling, timeouts and error reporting.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    ConnectionError, ConnectionResult, LogLevel, ProcessError, ProcessResult, ProcessTimeout,
    RunOptions,
};
use crate::error::Result;
use crate::logging::MultihostLogger;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(0);

/// Transport specific control of a started command.
#[async_trait]
pub trait ProcessControl: Send {
    /// Writes to standard input.
    async fn write_stdin(&mut self, data: &[u8]) -> ConnectionResult<()>;

    /// Closes standard input.
    async fn send_eof(&mut self) -> ConnectionResult<()>;

    /// Delivers a signal to the command.
    async fn send_signal(&mut self, signal: Signal) -> ConnectionResult<()>;

    /// Waits for the command and returns its return code.
    async fn wait(&mut self) -> ConnectionResult<i32>;

    /// Forcibly terminates the command.
    async fn kill(&mut self) -> ConnectionResult<()>;
}

/// A started command as returned by a transport.
pub struct SpawnedProcess {
    /// Driver
    pub control: Box<dyn ProcessControl>,
    /// Standard output lines
    pub stdout: mpsc::UnboundedReceiver<String>,
    /// Standard error lines
    pub stderr: mpsc::UnboundedReceiver<String>,
}

/// Spawns a task that forwards `reader` line by line into `tx`.
///
/// The task ends at end of file or when the receiver is gone.
pub fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

/// Spawns a local child process with piped standard streams.
///
/// Used by transports that drive a local executable (`bash`, `podman`,
/// `docker`).
pub(crate) fn spawn_child(mut cmd: Command) -> ConnectionResult<SpawnedProcess> {
    let mut child = cmd.spawn().map_err(|e| {
        ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
    })?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (err_tx, err_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, out_tx);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, err_tx);
    }
    let stdin = child.stdin.take();

    Ok(SpawnedProcess {
        control: Box::new(ChildControl { child, stdin }),
        stdout: out_rx,
        stderr: err_rx,
    })
}

/// [`ProcessControl`] over a local child process.
struct ChildControl {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Return code of a finished child; signals map to `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn write_stdin(&mut self, data: &[u8]) -> ConnectionResult<()> {
        let stdin = self.stdin.as_mut().ok_or(ConnectionError::ConnectionClosed)?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn send_eof(&mut self) -> ConnectionResult<()> {
        // Dropping the pipe closes it.
        self.stdin.take();
        Ok(())
    }

    async fn send_signal(&mut self, signal: Signal) -> ConnectionResult<()> {
        let pid = self
            .child
            .id()
            .ok_or_else(|| ConnectionError::ExecutionFailed("Process has already exited".to_string()))?;
        let pid = i32::try_from(pid)
            .map_err(|e| ConnectionError::ExecutionFailed(format!("Invalid pid {pid}: {e}")))?;
        signal::kill(Pid::from_raw(pid), signal)
            .map_err(|e| ConnectionError::ExecutionFailed(format!("Failed to send {signal}: {e}")))
    }

    async fn wait(&mut self) -> ConnectionResult<i32> {
        let status = self.child.wait().await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
        })?;
        Ok(exit_code(status))
    }

    async fn kill(&mut self) -> ConnectionResult<()> {
        self.stdin.take();
        self.child.kill().await?;
        Ok(())
    }
}

/// Splits raw chunks into lines, keeping the incomplete tail buffered.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Feeds a chunk and returns every completed line.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Returns the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = std::mem::take(&mut self.pending);
            Some(String::from_utf8_lossy(&line).into_owned())
        }
    }
}

/// A running command.
pub struct Process {
    id: u64,
    host: String,
    command: String,
    options: RunOptions,
    log_level: LogLevel,
    control: Box<dyn ProcessControl>,
    stdout: mpsc::UnboundedReceiver<String>,
    stderr: mpsc::UnboundedReceiver<String>,
    stdout_lines: Vec<String>,
    stderr_lines: Vec<String>,
    eof_sent: bool,
    logger: MultihostLogger,
}

impl Process {
    pub(crate) fn new(
        host: &str,
        command: &str,
        options: RunOptions,
        spawned: SpawnedProcess,
        logger: MultihostLogger,
    ) -> Self {
        Self {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            host: host.to_string(),
            command: command.to_string(),
            log_level: options.log_level.effective(),
            options,
            control: spawned.control,
            stdout: spawned.stdout,
            stderr: spawned.stderr,
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            eof_sent: false,
            logger,
        }
    }

    /// Logs the start and writes the configured input.
    ///
    /// Writing the input counts against the time limit; a command that does
    /// not read its input is killed when it expires.
    pub(crate) async fn start(&mut self) -> Result<()> {
        if matches!(self.log_level, LogLevel::Short | LogLevel::Full) {
            self.logger.info(format!(
                "Running command #{} on {}: {}",
                self.id, self.host, self.command
            ));
            if let Some(ref cwd) = self.options.cwd {
                self.logger.debug(format!("Command #{} working directory: {cwd}", self.id));
            }
        }

        if let Some(input) = self.options.input.clone() {
            let timeout = self.options.timeout;
            let write = self.control.write_stdin(input.as_bytes());
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, write).await {
                    Ok(written) => written?,
                    Err(_) => return Err(self.timed_out().await),
                },
                None => write.await?,
            }
        }

        Ok(())
    }

    /// Process id, unique within this program.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Command as given by the caller.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Reads the next output line; `None` once output is closed.
    pub async fn next_stdout_line(&mut self) -> Option<String> {
        let line = self.stdout.recv().await?;
        self.stdout_lines.push(line.clone());
        Some(line)
    }

    /// Reads the next error output line; `None` once error output is closed.
    pub async fn next_stderr_line(&mut self) -> Option<String> {
        let line = self.stderr.recv().await?;
        self.stderr_lines.push(line.clone());
        Some(line)
    }

    /// Writes to standard input.
    pub async fn write_stdin(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        self.control.write_stdin(data.as_ref()).await?;
        Ok(())
    }

    /// Closes standard input.
    pub async fn send_eof(&mut self) -> Result<()> {
        if !self.eof_sent {
            self.eof_sent = true;
            self.control.send_eof().await?;
        }
        Ok(())
    }

    /// Delivers a signal to the command.
    pub async fn send_signal(&mut self, signal: Signal) -> Result<()> {
        self.control.send_signal(signal).await?;
        Ok(())
    }

    /// Forcibly terminates the command.
    pub async fn kill(mut self) -> Result<()> {
        self.control.kill().await?;
        Ok(())
    }

    /// Closes input and waits for the command to finish.
    ///
    /// With `raise_on_error` a non-zero return code is an error. If the time
    /// limit expires the command is killed and [`ProcessTimeout`] is returned
    /// with the output read so far.
    pub async fn wait(mut self, raise_on_error: bool) -> Result<ProcessResult> {
        self.send_eof().await?;

        let timeout = self.options.timeout;
        let finished = {
            let control = &mut self.control;
            let stdout = &mut self.stdout;
            let stderr = &mut self.stderr;
            let stdout_lines = &mut self.stdout_lines;
            let stderr_lines = &mut self.stderr_lines;

            let run = async move {
                let rc = control.wait().await?;
                while let Some(line) = stdout.recv().await {
                    stdout_lines.push(line);
                }
                while let Some(line) = stderr.recv().await {
                    stderr_lines.push(line);
                }
                Ok::<i32, ConnectionError>(rc)
            };

            match timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };

        let rc = match finished {
            Some(rc) => rc?,
            None => return Err(self.timed_out().await),
        };

        let result = ProcessResult {
            rc,
            stdout_lines: std::mem::take(&mut self.stdout_lines),
            stderr_lines: std::mem::take(&mut self.stderr_lines),
        };
        self.log_result(&result);

        if rc != 0 && raise_on_error {
            return Err(ProcessError {
                id: self.id,
                host: self.host.clone(),
                command: self.command.clone(),
                rc,
                cwd: self.options.cwd.clone(),
                env: self.options.env.clone(),
                input: self.options.input.clone(),
                stdout_lines: result.stdout_lines,
                stderr_lines: result.stderr_lines,
            }
            .into());
        }

        Ok(result)
    }

    async fn timed_out(&mut self) -> crate::error::Error {
        if let Err(e) = self.control.kill().await {
            self.logger
                .warning(format!("Unable to kill command #{} after timeout: {e}", self.id));
        }
        while let Ok(line) = self.stdout.try_recv() {
            self.stdout_lines.push(line);
        }
        while let Ok(line) = self.stderr.try_recv() {
            self.stderr_lines.push(line);
        }

        let timeout = self.options.timeout.unwrap_or_default();
        self.logger.error(format!(
            "Command #{} on {} timed out after {} seconds",
            self.id,
            self.host,
            timeout.as_secs()
        ));

        ProcessTimeout {
            id: self.id,
            host: self.host.clone(),
            command: self.command.clone(),
            timeout,
            stdout_lines: std::mem::take(&mut self.stdout_lines),
            stderr_lines: std::mem::take(&mut self.stderr_lines),
        }
        .into()
    }

    fn log_result(&self, result: &ProcessResult) {
        let show = match self.log_level {
            LogLevel::Silent | LogLevel::Short => false,
            LogLevel::Full => true,
            LogLevel::Error => result.rc != 0,
        };
        if !show {
            return;
        }

        let mut text = format!("Command #{} returned {}", self.id, result.rc);
        if self.log_level == LogLevel::Error {
            text.push_str(&format!("\n  Host: {}\n  Command: {}", self.host, self.command));
        }
        if !result.stdout_lines.is_empty() {
            text.push_str(&format!("\n  Output:\n    {}", result.stdout_lines.join("\n    ")));
        }
        if !result.stderr_lines.is_empty() {
            text.push_str(&format!(
                "\n  Error output:\n    {}",
                result.stderr_lines.join("\n    ")
            ));
        }

        if result.rc == 0 {
            self.logger.info(text);
        } else {
            self.logger.error(text);
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}
