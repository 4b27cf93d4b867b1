//! SSH connection module
//!
//! SSH transport built on the russh crate. Each command gets its own session
//! channel, driven by a background task that forwards output lines and
//! accepts input, end of file and signals.

use async_trait::async_trait;
use nix::sys::signal::Signal;
use russh::client::{Handle, Handler, Msg};
use russh_keys::key::PublicKey;
use russh_keys::load_secret_key;
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::process::LineSplitter;
use super::{
    Connection, ConnectionError, ConnectionResult, ProcessControl, Shell, SpawnedProcess,
    SshConfig,
};
use crate::error::Result;
use crate::logging::MultihostLogger;

/// Time allowed for the TCP connection and handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side handler; test hosts are ephemeral so every host key is
/// accepted and logged.
pub struct ClientHandler {
    host: String,
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key"
        );
        Ok(true)
    }
}

/// SSH connection to one host.
pub struct SshConnection {
    identifier: String,
    config: SshConfig,
    shell: Shell,
    logger: MultihostLogger,
    handle: RwLock<Option<Handle<ClientHandler>>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("identifier", &self.identifier)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("username", &self.config.username)
            .field("connected", &self.connected())
            .finish()
    }
}

impl SshConnection {
    /// Create a new, not yet connected, SSH connection.
    pub fn new(
        identifier: impl Into<String>,
        config: SshConfig,
        shell: Shell,
        logger: MultihostLogger,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            config,
            shell,
            logger,
            handle: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn auth_error(&self, message: impl std::fmt::Display) -> ConnectionError {
        ConnectionError::AuthenticationFailed(format!(
            "Unable to authenticate as \"{}\" at {}:{} over SSH: {}",
            self.config.username, self.config.host, self.config.port, message
        ))
    }

    async fn open_session(&self) -> ConnectionResult<Handle<ClientHandler>> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let socket = tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Timeout(CONNECT_TIMEOUT.as_secs()))?
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
            })?;

        socket.set_nodelay(true).map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
        })?;

        let handler = ClientHandler {
            host: self.config.host.clone(),
        };
        let config = Arc::new(russh::client::Config::default());
        let mut session = russh::client::connect_stream(config, socket, handler)
            .await
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("SSH handshake failed: {}", e))
            })?;

        self.authenticate(&mut session).await?;
        Ok(session)
    }

    async fn authenticate(&self, session: &mut Handle<ClientHandler>) -> ConnectionResult<()> {
        let user = self.config.username.as_str();

        if let Some(ref key) = self.config.private_key {
            let path = shellexpand::tilde(key).into_owned();
            let key_pair = load_secret_key(&path, self.config.private_key_password.as_deref())
                .map_err(|e| self.auth_error(format!("unable to load key {path}: {e}")))?;
            let authenticated = session
                .authenticate_publickey(user, Arc::new(key_pair))
                .await
                .map_err(|e| self.auth_error(e))?;
            if authenticated {
                return Ok(());
            }
            if self.config.password.is_none() {
                return Err(self.auth_error("public key was rejected"));
            }
        }

        if let Some(ref password) = self.config.password {
            let authenticated = session
                .authenticate_password(user, password)
                .await
                .map_err(|e| self.auth_error(e))?;
            if authenticated {
                return Ok(());
            }
        }

        Err(self.auth_error("authentication was rejected"))
    }

    fn remote_command(&self, command_line: &str) -> String {
        let mut parts: Vec<String> = self.shell.argv().iter().map(|s| (*s).to_string()).collect();
        parts.push(self.shell.quote(command_line));
        parts.join(" ")
    }
}

#[async_trait]
impl Connection for SshConnection {
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
        let mut guard = self.handle.write().await;
        if guard.is_some() {
            return Ok(());
        }

        self.logger.info(format!(
            "Opening SSH connection to {}:{} as {}",
            self.config.host, self.config.port, self.config.username
        ));
        let session = self.open_session().await?;
        *guard = Some(session);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.handle.write().await;
        if let Some(handle) = guard.take() {
            self.logger.info(format!("Closing SSH connection to {}", self.config.host));
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                warn!(host = %self.config.host, error = %e, "Error while closing SSH connection");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn spawn(&self, command_line: &str) -> ConnectionResult<SpawnedProcess> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(ConnectionError::ConnectionClosed)?;

        let channel = handle.channel_open_session().await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to open channel: {}", e))
        })?;
        drop(guard);

        let remote = self.remote_command(command_line);
        trace!(host = %self.identifier, command = %remote, "SSH command line");
        channel.exec(true, remote).await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to execute command: {}", e))
        })?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let task = tokio::spawn(drive_channel(channel, cmd_rx, out_tx, err_tx, exit_tx));

        Ok(SpawnedProcess {
            control: Box::new(SshControl {
                commands: cmd_tx,
                exit: Some(exit_rx),
                task,
            }),
            stdout: out_rx,
            stderr: err_rx,
        })
    }
}

enum ChannelCommand {
    Data(Vec<u8>),
    Eof,
    Signal(Sig),
    Close,
}

async fn drive_channel(
    mut channel: Channel<Msg>,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    stdout: mpsc::UnboundedSender<String>,
    stderr: mpsc::UnboundedSender<String>,
    exit: oneshot::Sender<i32>,
) {
    let mut out = LineSplitter::default();
    let mut err = LineSplitter::default();
    let mut rc: Option<i32> = None;
    let mut commands_open = true;

    loop {
        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(ChannelCommand::Data(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        warn!(error = %e, "Failed to write to SSH channel");
                    }
                }
                Some(ChannelCommand::Eof) => {
                    let _ = channel.eof().await;
                }
                Some(ChannelCommand::Signal(sig)) => {
                    let _ = channel.signal(sig).await;
                }
                Some(ChannelCommand::Close) => {
                    let _ = channel.close().await;
                    break;
                }
                None => commands_open = false,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    for line in out.push(data) {
                        let _ = stdout.send(line);
                    }
                }
                // Extended data type 1 is stderr
                Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                    for line in err.push(data) {
                        let _ = stderr.send(line);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    rc = Some(i32::try_from(exit_status).unwrap_or(i32::MAX));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    rc = Some(128 + signal_number(&signal_name));
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    if let Some(line) = out.finish() {
        let _ = stdout.send(line);
    }
    if let Some(line) = err.finish() {
        let _ = stderr.send(line);
    }
    let _ = exit.send(rc.unwrap_or(-1));
}

fn signal_number(sig: &Sig) -> i32 {
    match sig {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        Sig::Custom(_) => 127,
    }
}

fn to_ssh_signal(signal: Signal) -> Sig {
    match signal {
        Signal::SIGHUP => Sig::HUP,
        Signal::SIGINT => Sig::INT,
        Signal::SIGQUIT => Sig::QUIT,
        Signal::SIGILL => Sig::ILL,
        Signal::SIGABRT => Sig::ABRT,
        Signal::SIGFPE => Sig::FPE,
        Signal::SIGKILL => Sig::KILL,
        Signal::SIGUSR1 => Sig::USR1,
        Signal::SIGSEGV => Sig::SEGV,
        Signal::SIGPIPE => Sig::PIPE,
        Signal::SIGALRM => Sig::ALRM,
        Signal::SIGTERM => Sig::TERM,
        other => Sig::Custom(other.as_str().trim_start_matches("SIG").to_string()),
    }
}

struct SshControl {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    exit: Option<oneshot::Receiver<i32>>,
    task: JoinHandle<()>,
}

impl SshControl {
    fn send(&self, command: ChannelCommand) -> ConnectionResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ConnectionError::ConnectionClosed)
    }
}

#[async_trait]
impl ProcessControl for SshControl {
    async fn write_stdin(&mut self, data: &[u8]) -> ConnectionResult<()> {
        self.send(ChannelCommand::Data(data.to_vec()))
    }

    async fn send_eof(&mut self) -> ConnectionResult<()> {
        self.send(ChannelCommand::Eof)
    }

    async fn send_signal(&mut self, signal: Signal) -> ConnectionResult<()> {
        self.send(ChannelCommand::Signal(to_ssh_signal(signal)))
    }

    async fn wait(&mut self) -> ConnectionResult<i32> {
        let exit = self.exit.take().ok_or(ConnectionError::ConnectionClosed)?;
        exit.await.map_err(|_| ConnectionError::ConnectionClosed)
    }

    async fn kill(&mut self) -> ConnectionResult<()> {
        let _ = self.send(ChannelCommand::Signal(Sig::KILL));
        let _ = self.send(ChannelCommand::Close);
        if tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DEFAULT_SSH_PASSWORD;

    fn connection() -> SshConnection {
        SshConnection::new(
            "client.test",
            SshConfig {
                host: "client.test".to_string(),
                port: 22,
                username: "root".to_string(),
                password: Some(DEFAULT_SSH_PASSWORD.to_string()),
                private_key: None,
                private_key_password: None,
            },
            Shell::Bash,
            MultihostLogger::new(),
        )
    }

    #[test]
    fn test_remote_command_quotes_script() {
        let conn = connection();
        assert_eq!(
            conn.remote_command("echo 'hi'"),
            "/bin/bash -c 'echo '\\''hi'\\'''"
        );
    }

    #[test]
    fn test_auth_error_message() {
        let conn = connection();
        assert_eq!(
            conn.auth_error("denied").to_string(),
            "Unable to authenticate as \"root\" at client.test:22 over SSH: denied"
        );
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(signal_number(&to_ssh_signal(Signal::SIGTERM)), 15);
        assert!(matches!(to_ssh_signal(Signal::SIGUSR2), Sig::Custom(ref s) if s == "USR2"));
    }

    #[tokio::test]
    async fn test_spawn_requires_connection() {
        let conn = connection();
        assert!(!conn.connected());
        assert!(matches!(
            conn.spawn("true").await,
            Err(ConnectionError::ConnectionClosed)
        ));
    }
}
