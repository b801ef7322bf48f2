//! Control-channel dial primitive.
//!
//! The [`Dialer`] trait is the seam between the reboot state machine in
//! [`client`](super::client) and the transport that actually reaches a
//! system. Production code uses [`SshDialer`], which runs an OpenSSH
//! control master per session; tests inject fakes that fail or stall on
//! demand.

use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{LinkError, Result};

/// Future returned by [`Dialer::dial`].
pub type DialFuture<'a> = Pin<Box<dyn Future<Output = Result<Box<dyn Session>>> + Send + 'a>>;

/// Future returned by [`Session::run`].
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

/// Connection settings handed to every dial attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    /// Remote login user.
    pub user: String,
    /// Private key used for authentication; `None` uses the agent/defaults.
    pub identity_file: Option<PathBuf>,
    /// Upper bound for a single connection attempt.
    pub connect_timeout: Duration,
    /// Directory holding control sockets.
    pub control_dir: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".into(),
            identity_file: None,
            connect_timeout: Duration::from_secs(5),
            control_dir: std::env::temp_dir(),
        }
    }
}

/// An established control-channel session.
///
/// Dropping the session tears the connection down.
pub trait Session: Send + Sync {
    /// Run a shell command on the remote system and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Exec` if the command cannot be started or exits
    /// unsuccessfully.
    fn run<'a>(&'a self, command: &'a str) -> RunFuture<'a>;
}

/// Produces control-channel sessions for an address.
pub trait Dialer: Send + Sync {
    /// Attempt one connection to `address` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Dial` when the system cannot be reached. Callers
    /// treat every dial error as transient.
    fn dial<'a>(&'a self, address: &'a str, config: &'a SshConfig) -> DialFuture<'a>;
}

/// Interval between `-O check` probes while a master is starting.
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Dials systems by starting an OpenSSH control master.
#[derive(Debug, Clone)]
pub struct SshDialer {
    program: String,
}

impl Default for SshDialer {
    fn default() -> Self {
        Self {
            program: "ssh".into(),
        }
    }
}

impl SshDialer {
    /// Dialer using the `ssh` binary found on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dialer using a specific OpenSSH client binary.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn connect(&self, address: &str, config: &SshConfig) -> Result<SshSession> {
        let (host, port) = split_address(address)?;
        let destination = format!("{}@{host}", config.user);
        let socket = config
            .control_dir
            .join(format!("vmlink-{}.sock", Uuid::new_v4().simple()));

        let mut cmd = Command::new(&self.program);
        cmd.args(common_options(config))
            .args(["-M", "-N", "-p", port])
            .arg("-S")
            .arg(&socket)
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let master = cmd
            .spawn()
            .map_err(|err| LinkError::Dial(format!("failed to spawn {}: {err}", self.program)))?;

        let mut session = SshSession {
            program: self.program.clone(),
            options: client_options(config),
            destination,
            port: port.to_owned(),
            socket,
            master: Mutex::new(master),
        };

        let deadline = Instant::now() + config.connect_timeout + CHECK_INTERVAL;
        loop {
            let exited = session
                .master
                .get_mut()
                .try_wait()
                .map_err(|err| LinkError::Dial(format!("cannot poll ssh to {address}: {err}")))?;
            if let Some(status) = exited {
                return Err(LinkError::Dial(format!(
                    "ssh to {address} exited with {status}"
                )));
            }
            if session.check().await {
                debug!(address, socket = %session.socket.display(), "control master ready");
                return Ok(session);
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Dial(format!(
                    "ssh to {address} not ready after {}s",
                    config.connect_timeout.as_secs()
                )));
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }
}

impl Dialer for SshDialer {
    fn dial<'a>(&'a self, address: &'a str, config: &'a SshConfig) -> DialFuture<'a> {
        Box::pin(async move {
            let session = self.connect(address, config).await?;
            Ok(Box::new(session) as Box<dyn Session>)
        })
    }
}

/// Session multiplexed over an OpenSSH control socket.
///
/// The master process is started with `kill_on_drop(true)`, so dropping the
/// session terminates the connection and no other holder can keep using it.
pub struct SshSession {
    program: String,
    options: Vec<String>,
    destination: String,
    port: String,
    socket: PathBuf,
    master: Mutex<Child>,
}

impl Debug for SshSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("destination", &self.destination)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl SshSession {
    fn client(&self, options: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.options)
            .arg("-S")
            .arg(&self.socket)
            .args(["-p", self.port.as_str()])
            .args(options)
            .arg(&self.destination)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn check(&self) -> bool {
        let mut cmd = self.client(&["-O", "check"]);
        cmd.stdout(Stdio::null())
            .stderr(Stdio::null());
        matches!(cmd.status().await, Ok(status) if status.success())
    }
}

impl Session for SshSession {
    fn run<'a>(&'a self, command: &'a str) -> RunFuture<'a> {
        Box::pin(async move {
            let mut cmd = self.client(&[]);
            cmd.arg(command);
            let output = cmd
                .output()
                .await
                .map_err(|err| LinkError::Exec(format!("failed to start ssh: {err}")))?;
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                Err(LinkError::Exec(format!(
                    "{command:?} on {} failed ({}): {}",
                    self.destination,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        })
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // A killed master leaves its socket behind.
        let _ = std::fs::remove_file(&self.socket);
    }
}

fn common_options(config: &SshConfig) -> Vec<String> {
    let mut opts = vec![
        "-o".to_owned(),
        "BatchMode=yes".to_owned(),
        "-o".to_owned(),
        "StrictHostKeyChecking=no".to_owned(),
        "-o".to_owned(),
        "UserKnownHostsFile=/dev/null".to_owned(),
        "-o".to_owned(),
        format!("ConnectTimeout={}", config.connect_timeout.as_secs().max(1)),
    ];
    if let Some(identity) = &config.identity_file {
        opts.push("-i".to_owned());
        opts.push(identity.display().to_string());
    }
    opts
}

/// Options for commands sent through the control socket. A dead master must
/// fail the command, not fall back to a fresh interactive login.
fn client_options(config: &SshConfig) -> Vec<String> {
    let mut opts = common_options(config);
    opts.push("-o".to_owned());
    opts.push("ControlMaster=no".to_owned());
    opts
}

/// Split `host:port` (or `[v6]:port`) into its parts.
fn split_address(address: &str) -> Result<(&str, &str)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| LinkError::Dial(format!("address {address} has no port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(LinkError::Dial(format!("invalid address {address}")));
    }
    Ok((host, port))
}
