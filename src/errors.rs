//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared result type.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Error enumeration covering every failure mode of the connectivity layer.
///
/// Three variants ([`ProcessExited`](Self::ProcessExited),
/// [`KillTimeout`](Self::KillTimeout) and [`InvalidBios`](Self::InvalidBios))
/// render fixed messages that external tooling greps for. Their text must not
/// change. All other variants render as `<category>: <message>`.
#[derive(Debug)]
pub enum LinkError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or process I/O failure.
    Io(String),
    /// Control-channel dial failure (transient, retried by callers).
    Dial(String),
    /// Remote command execution failure on an established session.
    Exec(String),
    /// Cached image lookup failure.
    Image(String),
    /// The caller's cancellation token fired before the operation finished.
    Cancelled(String),
    /// The boot process exited before its address accepted a connection.
    ProcessExited {
        /// Address that was being probed.
        address: String,
        /// Raw platform wait status of the exited process.
        wstatus: i32,
    },
    /// Reboot recovery ran past the kill timeout.
    KillTimeout {
        /// Job or system label the reboot was requested for.
        job: String,
    },
    /// The system's firmware setting is neither empty nor `uefi`.
    InvalidBios(String),
}

impl Display for LinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Dial(msg) => write!(f, "dial: {msg}"),
            Self::Exec(msg) => write!(f, "exec: {msg}"),
            Self::Image(msg) => write!(f, "image: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::ProcessExited { address, wstatus } => write!(
                f,
                "process exited unexpectedly while waiting for address {address} (wstatus={wstatus})"
            ),
            Self::KillTimeout { job } => {
                write!(f, "kill-timeout reached after {job} reboot request")
            }
            Self::InvalidBios(value) => write!(
                f,
                "cannot set bios to \"{value}\", only \"uefi\" or unset are supported"
            ),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<toml::de::Error> for LinkError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
