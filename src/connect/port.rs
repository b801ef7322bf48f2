//! Port liveness waiter.
//!
//! [`wait_port_up`] blocks until a TCP endpoint accepts a connection. While
//! probing it races two other signals: the caller's cancellation token and,
//! when supplied, the exit of the boot process that is expected to bring the
//! endpoint up. A boot process that dies early (bad firmware path, missing
//! image, KVM unavailable) is reported at once with its raw wait status
//! instead of after a long connect timeout.
//!
//! The wait is one-shot: the first signal to fire decides the result and the
//! probe loop is dropped with it.

use std::fmt::Display;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::{LinkError, Result};

/// Per-attempt connect timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between failed connect attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How often the boot process is checked for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timing knobs for the probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortWaitOptions {
    /// Upper bound for a single connect attempt.
    pub dial_timeout: Duration,
    /// Pause between failed attempts.
    pub retry_interval: Duration,
}

impl Default for PortWaitOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DIAL_TIMEOUT,
            retry_interval: RETRY_INTERVAL,
        }
    }
}

/// Wait until `address` accepts a TCP connection using default timings.
///
/// See [`wait_port_up_with`].
///
/// # Errors
///
/// Same as [`wait_port_up_with`].
pub async fn wait_port_up(
    cancel: &CancellationToken,
    system: &impl Display,
    address: &str,
    process: Option<&mut Child>,
) -> Result<()> {
    wait_port_up_with(cancel, system, address, process, PortWaitOptions::default()).await
}

/// Wait until `address` accepts a TCP connection.
///
/// The probe connection is closed as soon as it is established. The boot
/// process, if any, is only observed through `try_wait`: it is never killed
/// and its stdio handles are left in place.
///
/// # Errors
///
/// - `LinkError::Cancelled` if `cancel` fires first.
/// - `LinkError::ProcessExited` if `process` exits before the port is up.
/// - `LinkError::Io` if waiting on `process` fails.
pub async fn wait_port_up_with(
    cancel: &CancellationToken,
    system: &impl Display,
    address: &str,
    process: Option<&mut Child>,
    options: PortWaitOptions,
) -> Result<()> {
    let span = info_span!("wait_port_up", system = %system, address);

    async move {
        let exited = async move {
            match process {
                Some(child) => watch_exit(child).await,
                None => std::future::pending::<std::io::Result<ExitStatus>>().await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LinkError::Cancelled(format!(
                "stopped waiting for {system} at {address}"
            ))),
            status = exited => {
                let status = status.map_err(|err| {
                    LinkError::Io(format!("cannot wait for {system} boot process: {err}"))
                })?;
                Err(LinkError::ProcessExited {
                    address: address.to_owned(),
                    wstatus: raw_wait_status(status),
                })
            }
            attempts = poll_until_connected(address, options) => {
                info!(attempts, "port is up");
                Ok(())
            }
        }
    }
    .instrument(span)
    .await
}

/// Poll `child` until it exits. Unlike `Child::wait` this leaves the
/// child's stdin open.
async fn watch_exit(child: &mut Child) -> std::io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Probe `address` until a connection succeeds; returns the attempt count.
async fn poll_until_connected(address: &str, options: PortWaitOptions) -> u32 {
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match tokio::time::timeout(options.dial_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                return attempts;
            }
            Ok(Err(err)) => debug!(attempts, %err, "port not reachable yet"),
            Err(_) => debug!(attempts, "connect attempt timed out"),
        }
        tokio::time::sleep(options.retry_interval).await;
    }
}

#[cfg(unix)]
fn raw_wait_status(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.into_raw()
}

#[cfg(not(unix))]
fn raw_wait_status(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
