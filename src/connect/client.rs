//! Reboot-tolerant control-channel client.
//!
//! A [`Client`] owns at most one live [`Session`] to a system. When a test
//! step reboots the system the session dies with it; [`Client::dial_on_reboot`]
//! then re-dials through the injected [`Dialer`] until the system answers or
//! the kill timeout runs out.
//!
//! Patience has two tiers measured from the moment the reboot was requested:
//!
//! | elapsed                          | behaviour                                  |
//! |----------------------------------|--------------------------------------------|
//! | `<= warn_timeout`                | retry quietly                              |
//! | `warn_timeout ..= kill_timeout`  | retry, warn, emit [`RebootEvent::Slow`]    |
//! | `> kill_timeout`                 | give up with [`LinkError::KillTimeout`]    |

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::dialer::{DialFuture, Dialer, Session, SshConfig};
use crate::models::reboot::RebootEvent;
use crate::{LinkError, Result};

/// Default quiet period after a reboot request.
pub const DEFAULT_WARN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default total patience after a reboot request.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Pause between failed reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(200);

/// Control-channel client for one system.
pub struct Client {
    job: String,
    address: String,
    config: SshConfig,
    dialer: Arc<dyn Dialer>,
    session: Option<Box<dyn Session>>,
    warn_timeout: Duration,
    kill_timeout: Duration,
    retry_interval: Duration,
    events: Option<mpsc::Sender<RebootEvent>>,
}

impl Client {
    /// Construct a client with no session yet.
    ///
    /// `job` labels every diagnostic this client produces.
    #[must_use]
    pub fn new(
        job: impl Into<String>,
        address: impl Into<String>,
        config: SshConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            job: job.into(),
            address: address.into(),
            config,
            dialer,
            session: None,
            warn_timeout: DEFAULT_WARN_TIMEOUT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            retry_interval: RECONNECT_INTERVAL,
            events: None,
        }
    }

    /// Construct a client and establish its first session.
    ///
    /// # Errors
    ///
    /// Returns whatever the dialer reports for the single attempt made.
    pub async fn connect(
        job: impl Into<String>,
        address: impl Into<String>,
        config: SshConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        let mut client = Self::new(job, address, config, dialer);
        let session = client.dialer.dial(&client.address, &client.config).await?;
        client.session = Some(session);
        info!(job = client.job, address = client.address, "session established");
        Ok(client)
    }

    /// Deliver reboot progress to `events`.
    ///
    /// Events are best-effort: a full channel drops them.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::Sender<RebootEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the quiet period after a reboot request.
    pub fn set_warn_timeout(&mut self, timeout: Duration) {
        self.warn_timeout = timeout;
    }

    /// Set the total patience after a reboot request.
    pub fn set_kill_timeout(&mut self, timeout: Duration) {
        self.kill_timeout = timeout;
    }

    /// Set the pause between reconnect attempts.
    pub fn set_retry_interval(&mut self, interval: Duration) {
        self.retry_interval = interval;
    }

    /// Job label used in diagnostics.
    #[must_use]
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Target `host:port`.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Quiet period after a reboot request.
    #[must_use]
    pub fn warn_timeout(&self) -> Duration {
        self.warn_timeout
    }

    /// Total patience after a reboot request.
    #[must_use]
    pub fn kill_timeout(&self) -> Duration {
        self.kill_timeout
    }

    /// Whether a session is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// The current session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&dyn Session> {
        self.session.as_deref()
    }

    /// Run a command over the current session.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Exec` if there is no session or the command fails.
    pub async fn run(&self, command: &str) -> Result<String> {
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| LinkError::Exec(format!("{} has no active session", self.job)))?;
        session.run(command).await
    }

    /// Drop the current session.
    pub fn close(&mut self) {
        if self.session.take().is_some() {
            debug!(job = self.job, "session closed");
        }
    }

    /// Re-establish the session after a reboot requested at `requested_at`.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::KillTimeout` once the kill timeout, counted from
    /// `requested_at`, runs out. An attempt still in flight at that point is
    /// abandoned.
    pub async fn dial_on_reboot(&mut self, requested_at: Instant) -> Result<()> {
        self.dial_on_reboot_until(requested_at, &CancellationToken::new())
            .await
    }

    /// [`dial_on_reboot`](Self::dial_on_reboot) that also stops when `cancel`
    /// fires.
    ///
    /// Attempts run strictly one after another. The stale session is dropped
    /// before the first attempt, so the client never holds two sessions.
    ///
    /// # Errors
    ///
    /// - `LinkError::KillTimeout` when the kill timeout is exceeded.
    /// - `LinkError::Cancelled` when `cancel` fires first.
    pub async fn dial_on_reboot_until(
        &mut self,
        requested_at: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let span = info_span!("dial_on_reboot", job = self.job, address = self.address);
        self.reconnect(requested_at, cancel).instrument(span).await
    }

    async fn reconnect(&mut self, requested_at: Instant, cancel: &CancellationToken) -> Result<()> {
        self.close();

        let mut attempts: u32 = 0;
        let mut next_warning = self.warn_timeout;
        let kill_at = requested_at
            .checked_add(self.kill_timeout)
            .map(tokio::time::Instant::from_std);

        loop {
            attempts = attempts.saturating_add(1);

            let attempt = self.dialer.dial(&self.address, &self.config);
            let dialed = tokio::select! {
                () = cancel.cancelled() => return Err(self.cancelled()),
                result = dial_before(kill_at, attempt) => result,
            };

            let err = match dialed {
                Some(Ok(session)) => {
                    self.session = Some(session);
                    info!(attempts, elapsed_ms = millis(requested_at.elapsed()), "reconnected after reboot");
                    self.emit(RebootEvent::Reconnected {
                        job: self.job.clone(),
                        attempts,
                    });
                    return Ok(());
                }
                Some(Err(err)) => err,
                None => {
                    warn!(attempts, elapsed_ms = millis(requested_at.elapsed()), "giving up on reboot, dial still pending");
                    return Err(self.kill_timeout_reached());
                }
            };

            let elapsed = requested_at.elapsed();
            if elapsed > self.kill_timeout {
                warn!(attempts, elapsed_ms = millis(elapsed), %err, "giving up on reboot");
                return Err(self.kill_timeout_reached());
            }

            if elapsed > self.warn_timeout && elapsed >= next_warning {
                warn!(attempts, elapsed_ms = millis(elapsed), %err, "reboot is taking a while");
                self.emit(RebootEvent::Slow {
                    job: self.job.clone(),
                    elapsed,
                });
                next_warning = elapsed + self.warn_timeout;
            } else {
                debug!(attempts, elapsed_ms = millis(elapsed), %err, "system not back yet");
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(self.cancelled()),
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    fn kill_timeout_reached(&self) -> LinkError {
        LinkError::KillTimeout {
            job: self.job.clone(),
        }
    }

    fn cancelled(&self) -> LinkError {
        LinkError::Cancelled(format!("{} reboot recovery", self.job))
    }

    fn emit(&self, event: RebootEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                debug!(job = self.job, "reboot event dropped");
            }
        }
    }
}

/// Run one dial attempt, abandoning it at `deadline`; `None` means the
/// deadline passed first.
async fn dial_before(
    deadline: Option<tokio::time::Instant>,
    attempt: DialFuture<'_>,
) -> Option<Result<Box<dyn Session>>> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, attempt).await.ok(),
        None => Some(attempt.await),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
