//! Progress events emitted while a session recovers from a reboot.

use std::time::Duration;

/// Events delivered to the caller while [`Client::dial_on_reboot`] runs.
///
/// [`Client::dial_on_reboot`]: crate::connect::client::Client::dial_on_reboot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootEvent {
    /// Reconnect attempts have failed for longer than the warn timeout.
    Slow {
        /// Job whose system is rebooting.
        job: String,
        /// Time elapsed since the reboot was requested.
        elapsed: Duration,
    },
    /// A new session was established and installed.
    Reconnected {
        /// Job whose system came back.
        job: String,
        /// Number of dial attempts, including the successful one.
        attempts: u32,
    },
}
