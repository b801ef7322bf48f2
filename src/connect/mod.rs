//! System connectivity: port liveness and reboot-tolerant sessions.

pub mod client;
pub mod dialer;
pub mod port;

pub use client::Client;
pub use dialer::{Dialer, Session, SshConfig, SshDialer};
pub use port::{wait_port_up, wait_port_up_with, PortWaitOptions};
