#![forbid(unsafe_code)]

//! Connectivity layer for ephemeral test systems.
//!
//! - [`connect::port`] waits for a booting system's port to accept connections.
//! - [`connect::client`] recovers a control-channel session after a reboot.
//! - [`backend::qemu`] builds the QEMU invocation that boots a system.

pub mod backend;
pub mod config;
pub mod connect;
pub mod errors;
pub mod models;

pub use config::LinkConfig;
pub use errors::{LinkError, Result};
