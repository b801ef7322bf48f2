//! Configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::qemu::QEMU_BINARY;
use crate::connect::dialer::SshConfig;
use crate::connect::port::PortWaitOptions;
use crate::models::system::System;
use crate::{LinkError, Result};

/// Reboot recovery thresholds (seconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RebootConfig {
    /// Quiet period after a reboot request.
    #[serde(default = "default_warn_timeout")]
    pub warn_timeout_seconds: u64,
    /// Total patience after a reboot request.
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_seconds: u64,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            warn_timeout_seconds: default_warn_timeout(),
            kill_timeout_seconds: default_kill_timeout(),
        }
    }
}

impl RebootConfig {
    /// Warn timeout as a duration.
    #[must_use]
    pub fn warn_timeout(&self) -> Duration {
        Duration::from_secs(self.warn_timeout_seconds)
    }

    /// Kill timeout as a duration.
    #[must_use]
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_seconds)
    }
}

fn default_warn_timeout() -> u64 {
    300
}

fn default_kill_timeout() -> u64 {
    900
}

/// Port probe timings (milliseconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PortWaitConfig {
    /// Per-attempt connect timeout.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Pause between failed attempts.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for PortWaitConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl PortWaitConfig {
    /// Timings for [`wait_port_up_with`](crate::connect::port::wait_port_up_with).
    #[must_use]
    pub fn options(&self) -> PortWaitOptions {
        PortWaitOptions {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

fn default_dial_timeout_ms() -> u64 {
    500
}

fn default_retry_interval_ms() -> u64 {
    100
}

/// QEMU host settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QemuConfig {
    /// Emulator binary.
    #[serde(default = "default_qemu_binary")]
    pub binary: String,
    /// Guest memory in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    /// First host port handed out for SSH forwarding.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: default_qemu_binary(),
            memory_mb: default_memory_mb(),
            base_port: default_base_port(),
        }
    }
}

fn default_qemu_binary() -> String {
    QEMU_BINARY.into()
}

fn default_memory_mb() -> u32 {
    1500
}

fn default_base_port() -> u16 {
    59301
}

/// Control-channel login settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SshSettings {
    /// Remote login user.
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Private key file.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Per-attempt connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            identity_file: None,
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl SshSettings {
    /// Dial configuration derived from these settings.
    #[must_use]
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            user: self.user.clone(),
            identity_file: self.identity_file.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            ..SshConfig::default()
        }
    }
}

fn default_ssh_user() -> String {
    "root".into()
}

fn default_connect_timeout() -> u64 {
    5
}

/// Top-level configuration parsed from `vmlink.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LinkConfig {
    /// Reboot recovery thresholds.
    #[serde(default)]
    pub reboot: RebootConfig,
    /// Port probe timings.
    #[serde(default)]
    pub port_wait: PortWaitConfig,
    /// QEMU host settings.
    #[serde(default)]
    pub qemu: QemuConfig,
    /// Control-channel login settings.
    #[serde(default)]
    pub ssh: SshSettings,
    /// Declared test systems.
    #[serde(default)]
    pub systems: Vec<System>,
}

impl LinkConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| LinkError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a declared system by name.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Config` if no system has that name.
    pub fn system(&self, name: &str) -> Result<&System> {
        self.systems
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| LinkError::Config(format!("unknown system {name}")))
    }

    fn validate(&self) -> Result<()> {
        if self.reboot.kill_timeout_seconds < self.reboot.warn_timeout_seconds {
            return Err(LinkError::Config(
                "reboot.kill_timeout_seconds must not be lower than warn_timeout_seconds".into(),
            ));
        }

        if self.port_wait.dial_timeout_ms == 0 {
            return Err(LinkError::Config(
                "port_wait.dial_timeout_ms must be greater than zero".into(),
            ));
        }

        for (idx, system) in self.systems.iter().enumerate() {
            if system.name.is_empty() {
                return Err(LinkError::Config(format!("systems[{idx}] has no name")));
            }
            if self.systems[..idx].iter().any(|s| s.name == system.name) {
                return Err(LinkError::Config(format!(
                    "system {} declared more than once",
                    system.name
                )));
            }
        }

        Ok(())
    }
}
