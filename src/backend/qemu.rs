//! QEMU backend: boots a system image as a local virtual machine.
//!
//! The guest's SSH port is forwarded to `127.0.0.1:<port>` through user-mode
//! networking. The serial console and the QEMU monitor are exposed as telnet
//! servers on `port + 100` and `port + 200`. The image is opened with
//! `-snapshot`, so the cached copy is never written to.

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::CommandInvocation;
use crate::models::system::{System, BIOS_UEFI};
use crate::{LinkError, Result};

/// Default emulator binary.
pub const QEMU_BINARY: &str = "qemu-system-x86_64";

/// Firmware image used for UEFI boot unless overridden.
pub const DEFAULT_BIOS_PATH: &str = "/usr/share/OVMF/OVMF_CODE.fd";

/// Overrides [`DEFAULT_BIOS_PATH`].
pub const BIOS_PATH_ENV: &str = "VMLINK_QEMU_FALLBACK_BIOS_PATH";

/// `1` keeps the graphical display (no `-nographic`).
pub const GUI_ENV: &str = "VMLINK_QEMU_GUI";

/// `0` disables hardware acceleration (no `-enable-kvm`).
pub const KVM_ENV: &str = "VMLINK_QEMU_KVM";

/// Cache directory for images, relative to `$HOME`.
pub const IMAGE_CACHE_DIR: &str = ".vmlink/qemu";

/// Host-side knobs that are not part of a [`System`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuOptions {
    /// Emulator binary.
    pub binary: String,
    /// Firmware image passed to `-bios` for UEFI systems.
    pub bios_path: String,
    /// Keep the graphical display.
    pub gui: bool,
    /// Enable KVM acceleration.
    pub kvm: bool,
}

impl Default for QemuOptions {
    fn default() -> Self {
        Self {
            binary: QEMU_BINARY.into(),
            bios_path: DEFAULT_BIOS_PATH.into(),
            gui: false,
            kvm: true,
        }
    }
}

impl QemuOptions {
    /// Defaults overridden by the `VMLINK_QEMU_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Apply the `VMLINK_QEMU_*` environment variables on top of `self`.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Some(path) = env::var(BIOS_PATH_ENV).ok().filter(|p| !p.is_empty()) {
            self.bios_path = path;
        }
        if let Ok(gui) = env::var(GUI_ENV) {
            self.gui = gui == "1";
        }
        if let Ok(kvm) = env::var(KVM_ENV) {
            self.kvm = kvm != "0";
        }
        self
    }
}

/// Build the QEMU invocation for `system`, reading host options from the
/// environment.
///
/// # Errors
///
/// See [`qemu_command_with`].
pub fn qemu_command(
    system: &System,
    image_path: &Path,
    memory_mb: u32,
    port: u16,
) -> Result<CommandInvocation> {
    qemu_command_with(system, image_path, memory_mb, port, &QemuOptions::from_env())
}

/// Build the QEMU invocation for `system`.
///
/// `image_path` must already be resolved (see [`image_path`]). `memory_mb`
/// and `port` are passed through without range checks.
///
/// # Errors
///
/// - `LinkError::InvalidBios` if `system.bios` is neither empty nor `uefi`.
/// - `LinkError::Config` if the system does not use the QEMU backend.
pub fn qemu_command_with(
    system: &System,
    image_path: &Path,
    memory_mb: u32,
    port: u16,
    options: &QemuOptions,
) -> Result<CommandInvocation> {
    if !system.is_qemu() {
        return Err(LinkError::Config(format!(
            "system {system} uses backend {:?}, not qemu",
            system.backend
        )));
    }

    let uefi = match system.bios.as_str() {
        "" => false,
        BIOS_UEFI => true,
        other => return Err(LinkError::InvalidBios(other.to_owned())),
    };

    let mut cmd = CommandInvocation::new(&options.binary);
    if !options.gui {
        cmd.arg("-nographic");
    }
    if options.kvm {
        cmd.arg("-enable-kvm");
    }
    cmd.arg("-snapshot").flag("-m", memory_mb.to_string());

    if uefi {
        cmd.flag("-bios", &options.bios_path);
    }

    let nic = if system.virtio_net {
        "virtio-net-pci"
    } else {
        "e1000"
    };
    cmd.flag(
        "-netdev",
        format!("user,id=user0,hostfwd=tcp:127.0.0.1:{port}-:22"),
    )
    .flag("-device", format!("netdev=user0,driver={nic}"));

    let port = u32::from(port);
    cmd.flag(
        "-serial",
        format!("telnet:127.0.0.1:{},server,nowait", port + 100),
    )
    .flag(
        "-monitor",
        format!("telnet:127.0.0.1:{},server,nowait", port + 200),
    );

    let mut drive = format!("file={},format=raw", image_path.display());
    if system.virtio_disk {
        drive.push_str(",if=virtio");
    }
    cmd.flag("-drive", drive);

    debug!(system = %system, argv = ?cmd.argv(), "qemu command built");
    Ok(cmd)
}

/// Locate the cached image for `image` under `$HOME/.vmlink/qemu`.
///
/// # Errors
///
/// Returns `LinkError::Image` if `$HOME` is unset or the image file is
/// missing.
pub fn image_path(image: &str) -> Result<PathBuf> {
    let home = env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .ok_or_else(|| LinkError::Image("HOME is not set".into()))?;
    let path = PathBuf::from(home)
        .join(IMAGE_CACHE_DIR)
        .join(format!("{image}.img"));
    if path.is_file() {
        Ok(path)
    } else {
        Err(LinkError::Image(format!(
            "cannot find qemu image at {}",
            path.display()
        )))
    }
}
