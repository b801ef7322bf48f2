//! Declarative description of one test target.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Backend name selecting the QEMU command builder.
pub const QEMU_BACKEND: &str = "qemu";

/// Firmware value selecting UEFI boot. The empty string selects legacy boot.
pub const BIOS_UEFI: &str = "uefi";

/// One ephemeral test system (virtual machine, container, or remote host).
///
/// Owned by the scheduler and read-only to this crate. The `bios` field is
/// not checked at construction or deserialization time; it is validated only
/// when a backend command is built for the system.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct System {
    /// Unique label used in diagnostics.
    pub name: String,
    /// Logical image identifier or path.
    pub image: String,
    /// Backend that boots this system (e.g. `qemu`).
    pub backend: String,
    /// Firmware mode: empty for legacy boot, `uefi` for UEFI.
    #[serde(default)]
    pub bios: String,
    /// Attach the disk over virtio instead of the default controller.
    #[serde(default)]
    pub virtio_disk: bool,
    /// Use a virtio network device instead of an emulated NIC.
    #[serde(default)]
    pub virtio_net: bool,
}

impl System {
    /// Construct a system with legacy firmware and non-virtio devices.
    #[must_use]
    pub fn new(name: impl Into<String>, image: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            backend: backend.into(),
            ..Self::default()
        }
    }

    /// Whether the system is booted by the QEMU backend.
    #[must_use]
    pub fn is_qemu(&self) -> bool {
        self.backend == QEMU_BACKEND
    }
}

impl Display for System {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
