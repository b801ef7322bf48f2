//! Domain model module declarations.

pub mod reboot;
pub mod system;
