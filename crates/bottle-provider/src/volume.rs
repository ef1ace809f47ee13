//! Contracts for the volume daemon, the kernel-state probe and provisioning.
//!
//! Implementations shell out to privileged tooling. Every confirmation they
//! parse (loop node, cleartext node, mount path) must come from the tool's own
//! output; guessing a device node is never acceptable.

use crate::state::MountState;
use std::error::Error;
use std::path::{Path, PathBuf};

/// Read-only probe of the loop table, block hierarchy and mount table.
pub trait DeviceLocator {
    type Error: Error + Send + Sync + 'static;

    /// Report the current state of `file`. A file that is not loop-attached
    /// yields an empty state, not an error.
    fn locate(&self, file: &Path) -> Result<MountState, Self::Error>;
}

/// Mutating operations offered by the volume daemon.
pub trait VolumeManager {
    type Error: Error + Send + Sync + 'static;

    /// Attach `file` to a loop device and return the assigned node.
    fn attach(&self, file: &Path) -> Result<String, Self::Error>;

    /// Unlock the LUKS container on `loop_device` and return the cleartext node.
    ///
    /// An empty `key` delegates the prompt to the daemon itself.
    fn unlock(&self, loop_device: &str, key: &[u8]) -> Result<String, Self::Error>;

    /// Mount the cleartext device with hardened options and return the path.
    fn mount(&self, cleartext_device: &str) -> Result<PathBuf, Self::Error>;

    /// Flush filesystem buffers for `mount_point`.
    fn flush(&self, mount_point: &Path) -> Result<(), Self::Error>;

    /// Unmount the cleartext device; `force` requests a lazy unmount.
    fn unmount(&self, cleartext_device: &str, force: bool) -> Result<(), Self::Error>;

    /// Lock the LUKS container on `loop_device`.
    fn lock(&self, loop_device: &str) -> Result<(), Self::Error>;

    /// Release the loop device.
    fn detach(&self, loop_device: &str) -> Result<(), Self::Error>;
}

/// Everything needed to turn an empty backing file into a usable bottle.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    pub file: &'a Path,
    pub mapper_name: &'a str,
    pub label: &'a str,
    /// Raw key material; empty means the format tool prompts by itself.
    pub key: &'a [u8],
}

/// Destructive one-shot setup: LUKS2 format, filesystem creation, teardown.
pub trait VolumeProvisioner {
    type Error: Error + Send + Sync + 'static;

    fn provision(&self, request: &ProvisionRequest<'_>) -> Result<(), Self::Error>;
}
