//! Kernel-visible state of a bottle.
//!
//! A `MountState` is only ever a snapshot of what the loop table, the block
//! hierarchy and the mount table reported at probe time. It is never persisted.

use std::fmt;
use std::path::{Path, PathBuf};

/// Position of a bottle along the attach -> unlock -> mount chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MountPhase {
    Unattached,
    Attached,
    Unlocked,
    Mounted,
}

impl fmt::Display for MountPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MountPhase::Unattached => "unattached",
            MountPhase::Attached => "attached (locked)",
            MountPhase::Unlocked => "unlocked (not mounted)",
            MountPhase::Mounted => "mounted",
        };
        f.write_str(label)
    }
}

/// Loop device, cleartext device and mount point of a bottle.
///
/// Fields form a strict chain: a cleartext device implies a loop device and a
/// mount point implies a cleartext device. The constructors are the only way
/// to build a value, so the chain cannot be broken from outside.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountState {
    loop_device: Option<String>,
    cleartext_device: Option<String>,
    mount_point: Option<PathBuf>,
}

impl MountState {
    pub fn unattached() -> Self {
        Self::default()
    }

    pub fn attached(loop_device: impl Into<String>) -> Self {
        Self {
            loop_device: Some(loop_device.into()),
            ..Self::default()
        }
    }

    pub fn unlocked(loop_device: impl Into<String>, cleartext_device: impl Into<String>) -> Self {
        Self {
            loop_device: Some(loop_device.into()),
            cleartext_device: Some(cleartext_device.into()),
            mount_point: None,
        }
    }

    pub fn mounted(
        loop_device: impl Into<String>,
        cleartext_device: impl Into<String>,
        mount_point: impl Into<PathBuf>,
    ) -> Self {
        Self {
            loop_device: Some(loop_device.into()),
            cleartext_device: Some(cleartext_device.into()),
            mount_point: Some(mount_point.into()),
        }
    }

    /// Build a state from independently probed parts, dropping every field
    /// that follows the first missing link.
    pub fn from_probe(
        loop_device: Option<String>,
        cleartext_device: Option<String>,
        mount_point: Option<PathBuf>,
    ) -> Self {
        let Some(loop_device) = loop_device.filter(|dev| !dev.is_empty()) else {
            return Self::unattached();
        };
        let Some(cleartext_device) = cleartext_device.filter(|dev| !dev.is_empty()) else {
            return Self::attached(loop_device);
        };
        match mount_point.filter(|path| !path.as_os_str().is_empty()) {
            Some(mount_point) => Self::mounted(loop_device, cleartext_device, mount_point),
            None => Self::unlocked(loop_device, cleartext_device),
        }
    }

    pub fn phase(&self) -> MountPhase {
        match (&self.loop_device, &self.cleartext_device, &self.mount_point) {
            (Some(_), Some(_), Some(_)) => MountPhase::Mounted,
            (Some(_), Some(_), None) => MountPhase::Unlocked,
            (Some(_), None, _) => MountPhase::Attached,
            (None, _, _) => MountPhase::Unattached,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.loop_device.is_none()
    }

    pub fn loop_device(&self) -> Option<&str> {
        self.loop_device.as_deref()
    }

    pub fn cleartext_device(&self) -> Option<&str> {
        self.cleartext_device.as_deref()
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }
}
