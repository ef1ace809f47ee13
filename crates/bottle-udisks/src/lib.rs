#![forbid(unsafe_code)]

//! Host integration for bottles.
//!
//! Talks to the machine via:
//! - `udisksctl` (loop setup, unlock, mount, unmount, lock, loop delete)
//! - `losetup -j`, `lsblk` and the mount table for read-only probing
//! - `cryptsetup`, `losetup` and `mkfs.ext4` under pkexec/sudo for creation

mod host;
mod locator;
mod mounts;
pub mod parse;
mod provision;
mod volumes;

pub use host::UdisksHost;
pub use locator::SystemLocator;
pub use mounts::MOUNTS_OVERRIDE_ENV;
pub use provision::SystemProvisioner;
pub use volumes::{UdisksVolumes, MOUNT_OPTIONS};
