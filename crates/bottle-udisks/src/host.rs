//! Host implementation combining probe, volume operations and provisioning.

use crate::locator::SystemLocator;
use crate::mounts::{DEFAULT_MOUNTS_PATH, MOUNTS_OVERRIDE_ENV};
use crate::provision::SystemProvisioner;
use crate::volumes::UdisksVolumes;
use bottle_core::command::ToolCommand;
use bottle_core::config::{resolve_binary, LaunchConfig, ToolsCfg};
use bottle_core::error::{BottleError, BottleResult};
use bottle_core::workflow::Escalator;
use bottle_provider::{
    DeviceLocator, MountState, ProvisionRequest, VolumeManager, VolumeProvisioner,
};
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_UDISKSCTL_PATHS: &[&str] = &["/usr/bin/udisksctl", "/bin/udisksctl"];
const DEFAULT_LOSETUP_PATHS: &[&str] = &["/usr/sbin/losetup", "/sbin/losetup", "/usr/bin/losetup"];
const DEFAULT_LSBLK_PATHS: &[&str] = &["/usr/bin/lsblk", "/bin/lsblk"];
const DEFAULT_SYNC_PATHS: &[&str] = &["/usr/bin/sync", "/bin/sync"];
const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
const DEFAULT_MKFS_EXT4_PATHS: &[&str] = &["/usr/sbin/mkfs.ext4", "/sbin/mkfs.ext4"];

/// udisks-backed host used by the launcher.
///
/// Tools needed to mount and unmount are resolved up front. Formatting tools
/// are resolved on demand so a machine without cryptsetup can still open
/// existing bottles.
#[derive(Debug, Clone)]
pub struct UdisksHost {
    locator: SystemLocator,
    volumes: UdisksVolumes,
    tools: ToolsCfg,
}

impl UdisksHost {
    pub fn from_config(config: &LaunchConfig) -> BottleResult<Self> {
        let tools = &config.tools;
        let losetup = resolve_binary(tools.losetup.as_deref(), DEFAULT_LOSETUP_PATHS, "losetup")?;
        let lsblk = resolve_binary(tools.lsblk.as_deref(), DEFAULT_LSBLK_PATHS, "lsblk")?;
        let udisksctl =
            resolve_binary(tools.udisksctl.as_deref(), DEFAULT_UDISKSCTL_PATHS, "udisksctl")?;
        let sync = resolve_binary(tools.sync.as_deref(), DEFAULT_SYNC_PATHS, "sync")?;

        let mounts = env::var_os(MOUNTS_OVERRIDE_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNTS_PATH));

        Ok(Self {
            locator: SystemLocator::new(
                ToolCommand::new(losetup),
                ToolCommand::new(lsblk),
                mounts.clone(),
            ),
            volumes: UdisksVolumes::new(
                ToolCommand::new(udisksctl),
                ToolCommand::new(sync),
                mounts,
            ),
            tools: tools.clone(),
        })
    }

    /// Replace the mount table location.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.locator = self.locator.with_mounts(path.clone());
        self.volumes = self.volumes.with_mounts(path);
        self
    }

    /// Resolve formatting tools and privilege escalation.
    ///
    /// Called before anything destructive so a missing tool is reported
    /// while the bottle file does not exist yet.
    pub fn provisioner(&self) -> BottleResult<SystemProvisioner> {
        let tools = &self.tools;
        let cryptsetup = resolve_binary(
            tools.cryptsetup.as_deref(),
            DEFAULT_CRYPTSETUP_PATHS,
            "cryptsetup",
        )?;
        let losetup = resolve_binary(tools.losetup.as_deref(), DEFAULT_LOSETUP_PATHS, "losetup")?;
        let mkfs = resolve_binary(tools.mkfs_ext4.as_deref(), DEFAULT_MKFS_EXT4_PATHS, "mkfs.ext4")?;
        let escalator = Escalator::resolve(tools.escalation)?;

        Ok(SystemProvisioner::new(
            ToolCommand::privileged(cryptsetup, escalator.clone()),
            ToolCommand::privileged(losetup, escalator.clone()),
            ToolCommand::privileged(mkfs, escalator),
        ))
    }
}

impl DeviceLocator for UdisksHost {
    type Error = BottleError;

    fn locate(&self, file: &Path) -> BottleResult<MountState> {
        self.locator.locate(file)
    }
}

impl VolumeManager for UdisksHost {
    type Error = BottleError;

    fn attach(&self, file: &Path) -> BottleResult<String> {
        self.volumes.attach(file)
    }

    fn unlock(&self, loop_device: &str, key: &[u8]) -> BottleResult<String> {
        self.volumes.unlock(loop_device, key)
    }

    fn mount(&self, cleartext_device: &str) -> BottleResult<PathBuf> {
        self.volumes.mount(cleartext_device)
    }

    fn flush(&self, mount_point: &Path) -> BottleResult<()> {
        self.volumes.flush(mount_point)
    }

    fn unmount(&self, cleartext_device: &str, force: bool) -> BottleResult<()> {
        self.volumes.unmount(cleartext_device, force)
    }

    fn lock(&self, loop_device: &str) -> BottleResult<()> {
        self.volumes.lock(loop_device)
    }

    fn detach(&self, loop_device: &str) -> BottleResult<()> {
        self.volumes.detach(loop_device)
    }
}

impl VolumeProvisioner for UdisksHost {
    type Error = BottleError;

    fn provision(&self, request: &ProvisionRequest<'_>) -> BottleResult<()> {
        self.provisioner()?.provision(request)
    }
}
