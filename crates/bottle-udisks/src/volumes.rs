//! `udisksctl`-backed volume operations.
//!
//! udisks runs the privileged parts itself and asks polkit for consent, so
//! nothing here is wrapped in pkexec or sudo.

use crate::mounts::is_mount_target;
use crate::parse::{
    classify_mount_failure, classify_unlock_failure, parse_cleartext_device, parse_loop_device,
    parse_mount_point,
};
use bottle_core::command::{Input, ToolCommand};
use bottle_core::error::{BottleError, BottleResult};
use bottle_core::keyfile::StagedKeyFile;
use bottle_provider::VolumeManager;
use log::{debug, info};
use std::path::{Path, PathBuf};

/// Mount options applied to every bottle.
pub const MOUNT_OPTIONS: &str = "nodev,nosuid,noexec";

#[derive(Debug, Clone)]
pub struct UdisksVolumes {
    udisksctl: ToolCommand,
    sync: ToolCommand,
    mounts: PathBuf,
}

impl UdisksVolumes {
    pub(crate) fn new(udisksctl: ToolCommand, sync: ToolCommand, mounts: PathBuf) -> Self {
        Self {
            udisksctl,
            sync,
            mounts,
        }
    }

    pub(crate) fn with_mounts(mut self, mounts: PathBuf) -> Self {
        self.mounts = mounts;
        self
    }
}

fn malformed(operation: String, expected: &'static str, stdout: &str) -> BottleError {
    BottleError::MalformedOutput {
        operation,
        expected,
        output: stdout.trim().to_string(),
    }
}

impl VolumeManager for UdisksVolumes {
    type Error = BottleError;

    fn attach(&self, file: &Path) -> BottleResult<String> {
        let operation = format!("attach {}", file.display());
        let file_arg = file.to_string_lossy();
        let out = self.udisksctl.run_checked(
            &operation,
            &["loop-setup", "-f", file_arg.as_ref()],
            Input::None,
        )?;
        let device = parse_loop_device(&out.stdout)
            .ok_or_else(|| malformed(operation, "loop device", &out.stdout))?;
        debug!("{} attached as {device}", file.display());
        Ok(device)
    }

    fn unlock(&self, loop_device: &str, key: &[u8]) -> BottleResult<String> {
        let operation = format!("unlock {loop_device}");
        let out = if key.is_empty() {
            self.udisksctl
                .run(&["unlock", "-b", loop_device], Input::Inherit)?
        } else {
            let staged = StagedKeyFile::stage(key)?;
            let key_path = staged.path().to_string_lossy().into_owned();
            self.udisksctl.run(
                &["unlock", "-b", loop_device, "--key-file", key_path.as_str()],
                Input::None,
            )?
        };
        if !out.success() {
            return Err(classify_unlock_failure(&operation, &out.diagnostic()));
        }
        parse_cleartext_device(&out.stdout)
            .ok_or_else(|| malformed(operation, "cleartext device", &out.stdout))
    }

    fn mount(&self, cleartext_device: &str) -> BottleResult<PathBuf> {
        let operation = format!("mount {cleartext_device}");
        let out = self.udisksctl.run(
            &["mount", "-b", cleartext_device, "--options", MOUNT_OPTIONS],
            Input::None,
        )?;
        if !out.success() {
            return Err(classify_mount_failure(&operation, &out.diagnostic()));
        }
        let mount_point = parse_mount_point(&out.stdout)
            .ok_or_else(|| malformed(operation.clone(), "mount point", &out.stdout))?;
        if !is_mount_target(&self.mounts, &mount_point)? {
            return Err(malformed(
                operation,
                "mount point listed in the mount table",
                &out.stdout,
            ));
        }
        info!("{cleartext_device} mounted at {}", mount_point.display());
        Ok(mount_point)
    }

    fn flush(&self, mount_point: &Path) -> BottleResult<()> {
        let target = mount_point.to_string_lossy();
        self.sync
            .run_checked(
                &format!("sync {}", mount_point.display()),
                &["-f", target.as_ref()],
                Input::None,
            )
            .map(|_| ())
    }

    fn unmount(&self, cleartext_device: &str, force: bool) -> BottleResult<()> {
        let mut args = vec!["unmount", "-b", cleartext_device];
        if force {
            args.push("--force");
        }
        self.udisksctl
            .run_checked(&format!("unmount {cleartext_device}"), args.as_slice(), Input::None)
            .map(|_| ())
    }

    fn lock(&self, loop_device: &str) -> BottleResult<()> {
        self.udisksctl
            .run_checked(
                &format!("lock {loop_device}"),
                &["lock", "-b", loop_device],
                Input::None,
            )
            .map(|_| ())
    }

    fn detach(&self, loop_device: &str) -> BottleResult<()> {
        self.udisksctl
            .run_checked(
                &format!("detach {loop_device}"),
                &["loop-delete", "-b", loop_device],
                Input::None,
            )
            .map(|_| ())
    }
}
