//! Read-only probe: loop table, then block hierarchy, then mount table.

use crate::mounts::find_mount_point;
use crate::parse::{parse_losetup_association, parse_lsblk_crypt};
use bottle_core::command::{Input, ToolCommand};
use bottle_core::error::{BottleError, BottleResult};
use bottle_provider::{DeviceLocator, MountState};
use log::debug;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SystemLocator {
    losetup: ToolCommand,
    lsblk: ToolCommand,
    mounts: PathBuf,
}

impl SystemLocator {
    pub(crate) fn new(losetup: ToolCommand, lsblk: ToolCommand, mounts: PathBuf) -> Self {
        Self {
            losetup,
            lsblk,
            mounts,
        }
    }

    pub(crate) fn with_mounts(mut self, mounts: PathBuf) -> Self {
        self.mounts = mounts;
        self
    }

    fn loop_device(&self, file: &Path) -> BottleResult<Option<String>> {
        let file_arg = file.to_string_lossy();
        let out = self.losetup.run(&["-j", file_arg.as_ref()], Input::None)?;
        if !out.success() {
            return Err(BottleError::tool(
                format!("losetup -j {}", file.display()),
                out.diagnostic(),
            ));
        }
        Ok(parse_losetup_association(&out.stdout))
    }
}

impl DeviceLocator for SystemLocator {
    type Error = BottleError;

    fn locate(&self, file: &Path) -> BottleResult<MountState> {
        if !file.exists() {
            return Ok(MountState::unattached());
        }

        let Some(loop_device) = self.loop_device(file)? else {
            return Ok(MountState::unattached());
        };

        let out = self.lsblk.run(
            &["-nlpo", "NAME,KNAME,TYPE", loop_device.as_str()],
            Input::None,
        )?;
        if !out.success() {
            return Err(BottleError::tool(
                format!("lsblk {loop_device}"),
                out.diagnostic(),
            ));
        }
        let Some(child) = parse_lsblk_crypt(&out.stdout) else {
            return Ok(MountState::attached(loop_device));
        };

        let mount_point =
            find_mount_point(&self.mounts, &[child.kname.as_str(), child.name.as_str()])?;
        let state = MountState::from_probe(Some(loop_device), Some(child.kname), mount_point);
        debug!("{} probed as {}", file.display(), state.phase());
        Ok(state)
    }
}
