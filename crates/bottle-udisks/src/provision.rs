//! One-shot LUKS2 format and ext4 creation for a new bottle.

use crate::parse::parse_loop_device;
use bottle_core::command::{Input, ToolCommand};
use bottle_core::error::{BottleError, BottleResult};
use bottle_core::keyfile::StagedKeyFile;
use bottle_provider::{ProvisionRequest, VolumeProvisioner};
use log::{info, warn};

/// Runs cryptsetup, losetup and mkfs.ext4 with escalation.
#[derive(Debug, Clone)]
pub struct SystemProvisioner {
    cryptsetup: ToolCommand,
    losetup: ToolCommand,
    mkfs: ToolCommand,
}

impl SystemProvisioner {
    pub(crate) fn new(cryptsetup: ToolCommand, losetup: ToolCommand, mkfs: ToolCommand) -> Self {
        Self {
            cryptsetup,
            losetup,
            mkfs,
        }
    }

    fn key_args(staged: Option<&StagedKeyFile>) -> Vec<String> {
        match staged {
            Some(staged) => vec![
                "--key-file".to_string(),
                staged.path().to_string_lossy().into_owned(),
            ],
            None => Vec::new(),
        }
    }

    /// Batch mode only with a key file; a typed passphrase keeps
    /// cryptsetup's confirmation prompt.
    fn luks_format_args(file: &str, key_args: &[String]) -> Vec<String> {
        let mut args: Vec<String> = vec!["luksFormat".into(), "--type".into(), "luks2".into()];
        if !key_args.is_empty() {
            args.push("--batch-mode".into());
        }
        args.extend(key_args.iter().cloned());
        args.push(file.to_string());
        args
    }

    fn populate(
        &self,
        request: &ProvisionRequest<'_>,
        loop_device: &str,
        key_args: &[String],
        input: Input<'_>,
    ) -> BottleResult<()> {
        let mapper = request.mapper_name;
        let mut open: Vec<String> = vec!["open".into()];
        open.extend(key_args.iter().cloned());
        open.push(loop_device.to_string());
        open.push(mapper.to_string());
        self.cryptsetup
            .run_checked(&format!("open {loop_device}"), open.as_slice(), input)?;

        let node = format!("/dev/mapper/{mapper}");
        let formatted = self.mkfs.run_checked(
            &format!("mkfs.ext4 {node}"),
            &["-q", "-L", request.label, node.as_str()],
            Input::None,
        );

        let closed = self.cryptsetup.run_checked(
            &format!("close {mapper}"),
            &["close", mapper],
            Input::None,
        );
        formatted?;
        closed.map(|_| ())
    }
}

impl VolumeProvisioner for SystemProvisioner {
    type Error = BottleError;

    fn provision(&self, request: &ProvisionRequest<'_>) -> BottleResult<()> {
        let file = request.file.to_string_lossy().into_owned();
        let staged = if request.key.is_empty() {
            None
        } else {
            Some(StagedKeyFile::stage(request.key)?)
        };
        let input = if staged.is_some() {
            Input::None
        } else {
            Input::Inherit
        };
        let key_args = Self::key_args(staged.as_ref());

        let luks_format = Self::luks_format_args(&file, &key_args);
        self.cryptsetup
            .run_checked(&format!("luksFormat {file}"), luks_format.as_slice(), input)?;
        info!("formatted {file} as LUKS2");

        let out = self.losetup.run_checked(
            &format!("losetup {file}"),
            &["--find", "--show", file.as_str()],
            Input::None,
        )?;
        let loop_device = parse_loop_device(&out.stdout).ok_or_else(|| {
            BottleError::MalformedOutput {
                operation: format!("losetup {file}"),
                expected: "loop device",
                output: out.stdout.trim().to_string(),
            }
        })?;

        let populated = self.populate(request, &loop_device, &key_args, input);

        let detached = self.losetup.run_checked(
            &format!("losetup -d {loop_device}"),
            &["-d", loop_device.as_str()],
            Input::None,
        );
        if let Err(err) = &detached {
            warn!("could not release {loop_device}: {err}");
        }
        populated?;
        detached.map(|_| ())
    }
}
