//! Drive a bottle from whatever state the host reports to fully mounted.

use crate::error::{BottleError, BottleResult};
use crate::keyfile::KeyMaterial;
use crate::secret::SecretProvider;
use bottle_provider::{DeviceLocator, MountPhase, MountState, VolumeManager};
use log::{debug, info, warn};
use std::path::Path;

/// Attach, unlock and mount a bottle, skipping whatever is already done.
///
/// The host is probed once at the start of every call, so running this twice
/// (or from a fresh process after a crash) never repeats finished steps.
pub struct MountOrchestrator<'a, L, V> {
    locator: &'a L,
    volumes: &'a V,
}

impl<'a, L, V> MountOrchestrator<'a, L, V>
where
    L: DeviceLocator<Error = BottleError>,
    V: VolumeManager<Error = BottleError>,
{
    pub fn new(locator: &'a L, volumes: &'a V) -> Self {
        Self { locator, volumes }
    }

    /// Bring `file` to [`MountPhase::Mounted`] and return the final state.
    pub fn mount(&self, file: &Path, secret: &dyn SecretProvider) -> BottleResult<MountState> {
        let mut state = self.locator.locate(file)?;
        if state.phase() == MountPhase::Mounted {
            debug!("{} already mounted; nothing to do", file.display());
            return Ok(state);
        }
        info!(
            "mounting {} (current phase: {})",
            file.display(),
            state.phase()
        );

        // Acquired lazily and reused by stale-mapping recovery so a hardware
        // key is touched once per mount call.
        let mut key: Option<KeyMaterial> = None;
        while state.phase() != MountPhase::Mounted {
            state = self.advance(file, state, secret, &mut key)?;
        }
        Ok(state)
    }

    /// One transition keyed on the current phase.
    fn advance(
        &self,
        file: &Path,
        state: MountState,
        secret: &dyn SecretProvider,
        key: &mut Option<KeyMaterial>,
    ) -> BottleResult<MountState> {
        match (
            state.phase(),
            state.loop_device(),
            state.cleartext_device(),
        ) {
            (MountPhase::Unattached, _, _) => {
                let loop_device = confirmed("attach", "loop device", self.volumes.attach(file)?)?;
                debug!("attached {} at {loop_device}", file.display());
                Ok(MountState::attached(loop_device))
            }
            (MountPhase::Attached, Some(loop_device), _) => {
                let cleartext = self.unlock(loop_device, secret, key)?;
                Ok(MountState::unlocked(loop_device, cleartext))
            }
            (MountPhase::Unlocked, Some(loop_device), Some(cleartext)) => {
                match self.volumes.mount(cleartext) {
                    Ok(mount_point) => Ok(mounted(loop_device, cleartext, mount_point)?),
                    Err(BottleError::StaleDevice {
                        operation,
                        diagnostic,
                    }) => {
                        warn!(
                            "{operation} hit a stale mapping for {cleartext} ({diagnostic}); relocking {loop_device} and retrying once"
                        );
                        self.recover_stale(loop_device, secret, key)
                    }
                    Err(err) => Err(err),
                }
            }
            // Phase and fields disagree only if MountState's invariant broke.
            (phase, _, _) => Err(BottleError::tool(
                "mount",
                format!("inconsistent mount state in phase {phase}"),
            )),
        }
    }

    fn unlock(
        &self,
        loop_device: &str,
        secret: &dyn SecretProvider,
        key: &mut Option<KeyMaterial>,
    ) -> BottleResult<String> {
        let material = match key.take() {
            Some(material) => material,
            None => secret.key_material()?,
        };
        let material = key.insert(material);
        debug!("unlocking {loop_device} with {} credential", secret.kind().label());
        confirmed(
            "unlock",
            "cleartext device",
            self.volumes.unlock(loop_device, &material[..])?,
        )
    }

    /// Lock, unlock again and retry the mount exactly once.
    fn recover_stale(
        &self,
        loop_device: &str,
        secret: &dyn SecretProvider,
        key: &mut Option<KeyMaterial>,
    ) -> BottleResult<MountState> {
        if let Err(err) = self.volumes.lock(loop_device) {
            warn!("relock of {loop_device} failed ({err}); unlocking again anyway");
        }
        let cleartext = self.unlock(loop_device, secret, key)?;
        let mount_point = self.volumes.mount(&cleartext)?;
        info!("stale mapping recovered; mounted {cleartext}");
        mounted(loop_device, &cleartext, mount_point)
    }
}

fn mounted(
    loop_device: &str,
    cleartext: &str,
    mount_point: std::path::PathBuf,
) -> BottleResult<MountState> {
    if mount_point.as_os_str().is_empty() {
        return Err(BottleError::MalformedOutput {
            operation: "mount".into(),
            expected: "mount point",
            output: String::new(),
        });
    }
    Ok(MountState::mounted(loop_device, cleartext, mount_point))
}

fn confirmed(operation: &str, expected: &'static str, value: String) -> BottleResult<String> {
    if value.trim().is_empty() {
        return Err(BottleError::MalformedOutput {
            operation: operation.into(),
            expected,
            output: value,
        });
    }
    Ok(value)
}
