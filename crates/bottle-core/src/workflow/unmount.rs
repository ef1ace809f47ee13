//! Reverse a mount: flush, unmount, lock, detach.

use crate::config::LaunchConfig;
use crate::error::{BottleError, BottleResult};
use bottle_provider::{MountState, VolumeManager};
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;

/// Bounded retry applied to locking after unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl LockRetry {
    pub fn from_config(config: &LaunchConfig) -> Self {
        Self {
            attempts: config.retry.lock_attempts.max(1),
            delay: config.lock_delay(),
        }
    }
}

pub struct UnmountOrchestrator<'a, V> {
    volumes: &'a V,
    retry: LockRetry,
}

impl<'a, V> UnmountOrchestrator<'a, V>
where
    V: VolumeManager<Error = BottleError>,
{
    pub fn new(volumes: &'a V, retry: LockRetry) -> Self {
        Self { volumes, retry }
    }

    /// Tear down whatever part of `state` exists. An empty state is a no-op.
    pub fn unmount(&self, state: &MountState) -> BottleResult<()> {
        let Some(loop_device) = state.loop_device() else {
            debug!("nothing attached; unmount is a no-op");
            return Ok(());
        };

        if let Some(mount_point) = state.mount_point() {
            if let Err(err) = self.volumes.flush(mount_point) {
                warn!("flush of {} failed: {err}", mount_point.display());
            }
        }

        if let Some(cleartext) = state.cleartext_device() {
            if state.mount_point().is_some() {
                self.unmount_device(cleartext)?;
            }
            self.lock_with_retry(loop_device)?;
        }

        self.volumes.detach(loop_device)?;
        info!("released {loop_device}");
        Ok(())
    }

    fn unmount_device(&self, cleartext: &str) -> BottleResult<()> {
        let first = match self.volumes.unmount(cleartext, false) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        warn!("unmount of {cleartext} failed ({first}); retrying with force");
        self.volumes.unmount(cleartext, true).map_err(|forced| {
            BottleError::tool(
                "unmount",
                format!("{}; forced retry: {}", diagnostic_of(&first), diagnostic_of(&forced)),
            )
        })
    }

    fn lock_with_retry(&self, loop_device: &str) -> BottleResult<()> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.volumes.lock(loop_device) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    debug!("lock {loop_device} attempt {attempt}/{attempts} failed: {err}");
                    thread::sleep(self.retry.delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn diagnostic_of(err: &BottleError) -> String {
    match err {
        BottleError::Tool { diagnostic, .. } | BottleError::StaleDevice { diagnostic, .. } => {
            diagnostic.clone()
        }
        other => other.to_string(),
    }
}
