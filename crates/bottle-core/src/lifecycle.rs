//! Process-wide registry of the active mount and child, plus signal cleanup.
//!
//! The interactive session and the termination-signal path share one
//! [`LifecycleCoordinator`]. Mutations and cleanup run under the same lock,
//! so a signal that arrives mid-mount waits for the mount to finish and then
//! tears it down.

use crate::error::{BottleError, BottleResult};
use crate::workflow::{LockRetry, UnmountOrchestrator};
use bottle_provider::{MountState, VolumeManager};
use log::{debug, info, warn};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// A running sandboxed application that cleanup may need to stop.
pub trait ChildProcess: Send {
    fn id(&self) -> u32;

    /// Ask the process to exit.
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit.
    fn kill(&mut self) -> io::Result<()>;
}

/// Signal-only handle to a child the session waits on elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    fn signal(&self, signo: libc::c_int) -> io::Result<()> {
        let pid = libc::pid_t::try_from(self.pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        let rc = unsafe { libc::kill(pid, signo) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl ChildProcess for ProcessHandle {
    fn id(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.signal(libc::SIGKILL)
    }
}

/// Termination signals the launcher handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
}

impl TerminationSignal {
    pub fn number(self) -> i32 {
        match self {
            TerminationSignal::Interrupt => libc::SIGINT,
            TerminationSignal::Terminate => libc::SIGTERM,
            TerminationSignal::Hangup => libc::SIGHUP,
            TerminationSignal::Quit => libc::SIGQUIT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Terminate => "SIGTERM",
            TerminationSignal::Hangup => "SIGHUP",
            TerminationSignal::Quit => "SIGQUIT",
        }
    }

    /// POSIX shell convention: 128 + signal number.
    pub fn exit_code(self) -> i32 {
        exit_code_for_signal(self.number())
    }
}

pub fn exit_code_for_signal(signo: i32) -> i32 {
    128 + signo
}

#[derive(Default)]
struct Registry {
    mount: Option<MountState>,
    child: Option<Box<dyn ChildProcess>>,
    shut_down: bool,
}

pub struct LifecycleCoordinator<V> {
    registry: Mutex<Registry>,
    volumes: Arc<V>,
    retry: LockRetry,
    grace: Duration,
}

impl<V> LifecycleCoordinator<V>
where
    V: VolumeManager<Error = BottleError>,
{
    pub fn new(volumes: Arc<V>, retry: LockRetry, grace: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            volumes,
            retry,
            grace,
        }
    }

    // Cleanup must still run after a panic elsewhere poisoned the lock.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `mount` under the registry lock and record its result.
    ///
    /// At most one bottle is tracked; a second mount while one is active is
    /// refused.
    pub fn mount_with<F>(&self, mount: F) -> BottleResult<MountState>
    where
        F: FnOnce() -> BottleResult<MountState>,
    {
        let mut registry = self.registry();
        if registry.shut_down {
            return Err(BottleError::Busy("shutting down; refusing to mount".into()));
        }
        if let Some(active) = &registry.mount {
            return Err(BottleError::Busy(format!(
                "another bottle is already mounted via {}",
                active.loop_device().unwrap_or("?")
            )));
        }
        let state = mount()?;
        registry.mount = Some(state.clone());
        Ok(state)
    }

    pub fn active_mount(&self) -> Option<MountState> {
        self.registry().mount.clone()
    }

    pub fn register_child(&self, child: Box<dyn ChildProcess>) -> BottleResult<()> {
        let mut registry = self.registry();
        if registry.shut_down {
            return Err(BottleError::Busy("shutting down; refusing to track child".into()));
        }
        debug!("tracking child pid {}", child.id());
        registry.child = Some(child);
        Ok(())
    }

    /// Forget the child after the session has reaped it.
    pub fn clear_child(&self) {
        self.registry().child = None;
    }

    /// Normal-path teardown of the tracked mount.
    ///
    /// The state stays registered if teardown fails, so signal cleanup can
    /// still try again.
    pub fn release(&self) -> BottleResult<()> {
        let mut registry = self.registry();
        let Some(state) = registry.mount.clone() else {
            return Ok(());
        };
        UnmountOrchestrator::new(&*self.volumes, self.retry).unmount(&state)?;
        registry.mount = None;
        Ok(())
    }

    /// Best-effort shutdown: stop the child, then unmount.
    ///
    /// Runs at most once per coordinator; later calls return `Ok(false)`
    /// after waiting for the first to finish.
    pub fn cleanup(&self) -> BottleResult<bool> {
        let mut registry = self.registry();
        if registry.shut_down {
            return Ok(false);
        }
        registry.shut_down = true;

        if let Some(mut child) = registry.child.take() {
            let pid = child.id();
            info!("stopping child pid {pid}");
            if let Err(err) = child.terminate() {
                debug!("SIGTERM to {pid} failed: {err}");
            }
            thread::sleep(self.grace);
            if let Err(err) = child.kill() {
                debug!("SIGKILL to {pid} failed: {err}");
            }
        }

        if let Some(state) = registry.mount.take() {
            info!("releasing bottle before exit");
            if let Err(err) = UnmountOrchestrator::new(&*self.volumes, self.retry).unmount(&state)
            {
                warn!("cleanup unmount failed: {err}");
                registry.mount = Some(state);
                return Err(err);
            }
        }
        Ok(true)
    }
}
