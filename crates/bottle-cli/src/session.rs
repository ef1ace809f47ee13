//! Session control logic.
//!
//! Every blocking step (mount, waiting on the app, release) runs on tokio's
//! blocking pool and reports back as a [`SessionEvent`].

use bottle_core::error::{BottleError, BottleResult};
use bottle_core::secret::{HardwareKeySecret, PasswordSecret, SecretProvider};
use bottle_core::{
    BottleContainer, BottleHost, BottleService, HardwareKeyBinding, LifecycleCoordinator,
    ProcessHandle,
};
use bottle_fido2::Fido2Tools;
use bottle_provider::MountState;
use log::{debug, warn};
use std::io;
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use zeroize::Zeroizing;

/// Completion of one blocking step.
#[derive(Debug)]
pub enum SessionEvent {
    Mounted(BottleResult<MountState>),
    AppExited(io::Result<ExitStatus>),
    Released(BottleResult<()>),
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionEvent::Mounted(_) => "mounted",
            SessionEvent::AppExited(_) => "app exited",
            SessionEvent::Released(_) => "released",
        }
    }
}

/// Owned description of where key material comes from, so it can move onto
/// a worker thread.
pub enum SecretSource {
    Password(Zeroizing<String>),
    HardwareKey {
        tools: Fido2Tools,
        binding: HardwareKeyBinding,
        rp_id: String,
        device: Option<String>,
    },
}

impl SecretSource {
    fn provide<R>(&self, use_secret: impl FnOnce(&dyn SecretProvider) -> R) -> R {
        match self {
            SecretSource::Password(password) => {
                use_secret(&PasswordSecret::new(password.as_str()))
            }
            SecretSource::HardwareKey {
                tools,
                binding,
                rp_id,
                device,
            } => {
                let mut secret = HardwareKeySecret::new(tools, binding.clone(), rp_id.as_str());
                if let Some(device) = device {
                    secret = secret.with_device(device.as_str());
                }
                use_secret(&secret)
            }
        }
    }
}

pub struct Session<H> {
    service: Arc<BottleService<H>>,
    coordinator: Arc<LifecycleCoordinator<H>>,
    tx: UnboundedSender<SessionEvent>,
    rx: UnboundedReceiver<SessionEvent>,
}

impl<H> Session<H>
where
    H: BottleHost + Send + Sync + 'static,
{
    pub fn new(service: Arc<BottleService<H>>, coordinator: Arc<LifecycleCoordinator<H>>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            service,
            coordinator,
            tx,
            rx,
        }
    }

    fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() -> SessionEvent + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let event = job();
            debug!("session event: {}", event.name());
            if tx.send(event).is_err() {
                warn!("session ended before a result was delivered");
            }
        });
    }

    async fn next_event(&mut self) -> BottleResult<SessionEvent> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| BottleError::tool("session", "worker channel closed"))
    }

    /// Mount `bottle` and register it with the coordinator.
    pub async fn mount(
        &mut self,
        bottle: &BottleContainer,
        source: SecretSource,
    ) -> BottleResult<MountState> {
        let service = Arc::clone(&self.service);
        let coordinator = Arc::clone(&self.coordinator);
        let bottle = bottle.clone();
        self.dispatch(move || {
            SessionEvent::Mounted(
                coordinator
                    .mount_with(|| source.provide(|secret| service.open(&bottle, secret))),
            )
        });
        match self.next_event().await? {
            SessionEvent::Mounted(result) => result,
            other => Err(unexpected(other)),
        }
    }

    /// Mount, asking `prompt` for a fresh secret after each recoverable
    /// failure, up to `attempts` tries in total.
    pub async fn mount_with_retries<P>(
        &mut self,
        bottle: &BottleContainer,
        attempts: u32,
        mut prompt: P,
    ) -> BottleResult<MountState>
    where
        P: FnMut(u32) -> BottleResult<SecretSource>,
    {
        let mut attempt = 1;
        loop {
            let source = prompt(attempt)?;
            match self.mount(bottle, source).await {
                Err(err) if err.is_recoverable() && attempt < attempts => {
                    warn!("attempt {attempt}/{attempts} failed: {err}");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Track `child` for signal cleanup and wait for it to exit.
    ///
    /// A child the coordinator refuses to track is killed and reaped before
    /// the error is returned.
    pub async fn wait_for_app(&mut self, mut child: Child) -> BottleResult<ExitStatus> {
        let registered = self
            .coordinator
            .register_child(Box::new(ProcessHandle::new(child.id())));
        if let Err(err) = registered {
            warn!("stopping untracked app pid {}: {err}", child.id());
            if let Err(kill) = child.kill() {
                warn!("could not kill pid {}: {kill}", child.id());
            }
            self.dispatch(move || SessionEvent::AppExited(child.wait()));
            if let Ok(SessionEvent::AppExited(Err(reap))) = self.next_event().await {
                warn!("could not reap untracked app: {reap}");
            }
            return Err(err);
        }
        self.dispatch(move || SessionEvent::AppExited(child.wait()));
        let event = self.next_event().await;
        self.coordinator.clear_child();
        match event? {
            SessionEvent::AppExited(status) => Ok(status?),
            other => Err(unexpected(other)),
        }
    }

    /// Unmount and lock whatever the coordinator tracks.
    pub async fn release(&mut self) -> BottleResult<()> {
        let coordinator = Arc::clone(&self.coordinator);
        self.dispatch(move || SessionEvent::Released(coordinator.release()));
        match self.next_event().await? {
            SessionEvent::Released(result) => result,
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(event: SessionEvent) -> BottleError {
    BottleError::tool("session", format!("unexpected {} event", event.name()))
}
