//! Termination-signal watcher.

use bottle_core::error::BottleError;
use bottle_core::{LifecycleCoordinator, TerminationSignal};
use bottle_provider::VolumeManager;
use log::{error, warn};
use std::io;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

/// Wait for SIGINT, SIGTERM, SIGHUP or SIGQUIT, run coordinator cleanup,
/// then exit with 128 + signal number.
pub fn spawn_watcher<V>(coordinator: Arc<LifecycleCoordinator<V>>) -> io::Result<JoinHandle<()>>
where
    V: VolumeManager<Error = BottleError> + Send + Sync + 'static,
{
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            _ = interrupt.recv() => TerminationSignal::Interrupt,
            _ = terminate.recv() => TerminationSignal::Terminate,
            _ = hangup.recv() => TerminationSignal::Hangup,
            _ = quit.recv() => TerminationSignal::Quit,
        };
        warn!("received {}; cleaning up", received.name());

        match tokio::task::spawn_blocking(move || coordinator.cleanup()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!("cleanup failed: {err}"),
            Err(err) => error!("cleanup task failed: {err}"),
        }
        std::process::exit(received.exit_code());
    }))
}
