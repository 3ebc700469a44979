//! Periodic IOC health check on a background thread.

use crate::controller::{Controller, ControllerState};
use crate::error::{MptError, Result};
use crate::regio::RegisterIo;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Background thread calling [`Controller::health_check`] every
/// `periodic_interval`. Stops on [`Self::stop`], on drop, or once the
/// controller has failed.
#[derive(Debug)]
pub struct HealthMonitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Start watching `controller`.
    ///
    /// # Errors
    ///
    /// Returns [`MptError::Io`] if the thread cannot be spawned.
    pub fn spawn<R: RegisterIo + 'static>(controller: Arc<Controller<R>>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let interval = controller.config().periodic_interval;
        let handle = thread::Builder::new()
            .name("mpt-health".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                if let Err(e) = controller.health_check() {
                    tracing::error!("health check: {e}");
                }
                if controller.state() == ControllerState::Failed {
                    tracing::warn!("controller failed, health monitor exiting");
                    break;
                }
            })
            .map_err(|source| MptError::Io { source })?;
        Ok(Self {
            stop: Some(tx),
            handle: Some(handle),
        })
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                tracing::error!("health monitor thread panicked");
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
