use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Stop flag plus a coalescing wakeup shared between a background service and
/// whoever drives it. Several wakeups before the service next waits collapse
/// into one.
pub(crate) struct ServiceControl {
    name: &'static str,
    stopped: AtomicBool,
    wake_tx: SyncSender<()>,
    wake_rx: Mutex<Receiver<()>>,
}

impl ServiceControl {
    pub(crate) fn new(name: &'static str) -> Arc<Self> {
        let (wake_tx, wake_rx) = mpsc::sync_channel(1);
        Arc::new(Self {
            name,
            stopped: AtomicBool::new(false),
            wake_tx,
            wake_rx: Mutex::new(wake_rx),
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup();
    }

    pub(crate) fn wakeup(&self) {
        if let Err(TrySendError::Disconnected(())) = self.wake_tx.try_send(()) {
            debug!(service = self.name, "wakeup after the service went away");
        }
    }

    /// Sleep until woken or `interval` elapses. Returns whether a wakeup arrived.
    pub(crate) fn wait_for_running(&self, interval: Duration) -> bool {
        let rx = match self.wake_rx.lock() {
            Ok(rx) => rx,
            Err(poisoned) => poisoned.into_inner(),
        };
        match rx.recv_timeout(interval) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                drop(rx);
                std::thread::sleep(interval);
                false
            }
        }
    }
}

/// A running background service thread.
pub(crate) struct ServiceHandle {
    control: Arc<ServiceControl>,
    join: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    pub(crate) fn spawn<F>(control: Arc<ServiceControl>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Arc<ServiceControl>) + Send + 'static,
    {
        let ctl = Arc::clone(&control);
        let join = std::thread::Builder::new()
            .name(control.name().to_string())
            .spawn(move || {
                debug!(service = ctl.name(), "service started");
                let name = ctl.name();
                body(ctl);
                debug!(service = name, "service stopped");
            })?;
        Ok(Self {
            control,
            join: Some(join),
        })
    }

    pub(crate) fn control(&self) -> &Arc<ServiceControl> {
        &self.control
    }

    pub(crate) fn wakeup(&self) {
        self.control.wakeup();
    }

    pub(crate) fn shutdown(&mut self) {
        self.control.stop();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(service = self.control.name(), "service thread panicked");
            }
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
