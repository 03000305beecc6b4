use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// One-shot broadcast flag. Once fired it stays fired.
#[derive(Debug, Default)]
pub struct Signal {
    fired: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let mut notified = pin!(self.notify.notified());
            // Register before checking the flag so a concurrent `fire` cannot be missed.
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

/// Run-wide stop request. The first reason wins.
#[derive(Debug, Default)]
pub struct RunControl {
    stop: Signal,
    reason: Mutex<Option<String>>,
}

impl RunControl {
    /// Returns `true` if this call initiated the stop.
    pub fn request_stop(&self, reason: impl Into<String>) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return false;
            }
            let reason = reason.into();
            log::info!("stopping run: {reason}");
            *slot = Some(reason);
        }
        self.stop.fire();
        true
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_fired()
    }

    pub async fn stopped(&self) {
        self.stop.wait().await;
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// Host-side handle that stops a running test.
#[derive(Debug, Clone)]
pub struct StopHandle {
    control: Arc<RunControl>,
}

impl StopHandle {
    pub(crate) fn new(control: Arc<RunControl>) -> Self {
        Self { control }
    }

    pub fn stop(&self, reason: impl Into<String>) {
        self.control.request_stop(reason);
    }

    pub fn is_stopping(&self) -> bool {
        self.control.is_stopping()
    }
}
