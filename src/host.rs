//! The host collaborator: dumb-mode signalling, cancellation and the
//! heavy-process gate consulted by the flush loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::{Error, Result};

pub trait Host: Send + Sync + 'static {
    /// While dumb, indices may be incomplete and queries either wait or fail
    /// with [`Error::NotReady`].
    fn is_dumb(&self) -> bool {
        false
    }

    /// Blocks until the host leaves dumb mode.
    fn wait_for_smart(&self) {}

    /// Polled by every long-running loop; returning [`Error::Cancelled`]
    /// makes the engine drop the in-flight work without losing scheduled
    /// files.
    fn check_cancelled(&self) -> Result<()> {
        Ok(())
    }

    fn is_heavy_process_running(&self) -> bool {
        false
    }
}

/// The default host: always smart, never cancels.
pub struct AlwaysSmart;

impl Host for AlwaysSmart {}

/// A toggleable host for embedders that track dumb mode and cancellation
/// themselves.
pub struct HostState {
    dumb: Mutex<bool>,
    smart_again: Condvar,
    cancelled: AtomicBool,
    heavy: AtomicBool,
}

impl Default for HostState {
    fn default() -> HostState {
        HostState {
            dumb: Mutex::new(false),
            smart_again: Condvar::new(),
            cancelled: AtomicBool::new(false),
            heavy: AtomicBool::new(false),
        }
    }
}

impl HostState {
    pub fn new() -> HostState {
        HostState::default()
    }

    pub fn set_dumb(&self, dumb: bool) {
        *self.dumb.lock().unwrap() = dumb;
        if !dumb {
            self.smart_again.notify_all();
        }
    }

    pub fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::Relaxed);
    }

    pub fn set_heavy_process_running(&self, heavy: bool) {
        self.heavy.store(heavy, Ordering::Relaxed);
    }
}

impl Host for HostState {
    fn is_dumb(&self) -> bool {
        *self.dumb.lock().unwrap()
    }

    fn wait_for_smart(&self) {
        let mut dumb = self.dumb.lock().unwrap();
        while *dumb {
            dumb = self.smart_again.wait(dumb).unwrap();
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn is_heavy_process_running(&self) -> bool {
        self.heavy.load(Ordering::Relaxed)
    }
}
