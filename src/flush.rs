//! Quiescence-gated periodic flushing.
//!
//! A background thread wakes on a fixed interval and flushes every index,
//! but only when the global modification counter has not moved since the
//! previous tick and the host reports no heavy process. Bursts of updates
//! therefore batch into one flush once the engine goes quiet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::host::Host;
use crate::registry::IndexRegistry;
use crate::Result;

pub(crate) struct FlushDaemon {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl FlushDaemon {
    pub(crate) fn start(
        registry: Arc<IndexRegistry>,
        host: Arc<dyn Host>,
        mod_count: Arc<AtomicU64>,
        interval: Duration,
    ) -> Result<FlushDaemon> {
        let (shutdown, ticks) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name(String::from("findex-flush"))
            .spawn(move || {
                let mut last_seen = mod_count.load(Ordering::Relaxed);
                loop {
                    match ticks.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => (),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let current = mod_count.load(Ordering::Relaxed);
                    if current != last_seen {
                        // Still being written to; try again next tick.
                        last_seen = current;
                        continue;
                    }
                    if host.is_heavy_process_running() {
                        continue;
                    }
                    if let Err(error) = registry.flush_all() {
                        tracing::warn!(%error, "periodic index flush failed");
                    }
                }
            })?;
        Ok(FlushDaemon { shutdown, handle: Some(handle) })
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
