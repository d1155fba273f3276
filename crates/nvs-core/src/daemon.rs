//! Background thread that ticks the flush scheduler at a fixed period.

use crate::{FlushScheduler, NvStorage};
use nvs_device::PersistentDevice;
use nvs_error::{NvsError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const THREAD_NAME: &str = "nvs-flush";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushDaemonConfig {
    /// Period between ticks.
    pub interval: Duration,
    /// Tick budget for the final drain on shutdown.
    pub shutdown_drain_ticks: usize,
}

impl Default for FlushDaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1),
            shutdown_drain_ticks: 1024,
        }
    }
}

/// Owns the flush scheduler of one storage instance and ticks it from a
/// dedicated thread until shut down.
pub struct FlushDaemon<D: PersistentDevice + 'static> {
    storage: Arc<NvStorage<D>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<FlushScheduler<D>>>,
    config: FlushDaemonConfig,
}

impl<D: PersistentDevice + 'static> std::fmt::Debug for FlushDaemon<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushDaemon")
            .field("config", &self.config)
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl<D: PersistentDevice + 'static> FlushDaemon<D> {
    /// Attach the flush scheduler of `storage` and start ticking it.
    ///
    /// Fails with [`NvsError::FlushSchedulerActive`] if a scheduler is
    /// already attached.
    pub fn start(storage: &Arc<NvStorage<D>>, config: FlushDaemonConfig) -> Result<Self> {
        if config.interval.is_zero() {
            return Err(NvsError::InvalidConfig(
                "flush interval must be non-zero".to_owned(),
            ));
        }
        let mut scheduler = storage.flush_scheduler()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let interval = config.interval;

        let worker = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || {
                debug!(?interval, "flush thread started");
                while !stop.load(Ordering::Acquire) {
                    let outcome = scheduler.tick();
                    if outcome.is_error() {
                        debug!(?outcome, "flush tick failed");
                    }
                    thread::park_timeout(interval);
                }
                debug!("flush thread stopping");
                scheduler
            })?;

        info!(?interval, "flush daemon started");
        Ok(Self {
            storage: Arc::clone(storage),
            shutdown,
            worker: Some(worker),
            config,
        })
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<NvStorage<D>> {
        &self.storage
    }

    /// Stop the thread, then drain what is still dirty with at most
    /// `shutdown_drain_ticks` ticks. Returns the number of lines left dirty.
    pub fn shutdown(mut self) -> usize {
        let Some(mut scheduler) = self.stop() else {
            return self.storage.dirty_line_count();
        };
        let ticks = scheduler.drain(self.config.shutdown_drain_ticks);
        let remaining = self.storage.dirty_line_count();
        if remaining == 0 {
            info!(ticks, "flush daemon stopped; storage clean");
        } else {
            warn!(ticks, remaining, "flush daemon stopped with dirty lines");
        }
        remaining
    }

    fn stop(&mut self) -> Option<FlushScheduler<D>> {
        let worker = self.worker.take()?;
        self.shutdown.store(true, Ordering::Release);
        worker.thread().unpark();
        match worker.join() {
            Ok(scheduler) => Some(scheduler),
            Err(_) => {
                error!("flush thread panicked");
                None
            }
        }
    }
}

impl<D: PersistentDevice + 'static> Drop for FlushDaemon<D> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
