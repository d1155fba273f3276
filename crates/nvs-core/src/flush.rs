//! Incremental write-back of dirty lines.
//!
//! Each [`FlushScheduler::tick`] performs at most one write transaction:
//! the lowest run of consecutive dirty lines, capped at the configured
//! maximum. A barrier is issued once nothing is dirty. Device errors never
//! reach accessor callers; the run stays dirty and the next tick retries
//! with a freshly opened handle.

use crate::NvStorage;
use nvs_device::{DeviceHandle, OpenMode, PersistentDevice, write_all_at};
use nvs_types::LineRun;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Storage has not been initialized yet.
    NotReady,
    /// Nothing dirty and nothing awaiting a barrier.
    Idle,
    /// The write handle could not be opened; nothing changed.
    OpenFailed,
    /// `run` was written. `synced` is set when it was the last dirty run
    /// and the barrier succeeded.
    Wrote { run: LineRun, synced: bool },
    /// Writing `run` failed; its lines are dirty again.
    WriteFailed { run: LineRun },
    /// A barrier deferred by an earlier failure went through.
    Synced,
    /// The barrier failed. `run` is the run written in the same tick, if
    /// any. The barrier is retried on a later tick.
    SyncFailed { run: Option<LineRun> },
}

impl TickOutcome {
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::OpenFailed | Self::WriteFailed { .. } | Self::SyncFailed { .. }
        )
    }
}

/// The single flush context of an [`NvStorage`].
///
/// Obtained from [`NvStorage::flush_scheduler`]; dropping it closes the
/// write handle and lets another scheduler attach.
pub struct FlushScheduler<D: PersistentDevice> {
    storage: Arc<NvStorage<D>>,
    handle: Option<Box<dyn DeviceHandle>>,
    scratch: Vec<u8>,
    pending_sync: bool,
}

impl<D: PersistentDevice> std::fmt::Debug for FlushScheduler<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("handle_open", &self.handle.is_some())
            .field("pending_sync", &self.pending_sync)
            .finish_non_exhaustive()
    }
}

impl<D: PersistentDevice> FlushScheduler<D> {
    pub(crate) fn new(storage: Arc<NvStorage<D>>) -> Self {
        let geometry = storage.geometry();
        let scratch = vec![0_u8; geometry.max_write_bytes()];
        Self {
            storage,
            handle: None,
            scratch,
            pending_sync: false,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<NvStorage<D>> {
        &self.storage
    }

    #[must_use]
    pub fn has_open_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether a barrier is owed for data already written.
    #[must_use]
    pub fn sync_pending(&self) -> bool {
        self.pending_sync
    }

    /// Run one bounded flush step.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.storage.is_ready() {
            return TickOutcome::NotReady;
        }
        let Some(first) = self.storage.dirty().first_dirty() else {
            if self.pending_sync {
                return self.retry_sync();
            }
            return TickOutcome::Idle;
        };

        let metrics = self.storage.flush_metrics();
        metrics.record_tick();
        let geometry = self.storage.geometry();

        if self.handle.is_none() {
            match self.storage.device().open(OpenMode::WriteOnly) {
                Ok(handle) => {
                    metrics.record_open();
                    self.handle = Some(handle);
                }
                Err(err) => {
                    metrics.record_error();
                    warn!(error = %err, "failed to open storage device for flush");
                    return TickOutcome::OpenFailed;
                }
            }
        }
        let Some(handle) = self.handle.as_mut() else {
            return TickOutcome::OpenFailed;
        };

        let run = self
            .storage
            .dirty()
            .run_from(first, geometry.max_write_lines());
        let range = run.byte_range(geometry.line_size(), geometry.storage_size());
        let len = range.len();
        let offset = range.start as u64;

        // Clear before copying: a write landing after the copy re-marks
        // the line and is picked up by a later tick.
        self.storage.dirty().clear(run);
        self.storage.mirror().copy_range(range, &mut self.scratch);

        if let Err(err) = write_all_at(handle.as_mut(), offset, &self.scratch[..len]) {
            self.storage.dirty().mark(run);
            self.handle = None;
            metrics.record_error();
            warn!(%run, offset, len, error = %err, "flush write failed; run stays dirty");
            return TickOutcome::WriteFailed { run };
        }
        metrics.record_write(len);
        self.pending_sync = true;
        debug!(%run, offset, len, "flushed dirty run");

        if !self.storage.dirty().is_clean() {
            return TickOutcome::Wrote { run, synced: false };
        }
        if self.sync() {
            TickOutcome::Wrote { run, synced: true }
        } else {
            TickOutcome::SyncFailed { run: Some(run) }
        }
    }

    /// Tick until nothing is dirty and no barrier is owed, or until
    /// `max_ticks` ticks have run. Returns the number of ticks used.
    pub fn drain(&mut self, max_ticks: usize) -> usize {
        let mut used = 0;
        while used < max_ticks && (!self.storage.dirty().is_clean() || self.pending_sync) {
            let outcome = self.tick();
            used += 1;
            if outcome == TickOutcome::NotReady {
                break;
            }
        }
        used
    }

    fn retry_sync(&mut self) -> TickOutcome {
        if self.handle.is_none() {
            match self.storage.device().open(OpenMode::WriteOnly) {
                Ok(handle) => {
                    self.storage.flush_metrics().record_open();
                    self.handle = Some(handle);
                }
                Err(err) => {
                    self.storage.flush_metrics().record_error();
                    warn!(error = %err, "failed to reopen storage device for barrier");
                    return TickOutcome::OpenFailed;
                }
            }
        }
        if self.sync() {
            TickOutcome::Synced
        } else {
            TickOutcome::SyncFailed { run: None }
        }
    }

    /// Issue the barrier on the open handle. Returns whether it succeeded.
    fn sync(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        let metrics = self.storage.flush_metrics();
        match handle.sync() {
            Ok(()) => {
                metrics.record_sync();
                self.pending_sync = false;
                trace!("storage barrier complete");
                true
            }
            Err(err) => {
                self.handle = None;
                metrics.record_error();
                warn!(error = %err, "storage barrier failed; will retry");
                false
            }
        }
    }
}

impl<D: PersistentDevice> Drop for FlushScheduler<D> {
    fn drop(&mut self) {
        self.handle = None;
        self.storage.detach_scheduler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PanicOnFatal, StorageConfig};
    use nvs_device::{Fault, MemoryDevice, WriteRecord};
    use nvs_types::LineIndex;

    fn attached() -> (Arc<NvStorage<MemoryDevice>>, FlushScheduler<MemoryDevice>, MemoryDevice) {
        let dev = MemoryDevice::new(8192);
        let storage = Arc::new(
            NvStorage::new(&StorageConfig::default(), dev.clone())
                .unwrap()
                .with_fatal_handler(PanicOnFatal),
        );
        storage.initialize();
        dev.clear_write_log();
        let scheduler = storage.flush_scheduler().unwrap();
        (storage, scheduler, dev)
    }

    fn run(first: usize, count: usize) -> LineRun {
        LineRun::new(LineIndex(first), count)
    }

    #[test]
    fn tick_before_init_does_nothing() {
        let storage = Arc::new(
            NvStorage::new(&StorageConfig::default(), MemoryDevice::new(8192)).unwrap(),
        );
        let mut scheduler = storage.flush_scheduler().unwrap();
        assert_eq!(scheduler.tick(), TickOutcome::NotReady);
        assert!(!scheduler.has_open_handle());
    }

    #[test]
    fn clean_storage_is_idle() {
        let (_storage, mut scheduler, dev) = attached();
        assert_eq!(scheduler.tick(), TickOutcome::Idle);
        assert!(!scheduler.has_open_handle());
        assert!(dev.write_log().is_empty());
    }

    #[test]
    fn single_line_is_written_and_synced() {
        let (storage, mut scheduler, dev) = attached();
        storage.write_block(130, &[1, 2, 3, 4]);
        assert_eq!(
            scheduler.tick(),
            TickOutcome::Wrote {
                run: run(1, 1),
                synced: true
            }
        );
        assert_eq!(dev.write_log(), vec![WriteRecord { offset: 128, len: 128 }]);
        assert_eq!(dev.read_range(130, 4), vec![1, 2, 3, 4]);
        assert_eq!(storage.dirty_line_count(), 0);
        assert!(scheduler.has_open_handle());
        assert_eq!(scheduler.tick(), TickOutcome::Idle);
    }

    #[test]
    fn runs_are_capped_and_lowest_first() {
        let (storage, mut scheduler, dev) = attached();
        storage.write_block(0, &[0xAB; 128 * 6]);
        storage.write_byte(20 * 128, 1);

        assert_eq!(
            scheduler.tick(),
            TickOutcome::Wrote {
                run: run(0, 4),
                synced: false
            }
        );
        assert_eq!(
            scheduler.tick(),
            TickOutcome::Wrote {
                run: run(4, 2),
                synced: false
            }
        );
        assert_eq!(
            scheduler.tick(),
            TickOutcome::Wrote {
                run: run(20, 1),
                synced: true
            }
        );
        assert_eq!(dev.write_log().len(), 3);
        assert_eq!(dev.write_log()[0].len, 512);
        assert_eq!(dev.sync_count(), 2, "one barrier at init, one after drain");
    }

    #[test]
    fn failed_write_restores_run_and_reopens() {
        let (storage, mut scheduler, dev) = attached();
        storage.write_block(128 * 3, &[7; 200]);
        dev.inject(Fault::ShortWrite);

        assert_eq!(scheduler.tick(), TickOutcome::WriteFailed { run: run(3, 2) });
        assert!(!scheduler.has_open_handle());
        assert!(storage.is_line_dirty(LineIndex(3)));
        assert!(storage.is_line_dirty(LineIndex(4)));
        assert_eq!(storage.dirty_line_count(), 2);

        assert_eq!(
            scheduler.tick(),
            TickOutcome::Wrote {
                run: run(3, 2),
                synced: true
            }
        );
        assert_eq!(dev.read_range(128 * 3, 200), vec![7; 200]);
        assert_eq!(storage.metrics().errors, 1);
        assert_eq!(storage.metrics().handle_opens, 2);
    }

    #[test]
    fn seek_mismatch_is_a_failed_write() {
        let (storage, mut scheduler, dev) = attached();
        storage.write_byte(5, 9);
        dev.inject(Fault::Seek);
        assert_eq!(scheduler.tick(), TickOutcome::WriteFailed { run: run(0, 1) });
        assert!(dev.write_log().is_empty());
        assert!(storage.is_line_dirty(LineIndex(0)));
    }

    #[test]
    fn open_failure_leaves_tracker_alone() {
        let (storage, mut scheduler, dev) = attached();
        storage.write_byte(5, 9);
        dev.inject(Fault::Open);
        assert_eq!(scheduler.tick(), TickOutcome::OpenFailed);
        assert_eq!(storage.dirty_line_count(), 1);
        assert_eq!(
            scheduler.tick(),
            TickOutcome::Wrote {
                run: run(0, 1),
                synced: true
            }
        );
    }

    #[test]
    fn failed_barrier_is_retried() {
        let (storage, mut scheduler, dev) = attached();
        storage.write_byte(5, 9);
        dev.inject(Fault::Sync);
        assert_eq!(
            scheduler.tick(),
            TickOutcome::SyncFailed {
                run: Some(run(0, 1))
            }
        );
        assert_eq!(storage.dirty_line_count(), 0);
        assert!(scheduler.sync_pending());
        assert!(!scheduler.has_open_handle());

        assert_eq!(scheduler.tick(), TickOutcome::Synced);
        assert!(!scheduler.sync_pending());
        assert_eq!(scheduler.tick(), TickOutcome::Idle);
    }

    #[test]
    fn write_during_flush_is_not_lost() {
        let (storage, mut scheduler, dev) = attached();
        storage.write_byte(0, 1);
        assert!(matches!(scheduler.tick(), TickOutcome::Wrote { .. }));
        storage.write_byte(0, 2);
        assert!(storage.is_line_dirty(LineIndex(0)));
        scheduler.drain(4);
        assert_eq!(dev.read_range(0, 1), vec![2]);
    }

    #[test]
    fn drain_reports_ticks_used() {
        let (storage, mut scheduler, _dev) = attached();
        for line in (0..32).step_by(2) {
            storage.write_byte(line * 128, 1);
        }
        assert_eq!(scheduler.drain(100), 16);
        assert_eq!(storage.dirty_line_count(), 0);
        assert_eq!(scheduler.drain(100), 0);
    }

    #[test]
    fn drain_respects_budget() {
        let (storage, mut scheduler, _dev) = attached();
        storage.write_block(0, &[1; 4096]);
        assert_eq!(scheduler.drain(3), 3);
        assert_eq!(storage.dirty_line_count(), 32 - 12);
    }
}
