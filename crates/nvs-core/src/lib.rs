#![forbid(unsafe_code)]
//! Mirrored, incrementally flushed parameter storage.
//!
//! [`NvStorage`] keeps the whole storage image in memory. Accessors read
//! and write the mirror and never touch the device, except for the
//! one-time bring-up (and legacy migration) triggered by the first access.
//! Writes mark fixed-size lines dirty; a single [`FlushScheduler`], driven
//! by a periodic tick or by a [`FlushDaemon`], writes at most one bounded
//! run of dirty lines back to the device per tick.
//!
//! # Concurrency
//!
//! Any number of threads may call the accessors through an
//! `Arc<NvStorage<_>>`. Exactly one flush scheduler can be attached at a
//! time; it owns the write handle. The mirror is guarded by a
//! reader/writer lock and the dirty bitset is atomic, so no interleaving
//! of writes and flush ticks loses a write.

pub mod config;
pub mod daemon;
pub mod dirty;
pub mod fatal;
pub mod flush;
pub mod metrics;
pub mod migrate;
pub mod mirror;

pub use config::StorageConfig;
pub use daemon::{FlushDaemon, FlushDaemonConfig};
pub use dirty::DirtyLines;
pub use fatal::{AbortOnFatal, FatalHandler, PanicOnFatal};
pub use flush::{FlushScheduler, TickOutcome};
pub use metrics::{FlushMetrics, FlushMetricsSnapshot};
pub use migrate::{DeviceProbe, InitReport};
pub use mirror::MirrorBuffer;
pub use nvs_device::{
    DeviceHandle, FileDevice, FileLegacyStore, LegacyStore, MemoryDevice, MemoryLegacyStore,
    OpenMode, PersistentDevice,
};
pub use nvs_error::{NvsError, Result};
pub use nvs_types::{LineIndex, LineRun, LineSize, Signature, StorageGeometry};

use migrate::Migration;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Ready,
}

/// The storage service.
pub struct NvStorage<D: PersistentDevice> {
    config: StorageConfig,
    geometry: StorageGeometry,
    device: D,
    legacy: Option<Box<dyn LegacyStore>>,
    fatal: Box<dyn FatalHandler>,
    mirror: MirrorBuffer,
    dirty: DirtyLines,
    ready: AtomicBool,
    init: Mutex<Option<InitReport>>,
    scheduler_attached: AtomicBool,
    metrics: FlushMetrics,
}

impl<D: PersistentDevice> std::fmt::Debug for NvStorage<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvStorage")
            .field("device", &self.device.describe())
            .field("geometry", &self.geometry)
            .field("state", &self.state())
            .field("dirty_lines", &self.dirty.count())
            .finish_non_exhaustive()
    }
}

impl NvStorage<FileDevice> {
    /// Build a file-backed instance from the configured device and legacy
    /// paths.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let mut storage = Self::new(config, FileDevice::new(&config.device_path))?;
        if let Some(legacy_path) = &config.legacy_path {
            let mut legacy = FileLegacyStore::new(legacy_path);
            if let Some(archive_path) = config.legacy_archive_path() {
                legacy = legacy.with_archive_path(archive_path);
            }
            storage = storage.with_legacy(legacy);
        }
        Ok(storage)
    }
}

impl<D: PersistentDevice> NvStorage<D> {
    /// Validate `config` and build an uninitialized instance over `device`.
    ///
    /// Fatal errors abort the process unless another handler is installed
    /// with [`NvStorage::with_fatal_handler`].
    pub fn new(config: &StorageConfig, device: D) -> Result<Self> {
        let geometry = config.geometry()?;
        Ok(Self {
            config: config.clone(),
            geometry,
            device,
            legacy: None,
            fatal: Box::new(AbortOnFatal),
            mirror: MirrorBuffer::new(geometry.storage_size()),
            dirty: DirtyLines::new(geometry.line_count()),
            ready: AtomicBool::new(false),
            init: Mutex::new(None),
            scheduler_attached: AtomicBool::new(false),
            metrics: FlushMetrics::new(),
        })
    }

    #[must_use]
    pub fn with_legacy(mut self, legacy: impl LegacyStore + 'static) -> Self {
        self.legacy = Some(Box::new(legacy));
        self
    }

    #[must_use]
    pub fn with_fatal_handler(mut self, fatal: impl FatalHandler + 'static) -> Self {
        self.fatal = Box::new(fatal);
        self
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[must_use]
    pub fn geometry(&self) -> StorageGeometry {
        self.geometry
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub fn state(&self) -> InitState {
        if self.is_ready() {
            InitState::Ready
        } else {
            InitState::Uninitialized
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// What bring-up did, once it has run.
    #[must_use]
    pub fn init_report(&self) -> Option<InitReport> {
        *self.init.lock()
    }

    /// Bring the storage up, halting through the fatal handler on failure.
    /// Later calls return the first report without touching the device.
    pub fn initialize(&self) -> InitReport {
        match self.try_initialize() {
            Ok(report) => report,
            Err(err) => self.fatal.halt(&err),
        }
    }

    /// Bring the storage up, returning bring-up failures instead of halting.
    ///
    /// A failed attempt leaves the instance uninitialized; accessors will
    /// retry bring-up and halt if it fails again.
    pub fn try_initialize(&self) -> Result<InitReport> {
        let mut init = self.init.lock();
        if let Some(report) = *init {
            return Ok(report);
        }

        let migration = self.migration();
        let report = self.mirror.fill_with(|image| migration.run(image))?;

        self.dirty.clear_all();
        *init = Some(report);
        self.ready.store(true, Ordering::Release);
        info!(device = %self.device.describe(), ?report, "storage ready");
        Ok(report)
    }

    /// Look at the device and legacy store without initializing.
    pub fn probe(&self) -> Result<DeviceProbe> {
        self.migration().probe()
    }

    fn migration(&self) -> Migration<'_> {
        Migration {
            device: &self.device,
            legacy: self.legacy.as_deref(),
            geometry: self.geometry,
            signature: self.config.signature,
            signature_offset: self.config.signature_offset,
            archive_legacy: self.config.archive_legacy_on_migrate,
        }
    }

    fn ensure_ready(&self) {
        if !self.is_ready() {
            let _ = self.initialize();
        }
    }

    /// Attach the flush scheduler. Only one may be attached at a time;
    /// dropping it detaches.
    pub fn flush_scheduler(self: &Arc<Self>) -> Result<FlushScheduler<D>> {
        self.scheduler_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| NvsError::FlushSchedulerActive)?;
        Ok(FlushScheduler::new(Arc::clone(self)))
    }

    pub(crate) fn detach_scheduler(&self) {
        self.scheduler_attached.store(false, Ordering::Release);
    }

    pub(crate) fn mirror(&self) -> &MirrorBuffer {
        &self.mirror
    }

    pub(crate) fn dirty(&self) -> &DirtyLines {
        &self.dirty
    }

    pub(crate) fn flush_metrics(&self) -> &FlushMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn metrics(&self) -> FlushMetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn dirty_line_count(&self) -> usize {
        self.dirty.count()
    }

    #[must_use]
    pub fn is_line_dirty(&self, line: LineIndex) -> bool {
        self.dirty.is_dirty(line)
    }

    /// Copy of the whole mirror image.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.ensure_ready();
        self.mirror.snapshot()
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Byte at `offset`, or 0 when out of range.
    #[must_use]
    pub fn read_byte(&self, offset: usize) -> u8 {
        let mut buf = [0_u8; 1];
        self.read_block(offset, &mut buf);
        buf[0]
    }

    /// Little-endian `u16` at `offset`, or 0 when out of range.
    #[must_use]
    pub fn read_word(&self, offset: usize) -> u16 {
        let mut buf = [0_u8; 2];
        self.read_block(offset, &mut buf);
        u16::from_le_bytes(buf)
    }

    /// Little-endian `u32` at `offset`, or 0 when out of range.
    #[must_use]
    pub fn read_dword(&self, offset: usize) -> u32 {
        let mut buf = [0_u8; 4];
        self.read_block(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Fill `dst` from `offset`. Returns `false` and leaves `dst` untouched
    /// when the range does not fit inside the image.
    pub fn read_block(&self, offset: usize, dst: &mut [u8]) -> bool {
        if !self.geometry.contains(offset, dst.len()) {
            return false;
        }
        if dst.is_empty() {
            return true;
        }
        self.ensure_ready();
        self.mirror.read_into(offset, dst);
        true
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    pub fn write_byte(&self, offset: usize, value: u8) {
        self.write_block(offset, &[value]);
    }

    pub fn write_word(&self, offset: usize, value: u16) {
        self.write_block(offset, &value.to_le_bytes());
    }

    pub fn write_dword(&self, offset: usize, value: u32) {
        self.write_block(offset, &value.to_le_bytes());
    }

    /// Copy `src` to `offset`. Out-of-range writes are ignored, and writes
    /// that do not change the image mark nothing dirty.
    pub fn write_block(&self, offset: usize, src: &[u8]) {
        let Some(lines) = self.geometry.lines_for(offset, src.len()) else {
            return;
        };
        self.ensure_ready();
        if self.mirror.update(offset, src) {
            // Mark after the bytes land: the flusher clears before it copies.
            self.dirty.mark(lines);
            trace!(offset, len = src.len(), %lines, "marked dirty");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvs_types::{DEFAULT_SIGNATURE, DEFAULT_SIGNATURE_OFFSET};

    fn storage() -> NvStorage<MemoryDevice> {
        NvStorage::new(&StorageConfig::default(), MemoryDevice::new(8192))
            .unwrap()
            .with_fatal_handler(PanicOnFatal)
    }

    #[test]
    fn first_access_initializes() {
        let store = storage();
        assert_eq!(store.state(), InitState::Uninitialized);
        assert_eq!(store.read_byte(0), 0);
        assert_eq!(store.state(), InitState::Ready);
        assert_eq!(store.init_report(), Some(InitReport::Stamped));
        assert_eq!(
            store.device().read_range(DEFAULT_SIGNATURE_OFFSET as usize, 4),
            DEFAULT_SIGNATURE.to_bytes()
        );
    }

    #[test]
    fn oversized_write_run_is_rejected_at_construction() {
        let config = StorageConfig {
            max_write_lines: usize::MAX,
            ..StorageConfig::default()
        };
        let err = NvStorage::new(&config, MemoryDevice::new(8192)).err();
        assert!(matches!(err, Some(NvsError::InvalidConfig(_))));

        let store = storage();
        assert_eq!(store.config().max_write_lines, 4);
        assert_eq!(store.geometry().max_write_bytes(), 512);
    }

    #[test]
    fn out_of_range_reads_do_not_initialize() {
        let store = storage();
        assert_eq!(store.read_dword(4094), 0);
        let mut dst = [0xAA_u8; 10];
        assert!(!store.read_block(4090, &mut dst));
        assert_eq!(dst, [0xAA; 10]);
        assert_eq!(store.state(), InitState::Uninitialized);
    }

    #[test]
    fn initialize_is_idempotent() {
        let store = storage();
        assert_eq!(store.initialize(), InitReport::Stamped);
        store.device().poke(0, &[0x42]);
        assert_eq!(store.initialize(), InitReport::Stamped);
        assert_eq!(store.read_byte(0), 0, "second initialize must not reload");
        assert_eq!(store.device().open_count(), 3);
    }

    #[test]
    fn scalar_round_trips_are_little_endian() {
        let store = storage();
        store.write_word(10, 0xBEEF);
        store.write_dword(20, 0xDEAD_BEEF);
        store.write_byte(4095, 0x7F);
        assert_eq!(store.read_word(10), 0xBEEF);
        assert_eq!(store.read_byte(10), 0xEF);
        assert_eq!(store.read_dword(20), 0xDEAD_BEEF);
        assert_eq!(store.read_byte(4095), 0x7F);
    }

    #[test]
    fn identical_writes_mark_nothing() {
        let store = storage();
        store.write_dword(64, 0);
        assert_eq!(store.dirty_line_count(), 0);
        store.write_dword(64, 7);
        assert_eq!(store.dirty_line_count(), 1);
    }

    #[test]
    fn four_bytes_at_130_dirty_only_line_one() {
        let store = storage();
        store.write_block(130, &[1, 2, 3, 4]);
        assert_eq!(store.dirty_line_count(), 1);
        assert!(store.is_line_dirty(LineIndex(1)));
    }

    #[test]
    fn write_crossing_end_changes_nothing() {
        let store = storage();
        store.initialize();
        let before = store.snapshot();
        store.write_block(4090, &[0x55; 10]);
        store.write_dword(4093, 0xFFFF_FFFF);
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.dirty_line_count(), 0);
    }

    #[test]
    fn write_compares_against_loaded_image() {
        let dev = MemoryDevice::new(8192);
        dev.poke(DEFAULT_SIGNATURE_OFFSET as usize, &DEFAULT_SIGNATURE.to_bytes());
        dev.poke(300, &[9]);
        let store = NvStorage::new(&StorageConfig::default(), dev)
            .unwrap()
            .with_fatal_handler(PanicOnFatal);
        store.write_byte(300, 0);
        assert_eq!(store.read_byte(300), 0);
        assert!(store.is_line_dirty(LineIndex(2)));
    }

    #[test]
    #[should_panic(expected = "fatal storage error")]
    fn missing_device_is_fatal_on_first_access() {
        let dev = MemoryDevice::new(8192);
        dev.set_present(false);
        let store = NvStorage::new(&StorageConfig::default(), dev)
            .unwrap()
            .with_fatal_handler(PanicOnFatal);
        let _ = store.read_byte(0);
    }

    #[test]
    fn try_initialize_surfaces_errors_and_can_retry() {
        let dev = MemoryDevice::new(8192);
        dev.inject(nvs_device::Fault::Read);
        let store = NvStorage::new(&StorageConfig::default(), dev)
            .unwrap()
            .with_fatal_handler(PanicOnFatal);
        assert!(store.try_initialize().is_err());
        assert_eq!(store.state(), InitState::Uninitialized);
        assert_eq!(store.try_initialize().unwrap(), InitReport::Stamped);
    }

    #[test]
    fn only_one_scheduler_attaches() {
        let store = Arc::new(storage());
        let first = store.flush_scheduler().unwrap();
        assert!(matches!(
            store.flush_scheduler(),
            Err(NvsError::FlushSchedulerActive)
        ));
        drop(first);
        assert!(store.flush_scheduler().is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = StorageConfig {
            line_size: 3,
            ..StorageConfig::default()
        };
        assert!(NvStorage::new(&config, MemoryDevice::new(8192)).is_err());
    }
}
