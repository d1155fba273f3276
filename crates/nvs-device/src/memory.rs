//! In-memory device doubles.
//!
//! [`MemoryDevice`] simulates a fixed-size device node. Clones share the
//! same backing bytes, so a test can hand one clone to the storage service
//! and inspect the "persisted" content through another. One-shot faults
//! can be queued with [`MemoryDevice::inject`]; each fires on the next
//! matching operation from any handle and is then consumed.

use crate::{DeviceHandle, LegacyStore, OpenMode, PersistentDevice};
use nvs_error::{NvsError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Failure modes a [`MemoryDevice`] can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `open` fails.
    Open,
    /// `seek` lands one byte past the requested offset.
    Seek,
    /// `read` fails.
    Read,
    /// `write` fails without transferring anything.
    Write,
    /// `write` transfers only half the buffer, like an interrupted call.
    ShortWrite,
    /// `sync` fails.
    Sync,
}

/// One completed (possibly short) write, as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub offset: u64,
    pub len: usize,
}

#[derive(Debug)]
struct MemoryState {
    bytes: Vec<u8>,
    present: bool,
    pending: Vec<Fault>,
    writes: Vec<WriteRecord>,
    open_calls: usize,
    sync_calls: usize,
}

impl MemoryState {
    fn take_fault(&mut self, fault: Fault) -> bool {
        if let Some(pos) = self.pending.iter().position(|f| *f == fault) {
            let _ = self.pending.remove(pos);
            return true;
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct MemoryDevice {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDevice {
    /// Zero-filled device of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    /// Device filled with `byte`, e.g. `0xFF` for erased flash.
    #[must_use]
    pub fn filled(len: usize, byte: u8) -> Self {
        Self::from_bytes(vec![byte; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                bytes,
                present: true,
                pending: Vec::new(),
                writes: Vec::new(),
                open_calls: 0,
                sync_calls: 0,
            })),
        }
    }

    /// Simulate the device node appearing or disappearing.
    pub fn set_present(&self, present: bool) {
        self.state.lock().present = present;
    }

    /// Queue a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().pending.push(fault);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of `len` bytes at `offset`; panics if the range is out of bounds.
    #[must_use]
    pub fn read_range(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.lock().bytes[offset..offset + len].to_vec()
    }

    /// Overwrite bytes directly, bypassing handles and the write log.
    pub fn poke(&self, offset: usize, data: &[u8]) {
        self.state.lock().bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    #[must_use]
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn clear_write_log(&self) {
        self.state.lock().writes.clear();
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().open_calls
    }

    #[must_use]
    pub fn sync_count(&self) -> usize {
        self.state.lock().sync_calls
    }
}

impl PersistentDevice for MemoryDevice {
    fn exists(&self) -> bool {
        self.state.lock().present
    }

    fn open(&self, mode: OpenMode) -> Result<Box<dyn DeviceHandle>> {
        let mut state = self.state.lock();
        if !state.present {
            return Err(NvsError::DeviceMissing("memory device".to_owned()));
        }
        if state.take_fault(Fault::Open) {
            return Err(NvsError::Injected("open"));
        }
        state.open_calls += 1;
        drop(state);
        Ok(Box::new(MemoryHandle {
            state: Arc::clone(&self.state),
            mode,
            pos: 0,
        }))
    }

    fn describe(&self) -> String {
        format!("memory device ({} bytes)", self.len())
    }
}

#[derive(Debug)]
struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
    mode: OpenMode,
    pos: u64,
}

impl MemoryHandle {
    /// Clamp `[pos, pos + want)` to the device, returning the start index
    /// and the number of bytes available.
    fn span(&self, device_len: usize, want: usize) -> (usize, usize) {
        let start = usize::try_from(self.pos).unwrap_or(usize::MAX).min(device_len);
        (start, want.min(device_len - start))
    }
}

impl DeviceHandle for MemoryHandle {
    fn seek(&mut self, offset: u64) -> Result<u64> {
        let landed = if self.state.lock().take_fault(Fault::Seek) {
            offset.saturating_add(1)
        } else {
            offset
        };
        self.pos = landed;
        Ok(landed)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.mode.can_read() {
            return Err(NvsError::PermissionDenied(
                "handle not opened for reading".to_owned(),
            ));
        }
        let mut state = self.state.lock();
        if state.take_fault(Fault::Read) {
            return Err(NvsError::Injected("read"));
        }
        let (start, n) = self.span(state.bytes.len(), buf.len());
        buf[..n].copy_from_slice(&state.bytes[start..start + n]);
        drop(state);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.mode.can_write() {
            return Err(NvsError::PermissionDenied(
                "handle not opened for writing".to_owned(),
            ));
        }
        let mut state = self.state.lock();
        if state.take_fault(Fault::Write) {
            return Err(NvsError::Injected("write"));
        }
        let want = if state.take_fault(Fault::ShortWrite) {
            buf.len() / 2
        } else {
            buf.len()
        };
        let (start, n) = self.span(state.bytes.len(), want);
        state.bytes[start..start + n].copy_from_slice(&buf[..n]);
        state.writes.push(WriteRecord {
            offset: self.pos,
            len: n,
        });
        drop(state);
        self.pos += n as u64;
        Ok(n)
    }

    fn sync(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.take_fault(Fault::Sync) {
            return Err(NvsError::Injected("sync"));
        }
        state.sync_calls += 1;
        Ok(())
    }
}

/// In-memory legacy image. Archiving makes it disappear, as a rename would.
#[derive(Debug, Clone)]
pub struct MemoryLegacyStore {
    image: MemoryDevice,
    archived: Arc<Mutex<bool>>,
    fail_archive: Arc<Mutex<bool>>,
}

impl MemoryLegacyStore {
    #[must_use]
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image: MemoryDevice::from_bytes(image),
            archived: Arc::new(Mutex::new(false)),
            fail_archive: Arc::new(Mutex::new(false)),
        }
    }

    /// A legacy store that does not exist.
    #[must_use]
    pub fn absent() -> Self {
        let store = Self::new(Vec::new());
        store.image.set_present(false);
        store
    }

    /// Backing image, for fault injection on legacy reads.
    #[must_use]
    pub fn image(&self) -> &MemoryDevice {
        &self.image
    }

    #[must_use]
    pub fn is_archived(&self) -> bool {
        *self.archived.lock()
    }

    pub fn set_fail_archive(&self, fail: bool) {
        *self.fail_archive.lock() = fail;
    }
}

impl LegacyStore for MemoryLegacyStore {
    fn exists(&self) -> bool {
        self.image.exists()
    }

    fn open(&self) -> Result<Box<dyn DeviceHandle>> {
        self.image.open(OpenMode::ReadOnly)
    }

    fn archive(&self) -> Result<()> {
        if *self.fail_archive.lock() {
            return Err(NvsError::Injected("archive"));
        }
        self.image.set_present(false);
        *self.archived.lock() = true;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory legacy store ({} bytes)", self.image.len())
    }
}
