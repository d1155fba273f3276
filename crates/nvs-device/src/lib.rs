#![forbid(unsafe_code)]
//! Persistent device adapters.
//!
//! Provides the [`PersistentDevice`] trait (an openable, seekable byte
//! store), the read-only [`LegacyStore`] trait consulted during format
//! migration, file-backed implementations of both, and positioned I/O
//! helpers that turn short transfers into errors.
//!
//! In-memory doubles with fault injection live in [`memory`].

pub mod memory;

use nvs_error::{NvsError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub use memory::{Fault, MemoryDevice, MemoryLegacyStore, WriteRecord};

/// Access mode requested when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    #[must_use]
    pub fn can_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// An open handle on a persistent device. Dropping the handle closes it.
///
/// `read` and `write` report how many bytes were transferred; callers
/// treat anything less than the full buffer as a failed transfer.
pub trait DeviceHandle: Send {
    /// Move to absolute `offset`, returning the resulting position.
    fn seek(&mut self, offset: u64) -> Result<u64>;

    /// Read up to `buf.len()` bytes at the current position.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write up to `buf.len()` bytes at the current position.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush written data to stable storage.
    fn sync(&mut self) -> Result<()>;
}

/// Seekable byte store backing the storage image.
pub trait PersistentDevice: Send + Sync {
    /// Whether the device node (or file) is present.
    fn exists(&self) -> bool;

    /// Open a new handle in `mode`.
    fn open(&self, mode: OpenMode) -> Result<Box<dyn DeviceHandle>>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}

/// Prior-format storage image, read at most once during migration.
pub trait LegacyStore: Send + Sync {
    fn exists(&self) -> bool;

    /// Open the image for reading.
    fn open(&self) -> Result<Box<dyn DeviceHandle>>;

    /// Move the image out of the way so it is not consulted again.
    fn archive(&self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Seek to `offset`, failing if the handle lands anywhere else.
pub fn seek_to(handle: &mut dyn DeviceHandle, offset: u64) -> Result<()> {
    let actual = handle.seek(offset)?;
    if actual != offset {
        return Err(NvsError::SeekMismatch {
            expected: offset,
            actual,
        });
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes from `offset`.
pub fn read_exact_at(handle: &mut dyn DeviceHandle, offset: u64, buf: &mut [u8]) -> Result<()> {
    seek_to(handle, offset)?;
    let actual = handle.read(buf)?;
    if actual != buf.len() {
        return Err(NvsError::ShortRead {
            offset,
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}

/// Write all of `buf` at `offset` in a single transfer.
pub fn write_all_at(handle: &mut dyn DeviceHandle, offset: u64, buf: &[u8]) -> Result<()> {
    seek_to(handle, offset)?;
    let actual = handle.write(buf)?;
    if actual != buf.len() {
        return Err(NvsError::ShortWrite {
            offset,
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}

/// File- or device-node-backed persistent device.
///
/// The node is never created implicitly by `open`; a missing node is
/// reported as [`NvsError::DeviceMissing`].
#[derive(Debug, Clone)]
pub struct FileDevice {
    path: PathBuf,
}

impl FileDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create (or extend) a zero-filled device file of at least `len` bytes.
    pub fn provision(path: impl Into<PathBuf>, len: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
            file.sync_all()?;
        }
        debug!(path = %path.display(), len, "provisioned device file");
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistentDevice for FileDevice {
    fn exists(&self) -> bool {
        fs::metadata(&self.path).is_ok()
    }

    fn open(&self, mode: OpenMode) -> Result<Box<dyn DeviceHandle>> {
        let file = open_file(&self.path, mode)?;
        Ok(Box::new(FileHandle { file, mode }))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn open_file(path: &Path, mode: OpenMode) -> Result<File> {
    OpenOptions::new()
        .read(mode.can_read())
        .write(mode.can_write())
        .open(path)
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => NvsError::DeviceMissing(path.display().to_string()),
            _ => NvsError::Io(err),
        })
}

#[derive(Debug)]
struct FileHandle {
    file: File,
    mode: OpenMode,
}

impl DeviceHandle for FileHandle {
    fn seek(&mut self, offset: u64) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::Start(offset))?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.mode.can_read() {
            return Err(NvsError::PermissionDenied(
                "handle not opened for reading".to_owned(),
            ));
        }
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(filled)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.mode.can_write() {
            return Err(NvsError::PermissionDenied(
                "handle not opened for writing".to_owned(),
            ));
        }
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Legacy image stored as a plain file; archiving renames it.
#[derive(Debug, Clone)]
pub struct FileLegacyStore {
    path: PathBuf,
    archive_path: PathBuf,
}

impl FileLegacyStore {
    /// Legacy store at `path`, archived next to it with a `.bak` extension.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let archive_path = path.with_extension("bak");
        Self { path, archive_path }
    }

    #[must_use]
    pub fn with_archive_path(mut self, archive_path: impl Into<PathBuf>) -> Self {
        self.archive_path = archive_path.into();
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }
}

impl LegacyStore for FileLegacyStore {
    fn exists(&self) -> bool {
        fs::metadata(&self.path).is_ok()
    }

    fn open(&self) -> Result<Box<dyn DeviceHandle>> {
        let file = open_file(&self.path, OpenMode::ReadOnly)?;
        Ok(Box::new(FileHandle {
            file,
            mode: OpenMode::ReadOnly,
        }))
    }

    fn archive(&self) -> Result<()> {
        fs::rename(&self.path, &self.archive_path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_device_round_trips_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::provision(dir.path().join("mtd"), 8192).unwrap();
        assert!(dev.exists());

        let mut w = dev.open(OpenMode::WriteOnly).unwrap();
        write_all_at(w.as_mut(), 130, &[1, 2, 3, 4]).unwrap();
        w.sync().unwrap();
        drop(w);

        let mut r = dev.open(OpenMode::ReadOnly).unwrap();
        let mut buf = [0_u8; 4];
        read_exact_at(r.as_mut(), 130, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn provision_does_not_shrink_or_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mtd");
        let dev = FileDevice::provision(&path, 16).unwrap();
        let mut w = dev.open(OpenMode::ReadWrite).unwrap();
        write_all_at(w.as_mut(), 0, &[9; 16]).unwrap();
        drop(w);

        let dev = FileDevice::provision(&path, 8).unwrap();
        let mut r = dev.open(OpenMode::ReadOnly).unwrap();
        let mut buf = [0_u8; 16];
        read_exact_at(r.as_mut(), 0, &mut buf).unwrap();
        assert_eq!(buf, [9; 16]);
    }

    #[test]
    fn missing_file_reports_device_missing() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::new(dir.path().join("absent"));
        assert!(!dev.exists());
        let err = dev.open(OpenMode::ReadOnly).err().unwrap();
        assert!(matches!(err, NvsError::DeviceMissing(_)));
    }

    #[test]
    fn read_past_end_is_short() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::provision(dir.path().join("mtd"), 8).unwrap();
        let mut r = dev.open(OpenMode::ReadOnly).unwrap();
        let mut buf = [0_u8; 16];
        let err = read_exact_at(r.as_mut(), 0, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            NvsError::ShortRead {
                expected: 16,
                actual: 8,
                ..
            }
        ));
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::provision(dir.path().join("mtd"), 8).unwrap();
        let mut r = dev.open(OpenMode::ReadOnly).unwrap();
        assert!(matches!(
            r.write(&[1]),
            Err(NvsError::PermissionDenied(_))
        ));
    }

    #[test]
    fn legacy_file_archives_by_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ArduPlane.stg");
        fs::write(&path, [0xAB; 32]).unwrap();

        let legacy = FileLegacyStore::new(&path);
        assert_eq!(legacy.archive_path(), dir.path().join("ArduPlane.bak"));
        assert!(legacy.exists());

        let mut h = legacy.open().unwrap();
        let mut buf = [0_u8; 32];
        read_exact_at(h.as_mut(), 0, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 32]);
        drop(h);

        legacy.archive().unwrap();
        assert!(!legacy.exists());
        assert!(legacy.archive_path().exists());
    }
}
