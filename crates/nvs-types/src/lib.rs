#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use thiserror::Error;

pub const DEFAULT_STORAGE_SIZE: usize = 4096;
pub const DEFAULT_LINE_SIZE: u32 = 128;
/// 512 bytes per flush transaction with the default line size.
pub const DEFAULT_MAX_WRITE_LINES: usize = 4;

pub const DEFAULT_SIGNATURE: Signature = Signature(0x1401_2014);
/// Last four bytes of an 8 KiB device.
pub const DEFAULT_SIGNATURE_OFFSET: u64 = 8192 - 4;
pub const SIGNATURE_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("signature field at offset {offset} overlaps the storage image [0, {storage_size})")]
    SignatureOverlap { offset: u64, storage_size: usize },
}

/// Index of a dirty-tracking line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineIndex(pub usize);

impl fmt::Display for LineIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}", self.0)
    }
}

/// Validated line size (power of two, non-zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineSize(u32);

impl LineSize {
    pub fn new(value: u32) -> Result<Self, GeometryError> {
        if value == 0 || !value.is_power_of_two() {
            return Err(GeometryError::InvalidField {
                field: "line_size",
                reason: "must be a non-zero power of two",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and lines.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Line containing `byte_offset`.
    #[must_use]
    pub fn byte_to_line(self, byte_offset: usize) -> LineIndex {
        LineIndex(byte_offset >> self.shift())
    }

    /// First byte of `line`.
    #[must_use]
    pub fn line_to_byte(self, line: LineIndex) -> usize {
        line.0 << self.shift()
    }
}

impl Default for LineSize {
    fn default() -> Self {
        Self(DEFAULT_LINE_SIZE)
    }
}

/// A run of consecutive lines written in one flush transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRun {
    pub first: LineIndex,
    pub count: usize,
}

impl LineRun {
    #[must_use]
    pub fn new(first: LineIndex, count: usize) -> Self {
        Self { first, count }
    }

    /// Byte range covered by the run, clamped to `storage_size` so a short
    /// trailing line never reaches past the image.
    #[must_use]
    pub fn byte_range(self, line_size: LineSize, storage_size: usize) -> Range<usize> {
        let start = line_size.line_to_byte(self.first).min(storage_size);
        let end = line_size
            .line_to_byte(LineIndex(self.first.0 + self.count))
            .min(storage_size);
        start..end
    }
}

impl fmt::Display for LineRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lines {}..{}", self.first.0, self.first.0 + self.count)
    }
}

/// Format signature stored little-endian at a fixed device offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(pub u32);

impl Signature {
    #[must_use]
    pub fn to_bytes(self) -> [u8; SIGNATURE_LEN] {
        self.0.to_le_bytes()
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Validated shape of the storage image and its dirty-tracking lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageGeometry {
    storage_size: usize,
    line_size: LineSize,
    max_write_lines: usize,
}

impl StorageGeometry {
    pub fn new(
        storage_size: usize,
        line_size: LineSize,
        max_write_lines: usize,
    ) -> Result<Self, GeometryError> {
        if storage_size == 0 {
            return Err(GeometryError::InvalidField {
                field: "storage_size",
                reason: "must be greater than zero",
            });
        }
        if line_size.bytes() > storage_size {
            return Err(GeometryError::InvalidField {
                field: "line_size",
                reason: "must not exceed storage_size",
            });
        }
        if max_write_lines == 0 {
            return Err(GeometryError::InvalidField {
                field: "max_write_lines",
                reason: "must be at least one line",
            });
        }
        let line_count = storage_size.div_ceil(line_size.bytes());
        if line_count.checked_mul(line_size.bytes()).is_none() {
            return Err(GeometryError::InvalidField {
                field: "storage_size",
                reason: "whole lines must fit in the address space",
            });
        }
        if max_write_lines > line_count {
            return Err(GeometryError::InvalidField {
                field: "max_write_lines",
                reason: "must not exceed the number of lines",
            });
        }
        Ok(Self {
            storage_size,
            line_size,
            max_write_lines,
        })
    }

    #[must_use]
    pub fn storage_size(&self) -> usize {
        self.storage_size
    }

    #[must_use]
    pub fn line_size(&self) -> LineSize {
        self.line_size
    }

    #[must_use]
    pub fn max_write_lines(&self) -> usize {
        self.max_write_lines
    }

    /// Largest single flush transaction in bytes.
    #[must_use]
    pub fn max_write_bytes(&self) -> usize {
        self.max_write_lines * self.line_size.bytes()
    }

    /// ceil(storage_size / line_size)
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.storage_size.div_ceil(self.line_size.bytes())
    }

    /// Whether `[offset, offset + len)` lies inside the image.
    #[must_use]
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.storage_size)
    }

    /// Lines intersecting `[offset, offset + len)`, or `None` for an empty
    /// or out-of-range span.
    #[must_use]
    pub fn lines_for(&self, offset: usize, len: usize) -> Option<LineRun> {
        if len == 0 || !self.contains(offset, len) {
            return None;
        }
        let first = self.line_size.byte_to_line(offset);
        let last = self.line_size.byte_to_line(offset + len - 1);
        Some(LineRun::new(first, last.0 - first.0 + 1))
    }

    /// Reject a signature field that would overlap the image or run past
    /// the end of the device address space.
    pub fn check_signature_offset(&self, offset: u64) -> Result<(), GeometryError> {
        if offset < self.storage_size as u64 {
            return Err(GeometryError::SignatureOverlap {
                offset,
                storage_size: self.storage_size,
            });
        }
        if offset.checked_add(SIGNATURE_LEN as u64).is_none() {
            return Err(GeometryError::InvalidField {
                field: "signature_offset",
                reason: "signature field must end inside the device address space",
            });
        }
        Ok(())
    }
}

impl Default for StorageGeometry {
    fn default() -> Self {
        Self {
            storage_size: DEFAULT_STORAGE_SIZE,
            line_size: LineSize::default(),
            max_write_lines: DEFAULT_MAX_WRITE_LINES,
        }
    }
}
