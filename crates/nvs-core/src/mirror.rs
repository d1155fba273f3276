//! In-memory image of the whole storage space.

use parking_lot::RwLock;
use std::ops::Range;

#[derive(Debug)]
pub struct MirrorBuffer {
    bytes: RwLock<Box<[u8]>>,
}

impl MirrorBuffer {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0_u8; len].into_boxed_slice()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes from `offset`. The caller has bounds-checked.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) {
        let bytes = self.bytes.read();
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    /// Overwrite `[offset, offset + src.len())` if it differs from `src`.
    /// Returns whether anything changed.
    pub fn update(&self, offset: usize, src: &[u8]) -> bool {
        let range = offset..offset + src.len();
        if self.bytes.read()[range.clone()] == *src {
            return false;
        }
        let mut bytes = self.bytes.write();
        if bytes[range.clone()] == *src {
            return false;
        }
        bytes[range].copy_from_slice(src);
        true
    }

    /// Copy `range` into the front of `dst`.
    pub fn copy_range(&self, range: Range<usize>, dst: &mut [u8]) {
        let bytes = self.bytes.read();
        dst[..range.len()].copy_from_slice(&bytes[range]);
    }

    /// Run `fill` with exclusive access to the whole image.
    pub fn fill_with<T>(&self, fill: impl FnOnce(&mut [u8]) -> T) -> T {
        fill(&mut self.bytes.write()[..])
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_reports_changes_only() {
        let mirror = MirrorBuffer::new(16);
        assert!(!mirror.update(4, &[0, 0]));
        assert!(mirror.update(4, &[1, 2]));
        assert!(!mirror.update(4, &[1, 2]));

        let mut out = [0_u8; 2];
        mirror.read_into(4, &mut out);
        assert_eq!(out, [1, 2]);
    }

    #[test]
    fn copy_range_fills_prefix() {
        let mirror = MirrorBuffer::new(8);
        mirror.fill_with(|bytes| {
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = i as u8;
            }
        });
        let mut scratch = [0xEE_u8; 6];
        mirror.copy_range(2..6, &mut scratch);
        assert_eq!(scratch, [2, 3, 4, 5, 0xEE, 0xEE]);
        assert_eq!(mirror.snapshot(), (0..8).collect::<Vec<u8>>());
    }
}
