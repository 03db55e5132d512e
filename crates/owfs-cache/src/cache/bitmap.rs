//! In-memory mirror of a write-once device's free-page bitmap.
//!
//! The device bitmap uses write-once polarity: `1` = free, `0` = used.
//! Two copies are kept: what the device last reported and what the cache
//! wants it to become. Only bits that differ are written back.

use owfs_common::bits::{read_bit, write_bit};

const FREE: bool = true;
const USED: bool = false;

#[derive(Debug)]
pub(crate) struct DeviceBitmap {
    /// Last bitmap read from or written to the device.
    device: Vec<u8>,
    /// Bitmap including unflushed allocations.
    modified: Vec<u8>,
    /// Bit index of page 0.
    bit_offset: usize,
    total_pages: usize,
    loaded: bool,
    /// Cursor for `next_free`.
    next_search: usize,
}

impl DeviceBitmap {
    pub fn new(len: usize, bit_offset: usize, total_pages: usize) -> Self {
        Self {
            device: vec![0xFF; len],
            modified: vec![0xFF; len],
            bit_offset,
            total_pages,
            loaded: false,
            next_search: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Installs a bitmap read from the device.
    pub fn load(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.device.len());
        self.device[..n].copy_from_slice(&bytes[..n]);
        self.modified.copy_from_slice(&self.device);
        self.loaded = true;
    }

    pub fn buffer_len(&self) -> usize {
        self.device.len()
    }

    pub fn mark_used(&mut self, page: usize) {
        write_bit(&mut self.modified, self.bit_offset + page, USED);
    }

    /// Frees a page unless the device already records it as used.
    pub fn free_if_unflushed(&mut self, page: usize) -> bool {
        let bit = self.bit_offset + page;
        if read_bit(&self.device, bit) == FREE {
            write_bit(&mut self.modified, bit, FREE);
            true
        } else {
            false
        }
    }

    pub fn is_free(&self, page: usize) -> bool {
        read_bit(&self.modified, self.bit_offset + page) == FREE
    }

    pub fn first_free(&mut self) -> Option<usize> {
        self.next_search = 0;
        self.next_free()
    }

    pub fn next_free(&mut self) -> Option<usize> {
        let found = (self.next_search..self.total_pages).find(|&page| self.is_free(page));
        self.next_search = found.map_or(self.total_pages, |page| page + 1);
        found
    }

    pub fn free_count(&self) -> usize {
        (0..self.total_pages).filter(|&page| self.is_free(page)).count()
    }

    /// Returns the bytes to write so the device ends up equal to the
    /// modified copy, or `None` if nothing changed. Unchanged bits are ones,
    /// which the device's AND leaves untouched.
    pub fn pending_write(&self) -> Option<Vec<u8>> {
        let diff: Vec<u8> = self
            .device
            .iter()
            .zip(&self.modified)
            .map(|(dev, want)| !(dev ^ want))
            .collect();
        diff.iter().any(|&b| b != 0xFF).then_some(diff)
    }

    pub fn modified(&self) -> &[u8] {
        &self.modified
    }

    /// Records a successful write-back.
    pub fn commit(&mut self, device: &[u8]) {
        self.load(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_and_diff() {
        let mut bitmap = DeviceBitmap::new(2, 0, 16);
        bitmap.load(&[0xFF, 0xFF]);
        assert_eq!(bitmap.free_count(), 16);
        assert!(bitmap.pending_write().is_none());

        bitmap.mark_used(0);
        bitmap.mark_used(9);
        assert_eq!(bitmap.free_count(), 14);
        assert_eq!(bitmap.pending_write(), Some(vec![0xFE, 0xFD]));
    }

    #[test]
    fn test_flushed_pages_are_never_freed() {
        let mut bitmap = DeviceBitmap::new(1, 0, 8);
        bitmap.load(&[0xFE]);
        assert!(!bitmap.free_if_unflushed(0));

        bitmap.mark_used(3);
        assert!(bitmap.free_if_unflushed(3));
        assert!(bitmap.pending_write().is_none());
    }

    #[test]
    fn test_free_search() {
        let mut bitmap = DeviceBitmap::new(1, 0, 8);
        bitmap.load(&[0b1010_0000]);
        assert_eq!(bitmap.first_free(), Some(5));
        assert_eq!(bitmap.next_free(), Some(7));
        assert_eq!(bitmap.next_free(), None);
        assert_eq!(bitmap.first_free(), Some(5));
    }

    #[test]
    fn test_bit_offset() {
        let mut bitmap = DeviceBitmap::new(2, 4, 8);
        bitmap.load(&[0xFF, 0xFF]);
        bitmap.mark_used(0);
        assert_eq!(bitmap.modified()[0], 0xEF);
    }
}
