//! On-media record layouts.
//!
//! Every page of a chained file or directory ends with a little-endian
//! next-page pointer; zero ends the chain. The pointer width is fixed per
//! device group by its page count and recorded in the root marker byte.
//!
//! ```text
//! Directory entry:   [name 4][ext 1][start page N][page count N]
//! Root first page:   [marker][device map N][control][bitmap data ...][entries ...][next N]
//! Subdirectory page: [marker][0][parent name 4][parent start N][entries ...][next N]
//! ```

use owfs_common::constants::{
    EXT_DIRECTORY, EXT_FLAG, EXT_HIDDEN, EXT_MASK, LEN_FILENAME, MARKER_MULTI, MARKER_NARROW,
    MARKER_SINGLE, MARKER_WIDE, NAME_CHARS, WIDE_POINTER_THRESHOLD,
};

use crate::error::{FsError, FsResult};
use crate::path::{write_display_name, NameElement};

/// Number of control bytes before the page pointer of a directory's first
/// page, excluding the pointer itself.
const CONTROL_BASE_LEN: usize = 6;

/// Record layout for one pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    ptr_len: usize,
}

impl Layout {
    /// Returns the layout for a group of `total_pages` pages.
    pub fn for_pages(total_pages: usize) -> Self {
        Self {
            ptr_len: if total_pages > WIDE_POINTER_THRESHOLD { 2 } else { 1 },
        }
    }

    /// Returns the layout recorded in a root marker byte.
    pub fn from_marker(marker: u8) -> Self {
        Self {
            ptr_len: if marker & 0x0F == MARKER_WIDE { 2 } else { 1 },
        }
    }

    /// Returns the page pointer width in bytes.
    #[inline]
    pub fn ptr_len(&self) -> usize {
        self.ptr_len
    }

    /// Returns the length of a directory entry.
    #[inline]
    pub fn entry_len(&self) -> usize {
        LEN_FILENAME + 2 * self.ptr_len
    }

    /// Returns the length of the control area of a directory's first page.
    #[inline]
    pub fn control_len(&self) -> usize {
        CONTROL_BASE_LEN + self.ptr_len
    }

    /// Returns the packet length of a directory without entries.
    #[inline]
    pub fn empty_dir_len(&self) -> usize {
        self.control_len() + self.ptr_len
    }

    /// Returns the marker byte for this layout.
    pub fn marker(&self, multi_device: bool) -> u8 {
        let width = if self.ptr_len == 1 { MARKER_NARROW } else { MARKER_WIDE };
        width | if multi_device { MARKER_MULTI } else { MARKER_SINGLE }
    }

    /// Returns the data bytes one page carries besides its next pointer.
    #[inline]
    pub fn usable(&self, max_packet_data_length: usize) -> usize {
        max_packet_data_length.saturating_sub(self.ptr_len)
    }

    /// Reads a pointer-width value at `offset`.
    pub fn read_ptr(&self, buf: &[u8], offset: usize) -> usize {
        buf[offset..offset + self.ptr_len]
            .iter()
            .rev()
            .fold(0, |acc, &b| (acc << 8) | usize::from(b))
    }

    /// Writes a pointer-width value at `offset`.
    pub fn write_ptr(&self, buf: &mut [u8], offset: usize, value: usize) {
        for (i, byte) in buf[offset..offset + self.ptr_len].iter_mut().enumerate() {
            *byte = (value >> (8 * i)) as u8;
        }
    }

    /// Returns the next-page pointer of a page packet.
    ///
    /// # Errors
    ///
    /// `Corrupt` if the packet is too short to hold a pointer.
    pub fn next_page(&self, packet: &[u8]) -> FsResult<usize> {
        if packet.len() < self.ptr_len {
            return Err(FsError::corrupt(format!(
                "page packet of {} bytes has no next-page pointer",
                packet.len()
            )));
        }
        Ok(self.read_ptr(packet, packet.len() - self.ptr_len))
    }

    /// Returns a packet holding only a zero next pointer.
    pub fn empty_page(&self) -> Vec<u8> {
        vec![0; self.ptr_len]
    }

    /// Returns the first page of a new subdirectory whose parent is
    /// `parent` starting at `parent_start`.
    pub fn subdirectory_page(&self, multi_device: bool, parent: &[u8], parent_start: usize) -> Vec<u8> {
        let mut page = vec![0; self.empty_dir_len()];
        page[0] = self.marker(multi_device);
        page[2..2 + NAME_CHARS].copy_from_slice(&parent[..NAME_CHARS]);
        self.write_ptr(&mut page, 2 + NAME_CHARS, parent_start);
        page
    }
}

/// A decoded directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    /// Name bytes and extension byte.
    pub name: NameElement,
    /// First page of the entry's chain.
    pub start_page: usize,
    /// Number of pages in the chain.
    pub page_count: usize,
}

impl DirEntry {
    /// Decodes the entry at `offset`.
    pub fn decode(layout: Layout, buf: &[u8], offset: usize) -> Self {
        let mut name = [0u8; LEN_FILENAME];
        name.copy_from_slice(&buf[offset..offset + LEN_FILENAME]);
        let ptr = offset + LEN_FILENAME;
        Self {
            name: NameElement::from_bytes(name),
            start_page: layout.read_ptr(buf, ptr),
            page_count: layout.read_ptr(buf, ptr + layout.ptr_len()),
        }
    }

    /// Encodes the entry at `offset`.
    pub fn encode(&self, layout: Layout, buf: &mut [u8], offset: usize) {
        buf[offset..offset + LEN_FILENAME].copy_from_slice(self.name.as_bytes());
        let ptr = offset + LEN_FILENAME;
        layout.write_ptr(buf, ptr, self.start_page);
        layout.write_ptr(buf, ptr + layout.ptr_len(), self.page_count);
    }

    /// Returns true for a subdirectory.
    #[inline]
    pub fn is_directory(&self) -> bool {
        self.name.extension() & EXT_MASK == EXT_DIRECTORY
    }

    /// Returns true if the flag bit is set: read-only for a file, hidden for
    /// a directory.
    #[inline]
    pub fn is_flagged(&self) -> bool {
        self.name.extension() & EXT_FLAG != 0
    }

    /// Returns true if the entry is excluded from listings.
    #[inline]
    pub fn is_listed(&self) -> bool {
        self.name.extension() != EXT_HIDDEN
    }

    /// Returns the listing name.
    pub fn display_name(&self) -> String {
        let mut out = String::with_capacity(8);
        // Writing into a String cannot fail.
        let _ = write_display_name(&mut out, self.name.as_bytes());
        out
    }
}
