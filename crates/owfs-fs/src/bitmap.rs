//! Free-page bitmap placement.
//!
//! Where the bitmap lives is decided once per mount:
//!
//! - **CacheManaged**: the device keeps it (write-once parts); every call is
//!   delegated to the page cache, which uses `1 = free`
//! - **LocalInRoot**: four bytes inside the root page, for groups of at most
//!   32 pages
//! - **DedicatedFile**: a chained file right after the device map
//!
//! The last two use `1 = used`.

use owfs_cache::PageCache;
use owfs_common::bits::{read_bit, write_bit};
use owfs_common::constants::LOCAL_BITMAP_BYTES;
use owfs_common::PageNumber;

use crate::chain::read_chain_data;
use crate::error::{FsError, FsResult};
use crate::layout::Layout;

/// Location of the free-page bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapLocation {
    /// Kept by the device and the page cache.
    CacheManaged,
    /// Kept in the root page at byte `offset`.
    LocalInRoot {
        /// Byte offset in the root packet.
        offset: usize,
    },
    /// Kept in a chained file.
    DedicatedFile {
        /// First page of the file.
        start: PageNumber,
        /// Number of pages in the file.
        pages: usize,
    },
}

/// Working copy of the bitmap for one allocation sequence.
///
/// Load it, mark or free pages, then [`store`](Self::store) it. Cache-managed
/// bitmaps have no working copy.
#[derive(Debug)]
pub(crate) struct PageBitmap {
    location: BitmapLocation,
    layout: Layout,
    bits: Vec<u8>,
    total_pages: usize,
    search_from: usize,
}

impl PageBitmap {
    /// Reads the current bitmap from the cache.
    pub fn load(cache: &mut PageCache, layout: Layout, location: BitmapLocation) -> FsResult<Self> {
        let bits = match location {
            BitmapLocation::CacheManaged => Vec::new(),
            BitmapLocation::LocalInRoot { offset } => {
                let root = cache.read_page_packet(PageNumber::ROOT)?;
                root.get(offset..offset + LOCAL_BITMAP_BYTES)
                    .ok_or_else(|| FsError::corrupt("root page too short for its bitmap"))?
                    .to_vec()
            }
            BitmapLocation::DedicatedFile { start, pages } => {
                read_chain_data(cache, layout, start.index(), pages)?
            }
        };
        Ok(Self {
            location,
            layout,
            bits,
            total_pages: cache.total_pages(),
            search_from: 0,
        })
    }

    /// Marks `page` used.
    pub fn mark_used(&mut self, cache: &mut PageCache, page: usize) -> FsResult<()> {
        match self.location {
            BitmapLocation::CacheManaged => cache.mark_used(PageNumber::new(page))?,
            _ => write_bit(&mut self.bits, page, true),
        }
        Ok(())
    }

    /// Frees `page`. Returns false if a device-kept bitmap refused because
    /// the page was already flushed as used.
    pub fn free(&mut self, cache: &mut PageCache, page: usize) -> FsResult<bool> {
        match self.location {
            BitmapLocation::CacheManaged => Ok(cache.free_if_cached(PageNumber::new(page))?),
            _ => {
                write_bit(&mut self.bits, page, false);
                Ok(true)
            }
        }
    }

    /// Returns the first free page and restarts the search.
    pub fn first_free(&mut self, cache: &mut PageCache) -> FsResult<Option<usize>> {
        if self.location == BitmapLocation::CacheManaged {
            return Ok(cache.first_free_page()?.map(PageNumber::index));
        }
        self.search_from = 0;
        self.next_free(cache)
    }

    /// Returns the next free page after the last one returned.
    pub fn next_free(&mut self, cache: &mut PageCache) -> FsResult<Option<usize>> {
        if self.location == BitmapLocation::CacheManaged {
            return Ok(cache.next_free_page()?.map(PageNumber::index));
        }
        let found = (self.search_from..self.total_pages).find(|&page| !self.is_used(page));
        if let Some(page) = found {
            self.search_from = page + 1;
        }
        Ok(found)
    }

    /// Returns the number of free pages.
    pub fn free_count(&self, cache: &mut PageCache) -> FsResult<usize> {
        if self.location == BitmapLocation::CacheManaged {
            return Ok(cache.free_page_count()?);
        }
        Ok((0..self.total_pages)
            .filter(|&page| !self.is_used(page))
            .count())
    }

    /// Returns true if `page` is marked used.
    pub fn is_used(&self, page: usize) -> bool {
        read_bit(&self.bits, page)
    }

    /// Writes the working copy back, touching only pages whose bitmap bytes
    /// changed.
    pub fn store(&self, cache: &mut PageCache) -> FsResult<()> {
        match self.location {
            BitmapLocation::CacheManaged => Ok(()),
            BitmapLocation::LocalInRoot { offset } => {
                let mut root = cache.read_page_packet(PageNumber::ROOT)?;
                let range = offset..offset + LOCAL_BITMAP_BYTES;
                let current = root
                    .get_mut(range)
                    .ok_or_else(|| FsError::corrupt("root page too short for its bitmap"))?;
                if current != self.bits.as_slice() {
                    current.copy_from_slice(&self.bits);
                    cache.write_page_packet(PageNumber::ROOT, &root)?;
                }
                Ok(())
            }
            BitmapLocation::DedicatedFile { start, pages } => {
                let ptr_len = self.layout.ptr_len();
                let mut page = start.index();
                let mut offset = 0;
                for _ in 0..pages {
                    let mut packet = cache.read_page_packet(PageNumber::new(page))?;
                    let next = self.layout.next_page(&packet)?;
                    let len = packet.len() - ptr_len;
                    let wanted = self
                        .bits
                        .get(offset..offset + len)
                        .ok_or_else(|| FsError::corrupt("bitmap file changed size"))?;
                    if &packet[..len] != wanted {
                        packet[..len].copy_from_slice(wanted);
                        cache.write_page_packet(PageNumber::new(page), &packet)?;
                    }
                    offset += len;
                    if next == 0 {
                        break;
                    }
                    page = next;
                }
                Ok(())
            }
        }
    }
}
