//! Chained page files.
//!
//! Files, directories, the device map and the bitmap file are all chains of
//! page packets linked by their trailing next-page pointer.

use owfs_cache::PageCache;
use owfs_common::PageNumber;

use crate::error::{FsError, FsResult};
use crate::layout::Layout;

/// Returns the pages of the chain starting at `start`, in order.
///
/// # Errors
///
/// `Corrupt` if the chain visits more pages than the group holds.
pub(crate) fn chain_pages(cache: &mut PageCache, layout: Layout, start: usize) -> FsResult<Vec<usize>> {
    let total = cache.total_pages();
    let mut pages = Vec::new();
    let mut page = start;
    loop {
        pages.push(page);
        if pages.len() > total {
            return Err(FsError::corrupt("looping page pointers"));
        }
        let packet = cache.read_page_packet(PageNumber::new(page))?;
        page = layout.next_page(&packet)?;
        if page == 0 {
            return Ok(pages);
        }
    }
}

/// Reads the data of a chain (each packet without its next pointer),
/// stopping after `max_pages` pages or at the end of the chain.
pub(crate) fn read_chain_data(
    cache: &mut PageCache,
    layout: Layout,
    start: usize,
    max_pages: usize,
) -> FsResult<Vec<u8>> {
    let mut data = Vec::new();
    let mut page = start;
    for _ in 0..max_pages.min(cache.total_pages()) {
        let packet = cache.read_page_packet(PageNumber::new(page))?;
        let next = layout.next_page(&packet)?;
        data.extend_from_slice(&packet[..packet.len() - layout.ptr_len()]);
        if next == 0 {
            break;
        }
        page = next;
    }
    Ok(data)
}

/// Returns the number of pages needed to chain `bytes` bytes.
pub(crate) fn pages_needed(bytes: usize, layout: Layout, max_packet_data_length: usize) -> usize {
    let usable = layout.usable(max_packet_data_length).max(1);
    (bytes + usable - 1) / usable
}

/// Writes `data` as a chain over the consecutive pages starting at `first`.
/// Returns the number of pages written.
pub(crate) fn write_contiguous_chain(
    cache: &mut PageCache,
    layout: Layout,
    first: usize,
    data: &[u8],
) -> FsResult<usize> {
    let usable = layout.usable(cache.max_packet_data_length()).max(1);
    let count = data.chunks(usable).count();
    for (index, chunk) in data.chunks(usable).enumerate() {
        let page = first + index;
        let next = if index + 1 == count { 0 } else { page + 1 };
        let mut packet = Vec::with_capacity(chunk.len() + layout.ptr_len());
        packet.extend_from_slice(chunk);
        packet.resize(chunk.len() + layout.ptr_len(), 0);
        layout.write_ptr(&mut packet, chunk.len(), next);
        cache.write_page_packet(PageNumber::new(page), &packet)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use owfs_cache::sim::SimulatedBus;
    use owfs_cache::DeviceSource;
    use owfs_common::{CacheConfig, DeviceAddress};

    fn cache(pages: usize, page_len: usize) -> PageCache {
        let bus = SimulatedBus::new();
        let address = DeviceAddress::new(0x0C);
        bus.add_eeprom_device(address, pages, page_len);
        let device = bus.open_device(address).unwrap();
        PageCache::new(vec![device], CacheConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_pages_needed() {
        let layout = Layout::for_pages(32);
        assert_eq!(pages_needed(0, layout, 29), 0);
        assert_eq!(pages_needed(28, layout, 29), 1);
        assert_eq!(pages_needed(29, layout, 29), 2);
    }

    #[test]
    fn test_write_and_read_chain() {
        let mut cache = cache(32, 32);
        let layout = Layout::for_pages(32);
        let data: Vec<u8> = (0..70).collect();

        assert_eq!(write_contiguous_chain(&mut cache, layout, 4, &data).unwrap(), 3);
        assert_eq!(chain_pages(&mut cache, layout, 4).unwrap(), vec![4, 5, 6]);
        assert_eq!(read_chain_data(&mut cache, layout, 4, 10).unwrap(), data);
        assert_eq!(read_chain_data(&mut cache, layout, 4, 1).unwrap(), &data[..28]);
    }

    #[test]
    fn test_looping_chain_detected() {
        let mut cache = cache(8, 32);
        let layout = Layout::for_pages(8);
        cache.write_page_packet(PageNumber::new(2), &[7, 3]).unwrap();
        cache.write_page_packet(PageNumber::new(3), &[8, 2]).unwrap();

        let err = chain_pages(&mut cache, layout, 2).unwrap_err();
        assert!(err.is_fatal());
    }
}
