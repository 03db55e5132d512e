//! Multi-device groups.
//!
//! The master's root page points at the device map, a chained file holding
//! the 8-byte addresses of every satellite in group order. Each satellite
//! carries a placeholder root page whose device-map pointer leads to a
//! single page holding the master's address instead.

use owfs_cache::PageCache;
use owfs_common::constants::{CONTROL_LOCAL_BITMAP, DEVICE_ADDRESS_LEN, LOCAL_BITMAP_BYTES};
use owfs_common::{DeviceAddress, PageNumber};

use crate::chain::{read_chain_data, write_contiguous_chain};
use crate::error::{FsError, FsResult};
use crate::layout::Layout;

/// Device-local page of a satellite's master reference.
pub(crate) const MASTER_REFERENCE_PAGE: usize = 1;

/// Reads the satellite addresses from the device map at `start`.
pub(crate) fn read_device_map(
    cache: &mut PageCache,
    layout: Layout,
    start: usize,
) -> FsResult<Vec<DeviceAddress>> {
    let total = cache.total_pages();
    let data = read_chain_data(cache, layout, start, total)?;
    if data.len() % DEVICE_ADDRESS_LEN != 0 {
        return Err(FsError::corrupt(format!(
            "device map holds {} bytes, not a whole number of addresses",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(DEVICE_ADDRESS_LEN)
        .filter_map(DeviceAddress::from_slice)
        .collect())
}

/// Writes the satellite addresses as a device map starting at `first`.
/// Returns the number of pages used.
pub(crate) fn write_device_map(
    cache: &mut PageCache,
    layout: Layout,
    first: usize,
    satellites: &[DeviceAddress],
) -> FsResult<usize> {
    let data: Vec<u8> = satellites.iter().flat_map(|a| a.to_bytes()).collect();
    write_contiguous_chain(cache, layout, first, &data)
}

/// Reads the master address a satellite's root page refers to.
pub(crate) fn read_master_reference(
    cache: &mut PageCache,
    layout: Layout,
    page: usize,
) -> FsResult<DeviceAddress> {
    if page == 0 || page >= cache.total_pages() {
        return Err(FsError::corrupt(format!(
            "satellite master reference page {page} is outside the device"
        )));
    }
    let packet = cache.read_page_packet(PageNumber::new(page))?;
    if packet.len() < DEVICE_ADDRESS_LEN + layout.ptr_len() {
        return Err(FsError::corrupt(
            "this is a satellite device with an invalid master reference",
        ));
    }
    DeviceAddress::from_slice(&packet[..DEVICE_ADDRESS_LEN])
        .ok_or_else(|| FsError::corrupt("invalid master address"))
}

/// Returns the placeholder root page written to each satellite: a
/// multi-device marker, a pointer to the master reference, and a local
/// bitmap with every page used.
pub(crate) fn satellite_root_page(layout: Layout) -> Vec<u8> {
    let ptr_len = layout.ptr_len();
    let mut page = vec![0; layout.empty_dir_len()];
    page[0] = layout.marker(true);
    layout.write_ptr(&mut page, 1, MASTER_REFERENCE_PAGE);
    page[1 + ptr_len] = CONTROL_LOCAL_BITMAP;
    page[2 + ptr_len..2 + ptr_len + LOCAL_BITMAP_BYTES].fill(0xFF);
    page
}

/// Returns the master reference page written to each satellite.
pub(crate) fn master_reference_page(layout: Layout, master: DeviceAddress) -> Vec<u8> {
    let mut page = master.to_bytes().to_vec();
    page.resize(DEVICE_ADDRESS_LEN + layout.ptr_len(), 0);
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use owfs_cache::sim::SimulatedBus;
    use owfs_cache::DeviceSource;
    use owfs_common::CacheConfig;

    fn cache(pages: usize, page_len: usize) -> PageCache {
        let bus = SimulatedBus::new();
        let address = DeviceAddress::new(0x0C);
        bus.add_eeprom_device(address, pages, page_len);
        let device = bus.open_device(address).unwrap();
        PageCache::new(vec![device], CacheConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_device_map_spans_pages() {
        let mut cache = cache(32, 16);
        let layout = Layout::for_pages(32);
        let satellites: Vec<DeviceAddress> =
            (1..=4).map(|n| DeviceAddress::new(0x1000 + n)).collect();

        // 32 bytes over 12 usable bytes per page.
        let pages = write_device_map(&mut cache, layout, 1, &satellites).unwrap();
        assert_eq!(pages, 3);
        assert_eq!(read_device_map(&mut cache, layout, 1).unwrap(), satellites);
    }

    #[test]
    fn test_partial_address_is_corruption() {
        let mut cache = cache(32, 32);
        let layout = Layout::for_pages(32);
        cache
            .write_page_packet(PageNumber::new(1), &[1, 2, 3, 0])
            .unwrap();
        assert!(read_device_map(&mut cache, layout, 1).unwrap_err().is_fatal());
    }

    #[test]
    fn test_master_reference() {
        let mut cache = cache(32, 32);
        let layout = Layout::for_pages(32);
        let master = DeviceAddress::new(0x5A00_0000_0000_000C);
        cache
            .write_page_packet(PageNumber::new(1), &master_reference_page(layout, master))
            .unwrap();
        assert_eq!(read_master_reference(&mut cache, layout, 1).unwrap(), master);

        cache.write_page_packet(PageNumber::new(2), &[1, 2, 0]).unwrap();
        assert!(read_master_reference(&mut cache, layout, 2).is_err());
        assert!(read_master_reference(&mut cache, layout, 0).is_err());
    }

    #[test]
    fn test_satellite_root_page() {
        let layout = Layout::for_pages(32);
        assert_eq!(
            satellite_root_page(layout),
            vec![0xBA, 0x01, 0x80, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]
        );
        let wide = Layout::for_pages(400);
        let page = satellite_root_page(wide);
        assert_eq!(page.len(), 10);
        assert_eq!(&page[..4], &[0xBB, 0x01, 0x00, 0x80]);
    }
}
