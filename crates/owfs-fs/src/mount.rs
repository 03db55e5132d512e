//! Root page validation.
//!
//! The first time a handle touches its device group it reads the root page
//! and decides how the filesystem is laid out. A satellite device sends the
//! handle to its master; a master whose device map disagrees with the cached
//! device list asks for the cache to be rebuilt.

use owfs_cache::PageCache;
use owfs_common::constants::{
    CONTROL_LOCAL_BITMAP, CONTROL_MASTER, MARKER_MULTI, MARKER_NARROW, MARKER_SINGLE, MARKER_WIDE,
    WIDE_POINTER_THRESHOLD,
};
use owfs_common::{DeviceAddress, PageNumber};
use tracing::debug;

use crate::bitmap::BitmapLocation;
use crate::chain::pages_needed;
use crate::device_map::{read_device_map, read_master_reference};
use crate::error::{FsError, FsResult};
use crate::layout::Layout;

/// Layout facts about a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mount {
    /// Record layout.
    pub layout: Layout,
    /// Where the free-page bitmap lives.
    pub bitmap: BitmapLocation,
    /// Pages over the whole group.
    pub total_pages: usize,
    /// Largest packet payload.
    pub max_packet_data_length: usize,
    /// Devices in the group.
    pub device_count: usize,
}

impl Mount {
    /// Returns the data bytes one file page carries.
    #[inline]
    pub fn usable(&self) -> usize {
        self.layout.usable(self.max_packet_data_length)
    }

    /// Returns true for a multi-device group.
    #[inline]
    pub fn is_multi_device(&self) -> bool {
        self.device_count > 1
    }
}

/// Result of reading a root page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Probe {
    /// The filesystem is valid for the cached group.
    Mounted(Mount),
    /// The device is a satellite of `master`.
    Satellite { master: DeviceAddress },
    /// The device map lists a different group than the cache holds.
    StaleGroup { group: Vec<DeviceAddress> },
}

/// Reads and validates the root page of the cached group.
pub(crate) fn probe(cache: &mut PageCache) -> FsResult<Probe> {
    let root = cache.read_page_packet(PageNumber::ROOT)?;
    let marker = *root
        .first()
        .ok_or_else(|| FsError::corrupt("empty root directory page"))?;
    let layout = Layout::from_marker(marker);
    let ptr_len = layout.ptr_len();
    if root.len() < layout.empty_dir_len() {
        return Err(FsError::corrupt("root directory page too short"));
    }
    let control = root[1 + ptr_len];
    let multi = marker & 0xF0 == MARKER_MULTI;
    let total = cache.total_pages();

    if multi && control & CONTROL_MASTER == 0 {
        let master = read_master_reference(cache, layout, layout.read_ptr(&root, 1))?;
        if master == cache.master() {
            return Err(FsError::corrupt("satellite device refers to itself as master"));
        }
        debug!(satellite = %cache.master(), %master, "satellite device found");
        return Ok(Probe::Satellite { master });
    }

    if multi && control & CONTROL_MASTER != 0 {
        let map_page = layout.read_ptr(&root, 1);
        if map_page == 0 || map_page >= total {
            return Err(FsError::corrupt(format!(
                "device map page {map_page} not valid"
            )));
        }
        let satellites = read_device_map(cache, layout, map_page)?;
        if satellites.as_slice() != &cache.addresses()[1..] {
            let mut group = Vec::with_capacity(satellites.len() + 1);
            group.push(cache.master());
            group.extend(satellites);
            return Ok(Probe::StaleGroup { group });
        }
    }

    let expected_width = if total > WIDE_POINTER_THRESHOLD {
        MARKER_WIDE
    } else {
        MARKER_NARROW
    };
    if marker & 0x0F != expected_width {
        return Err(FsError::corrupt(
            "filesystem marker does not match the number of pages",
        ));
    }
    let expected_span = if cache.device_count() > 1 {
        MARKER_MULTI
    } else {
        MARKER_SINGLE
    };
    if marker & 0xF0 != expected_span {
        return Err(FsError::corrupt(
            "filesystem marker does not match the number of devices",
        ));
    }

    let max = cache.max_packet_data_length();
    let bitmap = if control & CONTROL_LOCAL_BITMAP != 0 {
        BitmapLocation::LocalInRoot { offset: 2 + ptr_len }
    } else if cache.handles_page_bitmap() {
        BitmapLocation::CacheManaged
    } else {
        let control_len = layout.control_len();
        let start = layout.read_ptr(&root, control_len - 2 * ptr_len);
        let pages = layout.read_ptr(&root, control_len - ptr_len);
        if pages != bitmap_file_pages(total, layout, max) {
            return Err(FsError::corrupt(
                "incorrect number of pages in bitmap file",
            ));
        }
        if start == 0 || start + pages > total {
            return Err(FsError::corrupt(format!(
                "bitmap file at page {start} not valid"
            )));
        }
        BitmapLocation::DedicatedFile {
            start: PageNumber::new(start),
            pages,
        }
    };

    let mount = Mount {
        layout,
        bitmap,
        total_pages: total,
        max_packet_data_length: max,
        device_count: cache.device_count(),
    };
    debug!(master = %cache.master(), ?mount, "filesystem mounted");
    Ok(Probe::Mounted(mount))
}

/// Returns the number of pages the bitmap file of a `total`-page group
/// occupies.
pub(crate) fn bitmap_file_pages(total: usize, layout: Layout, max: usize) -> usize {
    pages_needed(owfs_common::bits::bytes_for_bits(total), layout, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use owfs_cache::sim::SimulatedBus;
    use owfs_cache::DeviceSource;
    use owfs_common::CacheConfig;

    const MASTER: DeviceAddress = DeviceAddress::new(0x0C);
    const SATELLITE: DeviceAddress = DeviceAddress::new(0x1C);

    fn cache(bus: &SimulatedBus, group: &[DeviceAddress]) -> PageCache {
        let devices = group.iter().map(|&a| bus.open_device(a).unwrap()).collect();
        PageCache::new(devices, CacheConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_local_bitmap_root() {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(MASTER, 32, 32);
        let mut cache = cache(&bus, &[MASTER]);
        cache
            .write_page_packet(PageNumber::ROOT, &[0xAA, 0, 0x80, 0x01, 0, 0, 0, 0])
            .unwrap();

        let Probe::Mounted(mount) = probe(&mut cache).unwrap() else {
            panic!("expected a mounted filesystem");
        };
        assert_eq!(mount.bitmap, BitmapLocation::LocalInRoot { offset: 3 });
        assert_eq!(mount.layout.ptr_len(), 1);
        assert_eq!(mount.usable(), 28);
        assert!(!mount.is_multi_device());
    }

    #[test]
    fn test_wrong_marker_is_corruption() {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(MASTER, 32, 32);
        let mut cache = cache(&bus, &[MASTER]);
        cache
            .write_page_packet(PageNumber::ROOT, &[0xAB, 0, 0, 0x80, 0x01, 0, 0, 0, 0, 0])
            .unwrap();
        assert!(probe(&mut cache).unwrap_err().is_fatal());

        cache
            .write_page_packet(PageNumber::ROOT, &[0xA5, 0, 0x80, 0x01, 0, 0, 0, 0])
            .unwrap();
        assert!(probe(&mut cache).unwrap_err().is_fatal());
    }

    #[test]
    fn test_short_root_is_corruption() {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(MASTER, 32, 32);
        let mut cache = cache(&bus, &[MASTER]);
        cache.write_page_packet(PageNumber::ROOT, &[0xAA, 0]).unwrap();
        assert!(probe(&mut cache).unwrap_err().is_fatal());
    }

    #[test]
    fn test_unformatted_device() {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(MASTER, 32, 32);
        let mut cache = cache(&bus, &[MASTER]);
        assert!(probe(&mut cache).unwrap_err().is_fatal());
    }

    #[test]
    fn test_satellite_points_at_master() {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(SATELLITE, 16, 32);
        let mut cache = cache(&bus, &[SATELLITE]);
        let layout = Layout::for_pages(16);
        cache
            .write_page_packet(PageNumber::ROOT, &crate::device_map::satellite_root_page(layout))
            .unwrap();
        cache
            .write_page_packet(
                PageNumber::new(1),
                &crate::device_map::master_reference_page(layout, MASTER),
            )
            .unwrap();

        assert_eq!(probe(&mut cache).unwrap(), Probe::Satellite { master: MASTER });
    }

    #[test]
    fn test_master_with_missing_satellites() {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(MASTER, 16, 32);
        let mut cache = cache(&bus, &[MASTER]);
        let layout = Layout::for_pages(16);
        cache
            .write_page_packet(PageNumber::ROOT, &[0xBA, 1, 0x82, 0x07, 0, 0, 0, 0])
            .unwrap();
        crate::device_map::write_device_map(&mut cache, layout, 1, &[SATELLITE]).unwrap();

        assert_eq!(
            probe(&mut cache).unwrap(),
            Probe::StaleGroup {
                group: vec![MASTER, SATELLITE]
            }
        );
    }

    #[test]
    fn test_bitmap_file_page_count_checked() {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(MASTER, 64, 32);
        let mut cache = cache(&bus, &[MASTER]);
        // 64 pages need an 8-byte bitmap: one page, not two.
        cache
            .write_page_packet(PageNumber::ROOT, &[0xAA, 0, 0, 0, 0, 1, 2, 0])
            .unwrap();
        assert!(probe(&mut cache).unwrap_err().is_fatal());

        cache
            .write_page_packet(PageNumber::ROOT, &[0xAA, 0, 0, 0, 0, 1, 1, 0])
            .unwrap();
        let Probe::Mounted(mount) = probe(&mut cache).unwrap() else {
            panic!("expected a mounted filesystem");
        };
        assert_eq!(
            mount.bitmap,
            BitmapLocation::DedicatedFile {
                start: PageNumber::new(1),
                pages: 1
            }
        );
    }
}
