//! Filesystem initialization.

use owfs_cache::PageCache;
use owfs_common::bits::{bytes_for_bits, write_bit};
use owfs_common::constants::{
    CONTROL_LOCAL_BITMAP, CONTROL_MASTER, DEVICE_ADDRESS_LEN, LOCAL_BITMAP_BYTES,
    LOCAL_BITMAP_MAX_PAGES,
};
use owfs_common::PageNumber;
use tracing::info;

use crate::bitmap::BitmapLocation;
use crate::chain::{pages_needed, write_contiguous_chain};
use crate::device_map::{
    master_reference_page, satellite_root_page, write_device_map, MASTER_REFERENCE_PAGE,
};
use crate::error::{FsError, FsResult};
use crate::layout::Layout;
use crate::mount::{bitmap_file_pages, Mount};

/// Writes an empty filesystem over the cached group.
///
/// The root page, device map, bitmap file and satellite placeholders are
/// buffered in the cache; nothing reaches the devices before `sync`.
pub(crate) fn format(cache: &mut PageCache) -> FsResult<Mount> {
    let total = cache.total_pages();
    let devices = cache.device_count();
    let multi = devices > 1;
    let layout = Layout::for_pages(total);
    let ptr_len = layout.ptr_len();
    let max = cache.max_packet_data_length();

    let mut root = vec![0u8; layout.empty_dir_len()];
    root[0] = layout.marker(multi);
    let control = 1 + ptr_len;

    let bitmap = if let Some((bitmap_page, bitmap_pages)) =
        cache.bitmap_location().filter(|_| cache.handles_page_bitmap())
    {
        root[control] = 0;
        layout.write_ptr(&mut root, control + 1, bitmap_page);
        layout.write_ptr(&mut root, control + 1 + ptr_len, bitmap_pages);
        cache.write_page_packet(PageNumber::ROOT, &root)?;
        cache.mark_used(PageNumber::ROOT)?;
        BitmapLocation::CacheManaged
    } else {
        let map_pages = if multi {
            pages_needed((devices - 1) * DEVICE_ADDRESS_LEN, layout, max)
        } else {
            0
        };
        let root_bank_pages = cache.pages_in_bank(0);
        let master_flag = if multi { CONTROL_MASTER } else { 0 };

        let (location, mut bits, reserved) = if total <= LOCAL_BITMAP_MAX_PAGES {
            root[control] = CONTROL_LOCAL_BITMAP | master_flag;
            (
                BitmapLocation::LocalInRoot {
                    offset: control + 1,
                },
                vec![0u8; LOCAL_BITMAP_BYTES],
                map_pages,
            )
        } else {
            let pages = bitmap_file_pages(total, layout, max);
            let start = map_pages + 1;
            root[control] = master_flag;
            layout.write_ptr(&mut root, layout.control_len() - 2 * ptr_len, start);
            layout.write_ptr(&mut root, layout.control_len() - ptr_len, pages);
            (
                BitmapLocation::DedicatedFile {
                    start: PageNumber::new(start),
                    pages,
                },
                vec![0u8; bytes_for_bits(total)],
                map_pages + pages,
            )
        };
        if reserved >= root_bank_pages {
            return Err(FsError::invalid_geometry(
                "root device does not have memory to support this many satellite devices",
            ));
        }
        for page in 0..=reserved {
            write_bit(&mut bits, page, true);
        }

        for device in 1..devices {
            let first = cache.page_offset_for_device(device).unwrap_or(total);
            let end = cache.page_offset_for_device(device + 1).unwrap_or(total);
            if end < first + 2 {
                return Err(FsError::invalid_geometry(format!(
                    "satellite device {device} has fewer than two pages"
                )));
            }
            cache.write_page_packet(PageNumber::new(first), &satellite_root_page(layout))?;
            cache.write_page_packet(
                PageNumber::new(first + MASTER_REFERENCE_PAGE),
                &master_reference_page(layout, cache.master()),
            )?;
            write_bit(&mut bits, first, true);
            write_bit(&mut bits, first + MASTER_REFERENCE_PAGE, true);
        }

        match location {
            BitmapLocation::LocalInRoot { offset } => {
                root[offset..offset + LOCAL_BITMAP_BYTES].copy_from_slice(&bits);
            }
            BitmapLocation::DedicatedFile { start, .. } => {
                write_contiguous_chain(cache, layout, start.index(), &bits)?;
            }
            BitmapLocation::CacheManaged => {}
        }

        if multi {
            layout.write_ptr(&mut root, 1, 1);
            let satellites = cache.addresses()[1..].to_vec();
            write_device_map(cache, layout, 1, &satellites)?;
        }
        cache.write_page_packet(PageNumber::ROOT, &root)?;
        location
    };

    info!(master = %cache.master(), devices, pages = total, ?bitmap, "filesystem formatted");
    Ok(Mount {
        layout,
        bitmap,
        total_pages: total,
        max_packet_data_length: max,
        device_count: devices,
    })
}
