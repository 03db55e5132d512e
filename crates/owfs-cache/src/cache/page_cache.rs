//! The page cache proper.

use std::collections::HashSet;

use owfs_common::{CacheConfig, DeviceAddress, PageNumber};
use tracing::{debug, trace, warn};

use super::bitmap::DeviceBitmap;
use super::error::{CacheError, CacheResult};
use super::page::{PageDescriptor, PageState};
use super::write_log::WriteLog;
use crate::bank::{BankGeometry, MemoryBank, MemoryDevice, WriteOnceBank};
use crate::packet::{
    encode_packet, packet_crc_ok, packet_len, page_seed, PACKET_OVERHEAD,
};

/// Size of the extra-info buffer handed to write-once CRC reads.
const EXTRA_INFO_LEN: usize = 8;

/// One memory bank placed in the group's page space.
#[derive(Debug)]
struct BankSlot {
    bank: MemoryBank,
    /// Index into the device list.
    device: usize,
    /// Group page number of the bank's page 0.
    first_page: usize,
    geometry: BankGeometry,
}

impl BankSlot {
    fn contains(&self, page: usize) -> bool {
        page >= self.first_page && page < self.first_page + self.geometry.page_count
    }
}

/// Cache over every page of one device group.
///
/// The cache mirrors each page in an arena of descriptors, buffers writes
/// in a [`WriteLog`](super::write_log) until [`sync`](Self::sync), and for
/// write-once groups maintains the redirect chain and the device bitmap.
///
/// A `PageCache` is not internally synchronized; share it through
/// [`SharedCache`](crate::registry::SharedCache), whose mutex serializes
/// bus traffic for the whole group.
#[derive(Debug)]
pub struct PageCache {
    config: CacheConfig,
    addresses: Vec<DeviceAddress>,
    slots: Vec<BankSlot>,
    /// First group page of each device.
    device_offsets: Vec<usize>,
    pages: Vec<PageDescriptor>,
    write_log: WriteLog,
    /// Present only for write-once groups.
    bitmap: Option<DeviceBitmap>,
    bitmap_location: Option<(usize, usize)>,
    max_packet_data_length: usize,
    last_page_read: Option<usize>,
    open_for_write: HashSet<String>,
}

impl PageCache {
    /// Creates a cache over the banks of `devices`, in order. The first
    /// device is the master.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidGeometry` for an empty group, a write-once group
    /// of more than one bank, or a bank whose packets do not fit its pages,
    /// and with `NoMemory` if the group has no pages.
    pub fn new(devices: Vec<MemoryDevice>, config: CacheConfig) -> CacheResult<Self> {
        if devices.is_empty() {
            return Err(CacheError::invalid_geometry("empty device group"));
        }
        let bank_count: usize = devices.iter().map(|d| d.banks.len()).sum();
        let write_once = devices
            .iter()
            .flat_map(|d| d.banks.iter())
            .any(MemoryBank::is_write_once);
        if write_once && bank_count != 1 {
            return Err(CacheError::invalid_geometry(
                "a write-once group must consist of a single bank on a single device",
            ));
        }

        let mut addresses = Vec::with_capacity(devices.len());
        let mut device_offsets = Vec::with_capacity(devices.len());
        let mut slots = Vec::with_capacity(bank_count);
        let mut total = 0;
        for (index, device) in devices.into_iter().enumerate() {
            addresses.push(device.address);
            device_offsets.push(total);
            for bank in device.banks {
                let geometry = bank.geometry();
                if geometry.max_packet_data_length + PACKET_OVERHEAD > geometry.page_length
                    || geometry.max_packet_data_length > usize::from(u8::MAX)
                {
                    return Err(CacheError::invalid_geometry(format!(
                        "bank on {} carries {}-byte packets on {}-byte pages",
                        device.address, geometry.max_packet_data_length, geometry.page_length
                    )));
                }
                slots.push(BankSlot {
                    bank,
                    device: index,
                    first_page: total,
                    geometry,
                });
                total += geometry.page_count;
            }
        }
        if total == 0 {
            return Err(CacheError::NoMemory);
        }

        let max_packet_data_length = slots
            .iter()
            .map(|s| s.geometry.max_packet_data_length)
            .min()
            .unwrap_or(0);
        let pages = slots
            .iter()
            .flat_map(|s| {
                (0..s.geometry.page_count).map(move |_| PageDescriptor::new(s.geometry.page_length))
            })
            .collect();

        let (bitmap, bitmap_location) = match slots.first_mut().and_then(|s| s.bank.as_write_once())
        {
            Some(bank) => (
                Some(DeviceBitmap::new(
                    bank.bitmap_len(),
                    bank.bitmap_bit_offset(),
                    total,
                )),
                Some(bank.bitmap_location()),
            ),
            None => (None, None),
        };

        debug!(
            master = %addresses[0],
            devices = addresses.len(),
            pages = total,
            write_once,
            "page cache created"
        );

        Ok(Self {
            config,
            addresses,
            slots,
            device_offsets,
            pages,
            write_log: WriteLog::with_capacity(total),
            bitmap,
            bitmap_location,
            max_packet_data_length,
            last_page_read: None,
            open_for_write: HashSet::new(),
        })
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    /// Returns the master device address.
    pub fn master(&self) -> DeviceAddress {
        self.addresses[0]
    }

    /// Returns the device list, master first.
    pub fn addresses(&self) -> &[DeviceAddress] {
        &self.addresses
    }

    /// Returns the number of devices in the group.
    pub fn device_count(&self) -> usize {
        self.addresses.len()
    }

    /// Returns the number of pages over all banks of all devices.
    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    /// Returns the number of banks.
    pub fn bank_count(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of pages in bank `bank`, or 0 if there is no such
    /// bank.
    pub fn pages_in_bank(&self, bank: usize) -> usize {
        self.slots.get(bank).map_or(0, |s| s.geometry.page_count)
    }

    /// Returns the group page number of a device's first page.
    pub fn page_offset_for_device(&self, device: usize) -> Option<usize> {
        self.device_offsets.get(device).copied()
    }

    /// Returns the index of the device holding `page`.
    pub fn device_index(&self, page: PageNumber) -> usize {
        self.device_offsets
            .iter()
            .rposition(|&offset| offset <= page.index())
            .unwrap_or(0)
    }

    /// Returns the largest payload one packet can carry.
    pub fn max_packet_data_length(&self) -> usize {
        self.max_packet_data_length
    }

    /// Returns true for a write-once group.
    pub fn is_write_once(&self) -> bool {
        self.bitmap.is_some()
    }

    /// Returns true if the device keeps the free-page bitmap itself.
    pub fn handles_page_bitmap(&self) -> bool {
        self.bitmap.is_some()
    }

    /// Returns `(page, page_count)` of the device bitmap storage.
    pub fn bitmap_location(&self) -> Option<(usize, usize)> {
        self.bitmap_location
    }

    // =========================================================================
    // Page Access
    // =========================================================================

    /// Returns the payload of the packet on `page`.
    ///
    /// Cached pages are served without bus traffic. Write-once pages are
    /// followed along their redirect chain to the current copy.
    ///
    /// # Errors
    ///
    /// `CrcMismatch`/`InvalidPacketLength` for a bad packet,
    /// `CircularRedirect` for a redirect loop, `UnstableRead` when an
    /// ordinary page never reads the same twice, and any bank error.
    pub fn read_page_packet(&mut self, page: PageNumber) -> CacheResult<Vec<u8>> {
        self.check_page(page)?;
        self.ensure_bitmap()?;

        let desc = &self.pages[page.index()];
        if desc.is_cached() {
            trace!(%page, len = desc.len, "page cache hit");
            return Ok(desc.payload().to_vec());
        }

        trace!(%page, "page cache miss");
        let terminal = if self.is_write_once() {
            self.read_write_once(page)?
        } else {
            self.read_ordinary(page)?;
            page
        };
        Ok(self.pages[terminal.index()].payload().to_vec())
    }

    /// Buffers `data` as the new packet of `page`.
    ///
    /// On a write-once group the packet lands on the end of the page's
    /// redirect chain; the page actually written is returned.
    ///
    /// # Errors
    ///
    /// `PacketTooLarge` if `data` exceeds the packet size, and any error
    /// met while following the redirect chain.
    pub fn write_page_packet(&mut self, page: PageNumber, data: &[u8]) -> CacheResult<PageNumber> {
        self.check_page(page)?;
        if data.len() > self.max_packet_data_length {
            return Err(CacheError::PacketTooLarge {
                length: data.len(),
                max: self.max_packet_data_length,
            });
        }
        self.ensure_bitmap()?;

        let target = if self.is_write_once() {
            self.resolve_write_target(page)?
        } else {
            page
        };
        let seed = self.seed(target);
        let write_once = self.is_write_once();

        let desc = &mut self.pages[target.index()];
        encode_packet(seed, data, &mut desc.frame);
        desc.len = data.len();
        desc.state = if write_once {
            PageState::PendingVerify
        } else {
            PageState::PendingWrite
        };
        self.write_log.record(target);

        trace!(%page, %target, len = data.len(), "page packet buffered");
        Ok(target)
    }

    /// Flushes every logged page, oldest first, then the device bitmap.
    ///
    /// On failure the log keeps every page not yet flushed; calling `sync`
    /// again resumes where it stopped.
    pub fn sync(&mut self) -> CacheResult<()> {
        if !self.write_log.is_empty() {
            debug!(master = %self.master(), pages = self.write_log.len(), "syncing page cache");
        }
        while let Some(page) = self.write_log.oldest() {
            self.flush_page(page)?;
        }
        self.flush_bitmap()
    }

    /// Forgets the previous-page hint so the next read re-addresses the
    /// device.
    pub fn clear_last_page_read(&mut self) {
        self.last_page_read = None;
    }

    /// Drops the cached copy of a clean page. Returns false if the page is
    /// dirty or out of range.
    pub fn invalidate(&mut self, page: PageNumber) -> bool {
        match self.pages.get_mut(page.index()) {
            Some(desc) if !desc.state.is_dirty() => {
                desc.state = PageState::NotRead;
                desc.redirect = None;
                true
            }
            _ => false,
        }
    }

    /// Returns the number of pages waiting to be flushed.
    pub fn dirty_page_count(&self) -> usize {
        self.write_log.len()
    }

    /// Returns the cache state of a page.
    pub fn page_state(&self, page: PageNumber) -> Option<PageState> {
        self.pages.get(page.index()).map(|d| d.state)
    }

    // =========================================================================
    // Device Bitmap
    // =========================================================================

    /// Marks a page used in the device bitmap.
    pub fn mark_used(&mut self, page: PageNumber) -> CacheResult<()> {
        self.check_page(page)?;
        self.bitmap_mut()?.mark_used(page.index());
        Ok(())
    }

    /// Frees a page in the device bitmap if it was never flushed as used.
    ///
    /// Returns false when the device already records the page as used:
    /// write-once pages cannot be reclaimed.
    pub fn free_if_cached(&mut self, page: PageNumber) -> CacheResult<bool> {
        self.check_page(page)?;
        Ok(self.bitmap_mut()?.free_if_unflushed(page.index()))
    }

    /// Returns the first free page and restarts the free-page cursor.
    pub fn first_free_page(&mut self) -> CacheResult<Option<PageNumber>> {
        Ok(self.bitmap_mut()?.first_free().map(PageNumber::new))
    }

    /// Returns the next free page after the last one returned.
    pub fn next_free_page(&mut self) -> CacheResult<Option<PageNumber>> {
        Ok(self.bitmap_mut()?.next_free().map(PageNumber::new))
    }

    /// Returns the number of free pages.
    pub fn free_page_count(&mut self) -> CacheResult<usize> {
        Ok(self.bitmap_mut()?.free_count())
    }

    // =========================================================================
    // Open-for-write Registry
    // =========================================================================

    /// Records `key` as open for writing. Returns false if it already was.
    pub fn mark_open_for_write(&mut self, key: &str) -> bool {
        self.open_for_write.insert(key.to_owned())
    }

    /// Returns true if `key` is open for writing.
    pub fn is_open_for_write(&self, key: &str) -> bool {
        self.open_for_write.contains(key)
    }

    /// Releases a write-open mark. Returns false if `key` was not marked.
    pub fn release_open_for_write(&mut self, key: &str) -> bool {
        self.open_for_write.remove(key)
    }

    // ----- Private helpers -----

    fn check_page(&self, page: PageNumber) -> CacheResult<()> {
        if page.index() >= self.pages.len() {
            return Err(CacheError::PageOutOfRange {
                page,
                total: self.pages.len(),
            });
        }
        Ok(())
    }

    /// Returns `(slot index, bank-local page)`.
    fn locate(&self, page: usize) -> (usize, usize) {
        let slot = self
            .slots
            .iter()
            .position(|s| s.contains(page))
            .unwrap_or(0);
        (slot, page - self.slots[slot].first_page)
    }

    /// CRC seed: the page number local to its device.
    fn seed(&self, page: PageNumber) -> u16 {
        let device = self.device_index(page);
        page_seed(page.index() - self.device_offsets[device])
    }

    /// True if the bus is still positioned right after the preceding page
    /// of the same bank.
    fn continued(&self, page: usize) -> bool {
        let (slot, local) = self.locate(page);
        local > 0 && self.last_page_read == Some(page - 1) && self.slots[slot].contains(page - 1)
    }

    fn to_group_page(&self, slot: usize, local: usize, from: PageNumber) -> CacheResult<PageNumber> {
        let target = self.slots[slot].first_page + local;
        if local >= self.slots[slot].geometry.page_count {
            return Err(CacheError::InvalidRedirect {
                page: from,
                target,
            });
        }
        Ok(PageNumber::new(target))
    }

    fn ensure_bitmap(&mut self) -> CacheResult<()> {
        let Some(bitmap) = self.bitmap.as_mut() else {
            return Ok(());
        };
        if bitmap.is_loaded() {
            return Ok(());
        }
        let mut buf = vec![0u8; bitmap.buffer_len()];
        write_once_bank(&mut self.slots)?.read_bitmap(&mut buf)?;
        bitmap.load(&buf);
        trace!(master = %self.addresses[0], "device bitmap loaded");
        Ok(())
    }

    fn bitmap_mut(&mut self) -> CacheResult<&mut DeviceBitmap> {
        self.ensure_bitmap()?;
        self.bitmap.as_mut().ok_or(CacheError::NoPageBitmap)
    }

    /// Reads an ordinary page until its CRC verifies or the same bad data
    /// comes back twice.
    fn read_ordinary(&mut self, page: PageNumber) -> CacheResult<()> {
        let index = page.index();
        let (slot, local) = self.locate(index);
        let seed = self.seed(page);
        let max = self.max_packet_data_length;
        let mut raw = vec![0u8; self.slots[slot].geometry.page_length];

        for attempt in 1..=self.config.max_read_attempts {
            let continued = self.continued(index);
            self.slots[slot].bank.read_page(local, continued, &mut raw)?;
            self.last_page_read = Some(index);

            let desc = &mut self.pages[index];
            if packet_len(&raw) <= max && packet_crc_ok(seed, &raw) {
                desc.frame.copy_from_slice(&raw);
                desc.len = packet_len(&raw);
                desc.state = PageState::ReadWithCrc;
                return Ok(());
            }
            if raw == desc.frame {
                desc.state = PageState::ReadWithoutCrc;
                return Err(CacheError::CrcMismatch { page });
            }
            trace!(%page, attempt, "invalid CRC, re-reading page");
            desc.frame.copy_from_slice(&raw);
            desc.state = PageState::ReadWithoutCrc;
        }

        Err(CacheError::UnstableRead {
            page,
            attempts: self.config.max_read_attempts,
        })
    }

    /// Follows the redirect chain from `start` and returns the page that
    /// holds the current packet.
    fn read_write_once(&mut self, start: PageNumber) -> CacheResult<PageNumber> {
        let total = self.pages.len();
        let mut page = start;
        let mut hops = 0;

        loop {
            let desc = &self.pages[page.index()];
            if let Some(next) = desc.forward() {
                hops += 1;
                if hops > total {
                    return Err(CacheError::CircularRedirect { page: start });
                }
                trace!(from = %page, to = %next, "following redirect");
                page = next;
                continue;
            }
            if desc.state.holds_packet() {
                return Ok(page);
            }

            self.fetch_write_once(page)?;
            if self.pages[page.index()].redirect.is_none() {
                self.verify_fetched(page)?;
                return Ok(page);
            }
        }
    }

    /// Reads a write-once page and its redirect byte into the cache.
    fn fetch_write_once(&mut self, page: PageNumber) -> CacheResult<()> {
        let index = page.index();
        let (slot, local) = self.locate(index);
        let continued = self.continued(index);

        let bank = write_once_bank(&mut self.slots)?;
        let desc = &mut self.pages[index];
        let redirect = if bank.has_extra_info() {
            let mut extra = [0u8; EXTRA_INFO_LEN];
            bank.read_page_crc(local, continued, &mut desc.frame, Some(&mut extra))?;
            self.last_page_read = Some(index);
            usize::from(!extra[0])
        } else {
            bank.read_page_crc(local, continued, &mut desc.frame, None)?;
            self.last_page_read = None;
            bank.redirected_page(local)?
        };
        desc.state = PageState::ReadWithoutCrc;
        desc.redirect = None;

        if redirect != 0 {
            let target = self.to_group_page(slot, redirect, page)?;
            self.pages[index].redirect = Some(target);
        }
        Ok(())
    }

    fn verify_fetched(&mut self, page: PageNumber) -> CacheResult<()> {
        let seed = self.seed(page);
        let max = self.max_packet_data_length;
        let desc = &mut self.pages[page.index()];

        let length = packet_len(&desc.frame);
        if length > max {
            return Err(CacheError::InvalidPacketLength { page, length, max });
        }
        if !packet_crc_ok(seed, &desc.frame) {
            return Err(CacheError::CrcMismatch { page });
        }
        desc.len = length;
        desc.state = PageState::ReadWithCrc;
        Ok(())
    }

    fn query_redirect(&mut self, page: PageNumber) -> CacheResult<Option<PageNumber>> {
        let (slot, local) = self.locate(page.index());
        let redirect = write_once_bank(&mut self.slots)?.redirected_page(local)?;
        if redirect == 0 {
            return Ok(None);
        }
        self.to_group_page(slot, redirect, page).map(Some)
    }

    /// Finds the page a write to `page` must land on: the end of its
    /// redirect chain, refreshed from the device.
    fn resolve_write_target(&mut self, page: PageNumber) -> CacheResult<PageNumber> {
        let total = self.pages.len();
        {
            let desc = &self.pages[page.index()];
            if desc.redirect.is_none() && desc.state == PageState::NotRead {
                let redirect = self.query_redirect(page)?;
                self.pages[page.index()].redirect = redirect;
            }
        }

        let mut last = page;
        let mut hops = 0;
        while let Some(next) = self.pages[last.index()].forward() {
            hops += 1;
            if hops > total {
                return Err(CacheError::CircularRedirect { page });
            }
            last = next;
            if !self.pages[last.index()].state.is_dirty() {
                let redirect = self.query_redirect(last)?;
                self.pages[last.index()].redirect = redirect;
            }
            self.last_page_read = None;
        }
        if last != page {
            trace!(%page, %last, "redirect chain ends");
        }
        Ok(last)
    }

    fn flush_page(&mut self, page: PageNumber) -> CacheResult<()> {
        match self.pages[page.index()].state {
            PageState::PendingVerify => {
                if let Some(new_page) = self.verify_or_relocate(page)? {
                    self.write_log.push_oldest(new_page);
                    return Ok(());
                }
                self.write_physical(page)
            }
            PageState::PendingRedirect { to } => {
                // The replacement must be on the device before anyone is
                // sent to it.
                if self.write_log.contains(to) {
                    self.write_log.push_oldest(to);
                    return Ok(());
                }
                self.issue_redirect(page, to)
            }
            PageState::PendingWrite => self.write_physical(page),
            _ => {
                self.write_log.pop_oldest();
                Ok(())
            }
        }
    }

    /// Checks whether the desired packet can be burned over the device's
    /// current content. If not, moves it to a fresh page and returns that
    /// page.
    fn verify_or_relocate(&mut self, page: PageNumber) -> CacheResult<Option<PageNumber>> {
        let index = page.index();
        let (slot, local) = self.locate(index);
        let continued = self.continued(index);
        let mut current = vec![0u8; self.slots[slot].geometry.page_length];
        write_once_bank(&mut self.slots)?.read_page_crc(local, continued, &mut current, None)?;
        self.last_page_read = Some(index);

        let desc = &self.pages[index];
        let framed = desc.len + PACKET_OVERHEAD;
        // Write-once cells only go from 1 to 0.
        let conflict = current[..framed]
            .iter()
            .zip(&desc.frame[..framed])
            .any(|(&dev, &want)| (dev ^ want) & !dev != 0);
        if !conflict {
            self.pages[index].state = PageState::PendingWrite;
            return Ok(None);
        }

        let bitmap = self.bitmap_mut()?;
        let mut candidate = bitmap.first_free();
        while candidate == Some(index) {
            bitmap.mark_used(index);
            candidate = bitmap.next_free();
        }
        let new_index = candidate.ok_or(CacheError::OutOfSpace { page })?;
        bitmap.mark_used(new_index);

        let new_page = PageNumber::new(new_index);
        let payload = self.pages[index].payload().to_vec();
        let seed = self.seed(new_page);
        let new_desc = &mut self.pages[new_index];
        encode_packet(seed, &payload, &mut new_desc.frame);
        new_desc.len = payload.len();
        new_desc.state = PageState::PendingVerify;
        new_desc.redirect = None;
        self.pages[index].state = PageState::PendingRedirect { to: new_page };

        debug!(%page, %new_page, "page cannot be rewritten in place, relocating");
        Ok(Some(new_page))
    }

    fn issue_redirect(&mut self, page: PageNumber, to: PageNumber) -> CacheResult<()> {
        let (_, local) = self.locate(page.index());
        let (_, local_to) = self.locate(to.index());
        write_once_bank(&mut self.slots)?.redirect_page(local, local_to)?;

        let desc = &mut self.pages[page.index()];
        desc.state = PageState::NotRead;
        desc.redirect = Some(to);
        self.last_page_read = None;
        self.write_log.pop_oldest();
        debug!(%page, %to, "page redirected");
        Ok(())
    }

    fn write_physical(&mut self, page: PageNumber) -> CacheResult<()> {
        let index = page.index();
        let (slot, local) = self.locate(index);
        let desc = &mut self.pages[index];
        let framed = desc.len + PACKET_OVERHEAD;
        self.slots[slot]
            .bank
            .write_page(local, &desc.frame[..framed])?;

        desc.state = PageState::ReadWithCrc;
        self.last_page_read = None;
        self.write_log.pop_oldest();
        trace!(%page, device = self.slots[slot].device, "page written");
        Ok(())
    }

    /// Writes the bits of the device bitmap that changed since it was last
    /// read, then reads it back.
    fn flush_bitmap(&mut self) -> CacheResult<()> {
        let Some(bitmap) = self.bitmap.as_mut() else {
            return Ok(());
        };
        if !bitmap.is_loaded() {
            return Ok(());
        }
        let Some(diff) = bitmap.pending_write() else {
            return Ok(());
        };

        let bank = write_once_bank(&mut self.slots)?;
        bank.write_bitmap(&diff)?;
        if self.config.verify_bitmap_writeback {
            let mut readback = vec![0u8; bitmap.buffer_len()];
            bank.read_bitmap(&mut readback)?;
            if readback != bitmap.modified() {
                return Err(CacheError::BitmapVerification);
            }
            bitmap.commit(&readback);
        } else {
            let modified = bitmap.modified().to_vec();
            bitmap.commit(&modified);
        }
        debug!(master = %self.addresses[0], "device bitmap flushed");
        Ok(())
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if !self.write_log.is_empty() {
            warn!(
                master = %self.addresses[0],
                pages = self.write_log.len(),
                "page cache dropped with unflushed pages"
            );
        }
    }
}

/// The write-once bank of a write-once group (always the only bank).
fn write_once_bank(slots: &mut [BankSlot]) -> CacheResult<&mut dyn WriteOnceBank> {
    slots
        .first_mut()
        .and_then(|s| s.bank.as_write_once())
        .ok_or(CacheError::NoPageBitmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::DeviceSource;
    use crate::packet::packet_crc_ok;
    use crate::sim::SimulatedBus;
    use owfs_common::ErrorKind;

    const EEPROM: DeviceAddress = DeviceAddress::new(0x2D);
    const SATELLITE: DeviceAddress = DeviceAddress::new(0x3D);
    const OTP: DeviceAddress = DeviceAddress::new(0x0B);

    fn p(n: usize) -> PageNumber {
        PageNumber::new(n)
    }

    fn open(bus: &SimulatedBus, group: &[DeviceAddress]) -> PageCache {
        let devices = group
            .iter()
            .map(|&a| bus.open_device(a).unwrap())
            .collect();
        PageCache::new(devices, CacheConfig::for_testing()).unwrap()
    }

    fn eeprom_bus() -> SimulatedBus {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(EEPROM, 16, 32);
        bus
    }

    fn otp_bus() -> SimulatedBus {
        let bus = SimulatedBus::new();
        bus.add_otp_device(OTP, 32, 32);
        bus
    }

    #[test]
    fn test_round_trip_through_device() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        assert_eq!(cache.write_page_packet(p(2), b"some bytes").unwrap(), p(2));
        assert_eq!(cache.page_state(p(2)), Some(PageState::PendingWrite));
        cache.sync().unwrap();
        assert_eq!(cache.page_state(p(2)), Some(PageState::ReadWithCrc));
        drop(cache);

        let mut fresh = open(&bus, &[EEPROM]);
        assert_eq!(fresh.read_page_packet(p(2)).unwrap(), b"some bytes");
    }

    #[test]
    fn test_cached_read_skips_bus() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        cache.write_page_packet(p(1), b"abc").unwrap();
        cache.sync().unwrap();

        let mut fresh = open(&bus, &[EEPROM]);
        fresh.read_page_packet(p(1)).unwrap();
        let reads = bus.stats(EEPROM).unwrap().page_reads;
        fresh.read_page_packet(p(1)).unwrap();
        assert_eq!(bus.stats(EEPROM).unwrap().page_reads, reads);
    }

    #[test]
    fn test_write_is_buffered_until_sync() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        cache.write_page_packet(p(1), b"one").unwrap();
        cache.write_page_packet(p(1), b"two").unwrap();
        assert_eq!(cache.dirty_page_count(), 1);
        assert_eq!(bus.stats(EEPROM).unwrap().page_writes, 0);
        assert_eq!(cache.read_page_packet(p(1)).unwrap(), b"two");

        cache.sync().unwrap();
        assert_eq!(bus.stats(EEPROM).unwrap().page_writes, 1);
    }

    #[test]
    fn test_idempotent_sync() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        cache.write_page_packet(p(3), b"x").unwrap();
        cache.sync().unwrap();
        bus.reset_stats(EEPROM);

        cache.sync().unwrap();
        assert_eq!(bus.stats(EEPROM).unwrap(), Default::default());
        assert_eq!(cache.dirty_page_count(), 0);
    }

    #[test]
    fn test_corrupted_payload_is_rejected() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        cache.write_page_packet(p(4), b"payload").unwrap();
        cache.sync().unwrap();
        assert!(bus.corrupt_byte(EEPROM, 4, 3, 0x40));

        let mut fresh = open(&bus, &[EEPROM]);
        let err = fresh.read_page_packet(p(4)).unwrap_err();
        assert!(matches!(err, CacheError::CrcMismatch { page } if page == p(4)));
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert_eq!(fresh.page_state(p(4)), Some(PageState::ReadWithoutCrc));

        // The original cache still has the good copy until invalidated.
        assert_eq!(cache.read_page_packet(p(4)).unwrap(), b"payload");
        assert!(cache.invalidate(p(4)));
        assert!(cache.read_page_packet(p(4)).is_err());
    }

    #[test]
    fn test_unstable_reads_give_up() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        cache.write_page_packet(p(1), b"data").unwrap();
        cache.sync().unwrap();

        bus.set_unstable_reads(EEPROM, true);
        bus.reset_stats(EEPROM);
        let mut fresh = open(&bus, &[EEPROM]);
        let err = fresh.read_page_packet(p(1)).unwrap_err();
        assert!(matches!(err, CacheError::UnstableRead { attempts: 4, .. }));
        assert!(err.is_retryable());
        assert_eq!(bus.stats(EEPROM).unwrap().page_reads, 4);
    }

    #[test]
    fn test_invalidate_dirty_page_refused() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        cache.write_page_packet(p(1), b"data").unwrap();
        assert!(!cache.invalidate(p(1)));
        assert!(!cache.invalidate(p(99)));
    }

    #[test]
    fn test_argument_checks() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        assert_eq!(cache.max_packet_data_length(), 29);

        let err = cache.write_page_packet(p(0), &[0u8; 30]).unwrap_err();
        assert!(matches!(err, CacheError::PacketTooLarge { length: 30, max: 29 }));
        let err = cache.read_page_packet(p(16)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(matches!(
            cache.free_page_count(),
            Err(CacheError::NoPageBitmap)
        ));
    }

    #[test]
    fn test_sync_resumes_after_transport_failure() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        for n in 1..=3 {
            cache.write_page_packet(p(n), &[n as u8; 5]).unwrap();
        }
        bus.fail_next_operations(EEPROM, 1);
        let err = cache.sync().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(cache.dirty_page_count(), 3);

        cache.sync().unwrap();
        assert_eq!(cache.dirty_page_count(), 0);
        let mut fresh = open(&bus, &[EEPROM]);
        assert_eq!(fresh.read_page_packet(p(3)).unwrap(), vec![3u8; 5]);
    }

    #[test]
    fn test_multi_device_page_space() {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(EEPROM, 8, 32);
        bus.add_eeprom_device(SATELLITE, 8, 32);
        let mut cache = open(&bus, &[EEPROM, SATELLITE]);
        assert_eq!(cache.total_pages(), 16);
        assert_eq!(cache.device_count(), 2);
        assert_eq!(cache.page_offset_for_device(1), Some(8));
        assert_eq!(cache.device_index(p(7)), 0);
        assert_eq!(cache.device_index(p(9)), 1);

        cache.write_page_packet(p(9), b"satellite").unwrap();
        cache.sync().unwrap();
        let raw = bus.page_bytes(SATELLITE, 1).unwrap();
        assert_eq!(raw[0], 9);
        assert!(packet_crc_ok(1, &raw));
    }

    #[test]
    fn test_multi_bank_device() {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device_banks(
            EEPROM,
            &[BankGeometry::new(4, 16), BankGeometry::new(4, 32)],
        );
        let mut cache = open(&bus, &[EEPROM]);
        assert_eq!(cache.bank_count(), 2);
        assert_eq!(cache.pages_in_bank(1), 4);
        assert_eq!(cache.pages_in_bank(2), 0);
        assert_eq!(cache.max_packet_data_length(), 13);

        cache.write_page_packet(p(5), &[0xA5; 13]).unwrap();
        cache.sync().unwrap();
        assert_eq!(bus.page_bytes(EEPROM, 5).unwrap()[0], 13);

        let mut fresh = open(&bus, &[EEPROM]);
        assert_eq!(fresh.read_page_packet(p(5)).unwrap(), vec![0xA5; 13]);
    }

    #[test]
    fn test_write_once_group_must_be_single_device() {
        let bus = otp_bus();
        bus.add_otp_device(SATELLITE, 8, 32);
        let devices = vec![
            bus.open_device(OTP).unwrap(),
            bus.open_device(SATELLITE).unwrap(),
        ];
        let err = PageCache::new(devices, CacheConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidGeometry);
    }

    #[test]
    fn test_otp_rewrite_redirects() {
        let bus = otp_bus();
        let mut cache = open(&bus, &[OTP]);
        assert!(cache.is_write_once());
        assert!(cache.handles_page_bitmap());
        for n in 0..=5 {
            cache.mark_used(p(n)).unwrap();
        }

        cache.write_page_packet(p(5), &[0x11; 10]).unwrap();
        cache.sync().unwrap();
        assert_eq!(cache.page_state(p(5)), Some(PageState::ReadWithCrc));
        let first = bus.page_bytes(OTP, 5).unwrap();

        cache.write_page_packet(p(5), &[0x22; 20]).unwrap();
        cache.sync().unwrap();

        let stats = bus.stats(OTP).unwrap();
        assert_eq!(stats.redirects, 1);
        assert_eq!(stats.page_writes, 2);
        assert_eq!(bus.page_bytes(OTP, 5).unwrap(), first);
        assert_eq!(bus.redirect_of(OTP, 5), Some(6));
        assert_eq!(cache.read_page_packet(p(5)).unwrap(), vec![0x22; 20]);

        let mut fresh = open(&bus, &[OTP]);
        assert_eq!(fresh.read_page_packet(p(5)).unwrap(), vec![0x22; 20]);
        assert!(!fresh.free_if_cached(p(6)).unwrap());
    }

    #[test]
    fn test_otp_compatible_rewrite_stays_in_place() {
        let bus = otp_bus();
        let mut cache = open(&bus, &[OTP]);
        cache.mark_used(p(0)).unwrap();
        cache.write_page_packet(p(3), &[0xFF, 0xFF]).unwrap();
        cache.sync().unwrap();

        // Identical content burns over itself.
        cache.write_page_packet(p(3), &[0xFF, 0xFF]).unwrap();
        cache.sync().unwrap();
        assert_eq!(bus.stats(OTP).unwrap().redirects, 0);
    }

    #[test]
    fn test_otp_write_follows_redirect_chain() {
        let bus = otp_bus();
        let mut cache = open(&bus, &[OTP]);
        for n in 0..=5 {
            cache.mark_used(p(n)).unwrap();
        }
        cache.write_page_packet(p(5), &[0x01; 4]).unwrap();
        cache.sync().unwrap();
        cache.write_page_packet(p(5), &[0x7E; 12]).unwrap();
        cache.sync().unwrap();
        drop(cache);

        let mut fresh = open(&bus, &[OTP]);
        assert_eq!(fresh.write_page_packet(p(5), &[0x00; 12]).unwrap(), p(6));
    }

    #[test]
    fn test_otp_without_extra_info() {
        let bus = otp_bus();
        bus.set_extra_info(OTP, false);
        let mut cache = open(&bus, &[OTP]);
        cache.mark_used(p(0)).unwrap();
        cache.write_page_packet(p(1), &[0x01]).unwrap();
        cache.sync().unwrap();
        cache.write_page_packet(p(1), &[0x02, 0x03]).unwrap();
        cache.sync().unwrap();
        let target = bus.redirect_of(OTP, 1).unwrap();
        assert_ne!(target, 0);

        let mut fresh = open(&bus, &[OTP]);
        assert_eq!(fresh.read_page_packet(p(1)).unwrap(), vec![0x02, 0x03]);
    }

    #[test]
    fn test_circular_redirect_detected() {
        let bus = otp_bus();
        bus.force_redirect(OTP, 2, 3);
        bus.force_redirect(OTP, 3, 2);
        let mut cache = open(&bus, &[OTP]);
        let err = cache.read_page_packet(p(2)).unwrap_err();
        assert!(matches!(err, CacheError::CircularRedirect { page } if page == p(2)));
        assert!(err.is_fatal());

        let err = cache.write_page_packet(p(3), b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_redirect_out_of_range() {
        let bus = otp_bus();
        bus.force_redirect(OTP, 4, 200);
        let mut cache = open(&bus, &[OTP]);
        let err = cache.read_page_packet(p(4)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidRedirect { target: 200, .. }));
    }

    #[test]
    fn test_device_bitmap_helpers() {
        let bus = SimulatedBus::new();
        bus.add_otp_device(OTP, 16, 32);
        let mut cache = open(&bus, &[OTP]);
        assert_eq!(cache.free_page_count().unwrap(), 16);
        assert_eq!(cache.bitmap_location(), Some((0, 1)));

        cache.mark_used(p(0)).unwrap();
        cache.mark_used(p(1)).unwrap();
        assert_eq!(cache.free_page_count().unwrap(), 14);
        assert!(cache.free_if_cached(p(1)).unwrap());
        assert_eq!(cache.free_page_count().unwrap(), 15);

        cache.mark_used(p(1)).unwrap();
        cache.sync().unwrap();
        assert_eq!(bus.bitmap_bytes(OTP).unwrap(), vec![0xFC, 0xFF]);
        assert!(!cache.free_if_cached(p(1)).unwrap());
        assert_eq!(cache.first_free_page().unwrap(), Some(p(2)));
        assert_eq!(cache.next_free_page().unwrap(), Some(p(3)));

        bus.reset_stats(OTP);
        cache.sync().unwrap();
        assert_eq!(bus.stats(OTP).unwrap().bitmap_writes, 0);
    }

    #[test]
    fn test_bitmap_readback_mismatch_fails_sync() {
        let bus = otp_bus();
        bus.set_ignore_bitmap_writes(OTP, true);
        let mut cache = open(&bus, &[OTP]);
        cache.mark_used(p(0)).unwrap();
        let err = cache.sync().unwrap_err();
        assert!(matches!(err, CacheError::BitmapVerification));
        assert_eq!(err.kind(), ErrorKind::SyncVerification);
    }

    #[test]
    fn test_redirect_out_of_space() {
        let bus = SimulatedBus::new();
        bus.add_otp_device(OTP, 8, 32);
        let mut cache = open(&bus, &[OTP]);
        for n in 0..8 {
            cache.mark_used(p(n)).unwrap();
        }
        cache.write_page_packet(p(2), &[0x0F]).unwrap();
        cache.sync().unwrap();
        cache.write_page_packet(p(2), &[0xF0, 0xF0]).unwrap();
        let err = cache.sync().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfSpace);
        assert_eq!(cache.dirty_page_count(), 1);
    }

    #[test]
    fn test_open_for_write_marks() {
        let bus = eeprom_bus();
        let mut cache = open(&bus, &[EEPROM]);
        assert!(cache.mark_open_for_write("0C/DATA.1"));
        assert!(!cache.mark_open_for_write("0C/DATA.1"));
        assert!(cache.is_open_for_write("0C/DATA.1"));
        assert!(cache.release_open_for_write("0C/DATA.1"));
        assert!(!cache.release_open_for_write("0C/DATA.1"));
    }
}
