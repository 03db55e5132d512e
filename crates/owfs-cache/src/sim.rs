//! Simulated 1-Wire memory devices for testing.
//!
//! A [`SimulatedBus`] holds the backing store of every simulated device.
//! Opening a device hands out bank objects that share that store, so a
//! filesystem can be remounted through a fresh cache and see exactly what
//! the previous cache flushed.
//!
//! Two device kinds are modelled:
//!
//! - **EEPROM**: pages start zeroed and writes replace bytes.
//! - **OTP**: pages start as all ones, writes are ANDed into the store,
//!   each page has an inverted redirect byte and the device keeps a free
//!   page bitmap (`1` = free).
//!
//! Faults can be injected per device: corrupted bytes, unstable reads,
//! forced redirects, transient transport failures and a bitmap that ignores
//! writes.

use std::sync::Arc;

use dashmap::DashMap;
use owfs_common::bits::bytes_for_bits;
use owfs_common::DeviceAddress;
use parking_lot::Mutex;

use crate::bank::{
    BankError, BankGeometry, BankResult, DeviceSource, MemoryBank, MemoryDevice,
    PagedMemoryBank, WriteOnceBank,
};

/// Operation counters of one simulated device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Page reads, with or without CRC.
    pub page_reads: u64,
    /// Page writes.
    pub page_writes: u64,
    /// Hardware redirects issued.
    pub redirects: u64,
    /// Bitmap writes.
    pub bitmap_writes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimKind {
    Eeprom,
    Otp,
}

#[derive(Debug)]
struct SimBank {
    geometry: BankGeometry,
    pages: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct SimDevice {
    address: DeviceAddress,
    kind: SimKind,
    banks: Vec<SimBank>,
    /// Inverted redirect byte per page (OTP only).
    redirects: Vec<u8>,
    /// Free-page bitmap (OTP only).
    bitmap: Vec<u8>,
    extra_info: bool,
    ignore_bitmap_writes: bool,
    unstable_reads: bool,
    read_noise: u8,
    pending_failures: usize,
    stats: SimStats,
}

impl SimDevice {
    fn new(address: DeviceAddress, kind: SimKind, banks: &[BankGeometry]) -> Self {
        let blank = match kind {
            SimKind::Eeprom => 0x00,
            SimKind::Otp => 0xFF,
        };
        let banks: Vec<SimBank> = banks
            .iter()
            .map(|&geometry| SimBank {
                geometry,
                pages: vec![vec![blank; geometry.page_length]; geometry.page_count],
            })
            .collect();
        let total: usize = banks.iter().map(|b| b.geometry.page_count).sum();
        let (redirects, bitmap) = match kind {
            SimKind::Eeprom => (Vec::new(), Vec::new()),
            SimKind::Otp => (vec![0xFF; total], vec![0xFF; bytes_for_bits(total)]),
        };
        Self {
            address,
            kind,
            banks,
            redirects,
            bitmap,
            extra_info: true,
            ignore_bitmap_writes: false,
            unstable_reads: false,
            read_noise: 0,
            pending_failures: 0,
            stats: SimStats::default(),
        }
    }

    fn total_pages(&self) -> usize {
        self.banks.iter().map(|b| b.geometry.page_count).sum()
    }

    /// Maps a device-wide page to `(bank, local page)`.
    fn locate(&self, page: usize) -> Option<(usize, usize)> {
        let mut first = 0;
        for (index, bank) in self.banks.iter().enumerate() {
            if page < first + bank.geometry.page_count {
                return Some((index, page - first));
            }
            first += bank.geometry.page_count;
        }
        None
    }

    fn check_transport(&mut self) -> BankResult<()> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(BankError::transport(self.address, "injected bus failure"));
        }
        Ok(())
    }

    fn page(&self, bank: usize, page: usize) -> BankResult<&Vec<u8>> {
        let store = &self.banks[bank];
        store.pages.get(page).ok_or(BankError::PageOutOfRange {
            page,
            pages: store.geometry.page_count,
        })
    }

    fn read(&mut self, bank: usize, page: usize, buf: &mut [u8]) -> BankResult<()> {
        self.check_transport()?;
        let data = self.page(bank, page)?;
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.stats.page_reads += 1;
        if self.unstable_reads && n > 1 {
            self.read_noise = self.read_noise.wrapping_add(1).max(1);
            buf[1] ^= self.read_noise;
        }
        Ok(())
    }

    fn write(&mut self, bank: usize, page: usize, data: &[u8]) -> BankResult<()> {
        self.check_transport()?;
        let kind = self.kind;
        let store = &mut self.banks[bank];
        let page_length = store.geometry.page_length;
        let pages = store.geometry.page_count;
        let target = store
            .pages
            .get_mut(page)
            .ok_or(BankError::PageOutOfRange { page, pages })?;
        if data.len() > page_length {
            return Err(BankError::WriteTooLong {
                len: data.len(),
                page_length,
            });
        }
        for (cell, &byte) in target.iter_mut().zip(data) {
            *cell = match kind {
                SimKind::Eeprom => byte,
                SimKind::Otp => *cell & byte,
            };
        }
        self.stats.page_writes += 1;
        Ok(())
    }
}

/// Handle to one bank of a simulated device.
struct SimBankHandle {
    device: Arc<Mutex<SimDevice>>,
    bank: usize,
    geometry: BankGeometry,
}

impl PagedMemoryBank for SimBankHandle {
    fn geometry(&self) -> BankGeometry {
        self.geometry
    }

    fn read_page(&mut self, page: usize, _continued: bool, buf: &mut [u8]) -> BankResult<()> {
        self.device.lock().read(self.bank, page, buf)
    }

    fn write_page(&mut self, page: usize, data: &[u8]) -> BankResult<()> {
        self.device.lock().write(self.bank, page, data)
    }
}

impl WriteOnceBank for SimBankHandle {
    fn has_extra_info(&self) -> bool {
        self.device.lock().extra_info
    }

    fn read_page_crc(
        &mut self,
        page: usize,
        _continued: bool,
        buf: &mut [u8],
        extra: Option<&mut [u8]>,
    ) -> BankResult<()> {
        let mut device = self.device.lock();
        device.read(self.bank, page, buf)?;
        if let Some(extra) = extra {
            if let Some(slot) = extra.first_mut() {
                *slot = device.redirects[page];
            }
        }
        Ok(())
    }

    fn redirected_page(&mut self, page: usize) -> BankResult<usize> {
        let mut device = self.device.lock();
        device.check_transport()?;
        let pages = device.redirects.len();
        let raw = device
            .redirects
            .get(page)
            .copied()
            .ok_or(BankError::PageOutOfRange { page, pages })?;
        Ok(usize::from(!raw))
    }

    fn redirect_page(&mut self, page: usize, new_page: usize) -> BankResult<()> {
        let mut device = self.device.lock();
        device.check_transport()?;
        let pages = device.redirects.len();
        let slot = device
            .redirects
            .get_mut(page)
            .ok_or(BankError::PageOutOfRange { page, pages })?;
        *slot &= !(new_page as u8);
        device.stats.redirects += 1;
        Ok(())
    }

    fn bitmap_len(&self) -> usize {
        self.device.lock().bitmap.len()
    }

    fn bitmap_location(&self) -> (usize, usize) {
        (0, 1)
    }

    fn read_bitmap(&mut self, buf: &mut [u8]) -> BankResult<()> {
        let mut device = self.device.lock();
        device.check_transport()?;
        let n = buf.len().min(device.bitmap.len());
        buf[..n].copy_from_slice(&device.bitmap[..n]);
        Ok(())
    }

    fn write_bitmap(&mut self, data: &[u8]) -> BankResult<()> {
        let mut device = self.device.lock();
        device.check_transport()?;
        device.stats.bitmap_writes += 1;
        if !device.ignore_bitmap_writes {
            for (cell, &byte) in device.bitmap.iter_mut().zip(data) {
                *cell &= byte;
            }
        }
        Ok(())
    }
}

/// A bus of simulated memory devices.
///
/// # Example
///
/// ```rust
/// use owfs_cache::sim::SimulatedBus;
/// use owfs_cache::bank::DeviceSource;
/// use owfs_common::DeviceAddress;
///
/// let bus = SimulatedBus::new();
/// let address = DeviceAddress::new(0x0C);
/// bus.add_eeprom_device(address, 32, 32);
///
/// let device = bus.open_device(address).unwrap();
/// assert_eq!(device.page_count(), 32);
/// ```
#[derive(Debug, Default)]
pub struct SimulatedBus {
    devices: DashMap<DeviceAddress, Arc<Mutex<SimDevice>>>,
}

impl SimulatedBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty bus wrapped in Arc.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Adds an EEPROM device with a single bank.
    pub fn add_eeprom_device(&self, address: DeviceAddress, page_count: usize, page_length: usize) {
        self.add_eeprom_device_banks(address, &[BankGeometry::new(page_count, page_length)]);
    }

    /// Adds an EEPROM device with several banks.
    pub fn add_eeprom_device_banks(&self, address: DeviceAddress, banks: &[BankGeometry]) {
        self.insert(SimDevice::new(address, SimKind::Eeprom, banks));
    }

    /// Adds an OTP device with a single bank.
    ///
    /// Redirect targets are stored in one byte, so `page_count` should not
    /// exceed 256.
    pub fn add_otp_device(&self, address: DeviceAddress, page_count: usize, page_length: usize) {
        debug_assert!(page_count <= 256);
        self.insert(SimDevice::new(
            address,
            SimKind::Otp,
            &[BankGeometry::new(page_count, page_length)],
        ));
    }

    /// Removes a device from the bus. Returns false if it was not present.
    pub fn remove_device(&self, address: DeviceAddress) -> bool {
        self.devices.remove(&address).is_some()
    }

    /// Returns true if the device is on the bus.
    pub fn contains(&self, address: DeviceAddress) -> bool {
        self.devices.contains_key(&address)
    }

    /// Returns the operation counters of a device.
    pub fn stats(&self, address: DeviceAddress) -> Option<SimStats> {
        self.with_device(address, |d| d.stats)
    }

    /// Resets the operation counters of a device.
    pub fn reset_stats(&self, address: DeviceAddress) {
        self.with_device(address, |d| d.stats = SimStats::default());
    }

    /// Returns the raw bytes of a device page.
    pub fn page_bytes(&self, address: DeviceAddress, page: usize) -> Option<Vec<u8>> {
        self.with_device(address, |d| {
            let (bank, local) = d.locate(page)?;
            Some(d.banks[bank].pages[local].clone())
        })
        .flatten()
    }

    /// Overwrites the raw bytes at the start of a device page, bypassing
    /// write-once semantics.
    pub fn set_page_bytes(&self, address: DeviceAddress, page: usize, bytes: &[u8]) -> bool {
        self.with_device(address, |d| {
            let Some((bank, local)) = d.locate(page) else {
                return false;
            };
            let target = &mut d.banks[bank].pages[local];
            let n = bytes.len().min(target.len());
            target[..n].copy_from_slice(&bytes[..n]);
            true
        })
        .unwrap_or(false)
    }

    /// Returns the redirect target of an OTP page (0 = none).
    pub fn redirect_of(&self, address: DeviceAddress, page: usize) -> Option<usize> {
        self.with_device(address, |d| d.redirects.get(page).map(|&raw| usize::from(!raw)))
            .flatten()
    }

    /// Returns the device bitmap of an OTP device.
    pub fn bitmap_bytes(&self, address: DeviceAddress) -> Option<Vec<u8>> {
        self.with_device(address, |d| d.bitmap.clone())
    }

    /// XORs `mask` into one byte of a page.
    pub fn corrupt_byte(&self, address: DeviceAddress, page: usize, offset: usize, mask: u8) -> bool {
        self.with_device(address, |d| {
            let Some((bank, local)) = d.locate(page) else {
                return false;
            };
            match d.banks[bank].pages[local].get_mut(offset) {
                Some(byte) => {
                    *byte ^= mask;
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
    }

    /// Makes every read return slightly different data.
    pub fn set_unstable_reads(&self, address: DeviceAddress, enabled: bool) {
        self.with_device(address, |d| d.unstable_reads = enabled);
    }

    /// Sets an OTP page's redirect byte directly, ignoring write-once
    /// semantics.
    pub fn force_redirect(&self, address: DeviceAddress, page: usize, target: usize) -> bool {
        self.with_device(address, |d| match d.redirects.get_mut(page) {
            Some(slot) => {
                *slot = !(target as u8);
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    /// Makes the next `count` bank operations of a device fail.
    pub fn fail_next_operations(&self, address: DeviceAddress, count: usize) {
        self.with_device(address, |d| d.pending_failures = count);
    }

    /// Makes an OTP device silently drop bitmap writes.
    pub fn set_ignore_bitmap_writes(&self, address: DeviceAddress, enabled: bool) {
        self.with_device(address, |d| d.ignore_bitmap_writes = enabled);
    }

    /// Chooses whether OTP CRC reads return the redirect byte.
    pub fn set_extra_info(&self, address: DeviceAddress, enabled: bool) {
        self.with_device(address, |d| d.extra_info = enabled);
    }

    /// Returns the number of pages of a device.
    pub fn page_count(&self, address: DeviceAddress) -> Option<usize> {
        self.with_device(address, |d| d.total_pages())
    }

    // ----- Private helpers -----

    fn insert(&self, device: SimDevice) {
        self.devices
            .insert(device.address, Arc::new(Mutex::new(device)));
    }

    fn with_device<R>(&self, address: DeviceAddress, f: impl FnOnce(&mut SimDevice) -> R) -> Option<R> {
        let device = self.devices.get(&address)?;
        let mut guard = device.lock();
        Some(f(&mut guard))
    }
}

impl DeviceSource for SimulatedBus {
    fn open_device(&self, address: DeviceAddress) -> BankResult<MemoryDevice> {
        let device = self
            .devices
            .get(&address)
            .map(|d| Arc::clone(d.value()))
            .ok_or(BankError::DeviceNotFound { address })?;

        let (kind, geometries): (SimKind, Vec<BankGeometry>) = {
            let guard = device.lock();
            (guard.kind, guard.banks.iter().map(|b| b.geometry).collect())
        };
        let banks = geometries
            .into_iter()
            .enumerate()
            .map(|(bank, geometry)| {
                let handle = Box::new(SimBankHandle {
                    device: Arc::clone(&device),
                    bank,
                    geometry,
                });
                match kind {
                    SimKind::Eeprom => MemoryBank::Ordinary(handle),
                    SimKind::Otp => MemoryBank::WriteOnce(handle),
                }
            })
            .collect();
        Ok(MemoryDevice::new(address, banks))
    }
}
