//! Paged memory bank contract.
//!
//! A memory bank is an addressable region of a 1-Wire device divided into
//! fixed-size pages. Two kinds exist:
//!
//! - **Ordinary** (EEPROM/NVRAM) banks can be rewritten freely.
//! - **Write-once** (OTP/EPROM) banks can only clear bits; superseded pages
//!   are redirected to replacement pages, and the device keeps its own
//!   free-page bitmap.
//!
//! The kind is chosen once, when a [`MemoryDevice`] is opened, through the
//! [`MemoryBank`] enum. The page cache never downcasts.

mod error;

pub use error::{BankError, BankResult};

use owfs_common::DeviceAddress;

/// Geometry of one memory bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankGeometry {
    /// Number of pages in the bank.
    pub page_count: usize,
    /// Raw page length in bytes.
    pub page_length: usize,
    /// Largest payload a packet on one page may carry.
    pub max_packet_data_length: usize,
}

impl BankGeometry {
    /// Creates a geometry whose packets fill the page: one length byte,
    /// the payload and a two-byte CRC.
    pub fn new(page_count: usize, page_length: usize) -> Self {
        Self {
            page_count,
            page_length,
            max_packet_data_length: page_length.saturating_sub(3),
        }
    }
}

/// Page-level access to an ordinary memory bank.
///
/// Page numbers are local to the bank. The `continued` flag tells the bank
/// that the previous operation read the preceding page and the bus has not
/// been released since, so the device may skip re-addressing.
pub trait PagedMemoryBank: Send {
    /// Returns the bank geometry.
    fn geometry(&self) -> BankGeometry;

    /// Reads the raw bytes of a page into `buf` (at most one page).
    fn read_page(&mut self, page: usize, continued: bool, buf: &mut [u8]) -> BankResult<()>;

    /// Writes `data` to the start of a page.
    fn write_page(&mut self, page: usize, data: &[u8]) -> BankResult<()>;
}

/// Additional operations of a write-once memory bank.
pub trait WriteOnceBank: PagedMemoryBank {
    /// Returns true if CRC reads also return the page's redirect byte.
    fn has_extra_info(&self) -> bool;

    /// Reads a page with a device-verified CRC.
    ///
    /// When `extra` is given and the bank has extra info, `extra[0]` receives
    /// the page's inverted redirect byte.
    fn read_page_crc(
        &mut self,
        page: usize,
        continued: bool,
        buf: &mut [u8],
        extra: Option<&mut [u8]>,
    ) -> BankResult<()>;

    /// Returns the page this page is redirected to, or 0 if none.
    fn redirected_page(&mut self, page: usize) -> BankResult<usize>;

    /// Permanently redirects `page` to `new_page`.
    fn redirect_page(&mut self, page: usize, new_page: usize) -> BankResult<()>;

    /// Returns the length of the device bitmap in bytes.
    fn bitmap_len(&self) -> usize;

    /// Returns the bit index of page 0 within the device bitmap.
    fn bitmap_bit_offset(&self) -> usize {
        0
    }

    /// Returns `(page, page_count)` of the bitmap storage.
    fn bitmap_location(&self) -> (usize, usize);

    /// Reads the device bitmap (`1` = free).
    fn read_bitmap(&mut self, buf: &mut [u8]) -> BankResult<()>;

    /// Writes the device bitmap. The device ANDs the written bits in.
    fn write_bitmap(&mut self, data: &[u8]) -> BankResult<()>;
}

/// A memory bank of either kind.
pub enum MemoryBank {
    /// Freely rewritable bank.
    Ordinary(Box<dyn PagedMemoryBank>),
    /// Write-once bank with redirection and a device bitmap.
    WriteOnce(Box<dyn WriteOnceBank>),
}

impl MemoryBank {
    /// Returns the bank geometry.
    pub fn geometry(&self) -> BankGeometry {
        match self {
            Self::Ordinary(bank) => bank.geometry(),
            Self::WriteOnce(bank) => bank.geometry(),
        }
    }

    /// Returns true for a write-once bank.
    pub fn is_write_once(&self) -> bool {
        matches!(self, Self::WriteOnce(_))
    }

    /// Reads a raw page.
    pub fn read_page(&mut self, page: usize, continued: bool, buf: &mut [u8]) -> BankResult<()> {
        match self {
            Self::Ordinary(bank) => bank.read_page(page, continued, buf),
            Self::WriteOnce(bank) => bank.read_page(page, continued, buf),
        }
    }

    /// Writes raw bytes to the start of a page.
    pub fn write_page(&mut self, page: usize, data: &[u8]) -> BankResult<()> {
        match self {
            Self::Ordinary(bank) => bank.write_page(page, data),
            Self::WriteOnce(bank) => bank.write_page(page, data),
        }
    }

    /// Returns the write-once interface, if this is a write-once bank.
    pub fn as_write_once(&mut self) -> Option<&mut dyn WriteOnceBank> {
        match self {
            Self::Ordinary(_) => None,
            Self::WriteOnce(bank) => Some(bank.as_mut()),
        }
    }
}

impl std::fmt::Debug for MemoryBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_write_once() {
            "WriteOnce"
        } else {
            "Ordinary"
        };
        f.debug_struct("MemoryBank")
            .field("kind", &kind)
            .field("geometry", &self.geometry())
            .finish()
    }
}

/// A physical device and its filesystem-capable memory banks.
#[derive(Debug)]
pub struct MemoryDevice {
    /// Device address.
    pub address: DeviceAddress,
    /// Banks in page-number order.
    pub banks: Vec<MemoryBank>,
}

impl MemoryDevice {
    /// Creates a device descriptor.
    pub fn new(address: DeviceAddress, banks: Vec<MemoryBank>) -> Self {
        Self { address, banks }
    }

    /// Returns the total number of pages over all banks.
    pub fn page_count(&self) -> usize {
        self.banks.iter().map(|b| b.geometry().page_count).sum()
    }
}

/// Opens devices by address. Implemented by the bus adapter layer.
pub trait DeviceSource: Send + Sync {
    /// Opens the memory banks of the device at `address`.
    fn open_device(&self, address: DeviceAddress) -> BankResult<MemoryDevice>;
}
