//! Identifier types for the 1-Wire filesystem.
//!
//! These types provide type-safe wrappers around page numbers and device
//! addresses so the two can never be confused with each other or with
//! byte offsets.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::DEVICE_ADDRESS_LEN;

/// Page number within a device group.
///
/// Pages of all devices in a group are numbered consecutively: the master's
/// pages come first, then each satellite's pages in device-list order.
/// Page 0 is always the master's root directory page.
///
/// # Example
///
/// ```rust
/// use owfs_common::types::PageNumber;
///
/// let page = PageNumber::new(5);
/// assert_eq!(page.index(), 5);
/// assert!(!page.is_root());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PageNumber(usize);

impl PageNumber {
    /// The root directory page.
    pub const ROOT: Self = Self(0);

    /// Creates a new `PageNumber`.
    #[inline]
    #[must_use]
    pub const fn new(page: usize) -> Self {
        Self(page)
    }

    /// Returns the raw page index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Returns true if this is the root directory page.
    #[inline]
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }

    /// Returns the following page number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Debug for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({})", self.0)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PageNumber {
    #[inline]
    fn from(page: usize) -> Self {
        Self::new(page)
    }
}

impl From<PageNumber> for usize {
    #[inline]
    fn from(page: PageNumber) -> Self {
        page.0
    }
}

/// 64-bit 1-Wire device address (ROM ID).
///
/// The low byte is the family code; the address is stored on media as
/// eight little-endian bytes.
///
/// # Example
///
/// ```rust
/// use owfs_common::types::DeviceAddress;
///
/// let addr = DeviceAddress::new(0x1C00_0000_0012_3409);
/// assert_eq!(addr.family_code(), 0x09);
/// assert_eq!(DeviceAddress::from_bytes(&addr.to_bytes()), addr);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    /// Creates a new `DeviceAddress`.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw address.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the family code (low byte).
    #[inline]
    #[must_use]
    pub const fn family_code(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Decodes an address from its on-media little-endian form.
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: &[u8; DEVICE_ADDRESS_LEN]) -> Self {
        Self(u64::from_le_bytes(*bytes))
    }

    /// Decodes an address from the first eight bytes of a slice.
    ///
    /// Returns `None` if the slice is too short.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; DEVICE_ADDRESS_LEN] = bytes.get(..DEVICE_ADDRESS_LEN)?.try_into().ok()?;
        Some(Self::from_bytes(&raw))
    }

    /// Encodes the address in its on-media little-endian form.
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; DEVICE_ADDRESS_LEN] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddress({:016X})", self.0)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl From<u64> for DeviceAddress {
    #[inline]
    fn from(raw: u64) -> Self {
        Self::new(raw)
    }
}
