//! Page cache errors.

use owfs_common::{ErrorKind, PageNumber};
use thiserror::Error;

use crate::bank::BankError;

/// Result type for page cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during page cache operations.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum CacheError {
    /// The device group has no filesystem-capable memory.
    #[error("device group does not have filesystem memory")]
    NoMemory,

    /// Page number outside the group's page space.
    #[error("page {page} is not in memory space of {total} pages")]
    PageOutOfRange { page: PageNumber, total: usize },

    /// Packet length byte larger than the bank allows.
    #[error("invalid length {length} in packet on page {page} (max {max})")]
    InvalidPacketLength {
        page: PageNumber,
        length: usize,
        max: usize,
    },

    /// Packet CRC did not verify.
    #[error("invalid CRC16 in packet read from page {page}")]
    CrcMismatch { page: PageNumber },

    /// Redirect chain longer than the page space.
    #[error("circular redirection of pages starting at page {page}")]
    CircularRedirect { page: PageNumber },

    /// Redirect pointing outside the page space.
    #[error("page {page} is redirected to page {target} outside memory space")]
    InvalidRedirect { page: PageNumber, target: usize },

    /// Reads of an ordinary page kept returning different bad data.
    #[error("page {page} returned different data on each of {attempts} reads")]
    UnstableRead { page: PageNumber, attempts: usize },

    /// A write-once page needed a redirect but no free page was left.
    #[error("redirection of page {page} required but device is out of space")]
    OutOfSpace { page: PageNumber },

    /// Device bitmap did not read back as written.
    #[error("readback verification of page bitmap was not correct")]
    BitmapVerification,

    /// Payload larger than a packet can carry.
    #[error("packet of {length} bytes exceeds maximum {max}")]
    PacketTooLarge { length: usize, max: usize },

    /// The device group cannot be cached as given.
    #[error("invalid device group: {reason}")]
    InvalidGeometry { reason: String },

    /// Bitmap helper used on a group whose device keeps no bitmap.
    #[error("device group does not keep a page bitmap")]
    NoPageBitmap,

    /// Memory bank failure.
    #[error("memory bank error: {0}")]
    Bank(#[from] BankError),
}

impl CacheError {
    /// Creates an invalid geometry error.
    pub fn invalid_geometry(reason: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            reason: reason.into(),
        }
    }

    /// Returns the stable error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoMemory | Self::InvalidGeometry { .. } => ErrorKind::InvalidGeometry,
            Self::PageOutOfRange { .. } | Self::PacketTooLarge { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::InvalidPacketLength { .. }
            | Self::CrcMismatch { .. }
            | Self::CircularRedirect { .. }
            | Self::InvalidRedirect { .. } => ErrorKind::Corruption,
            Self::UnstableRead { .. } => ErrorKind::Transport,
            Self::OutOfSpace { .. } => ErrorKind::OutOfSpace,
            Self::BitmapVerification => ErrorKind::SyncVerification,
            Self::NoPageBitmap => ErrorKind::InvalidState,
            Self::Bank(err) => err.kind(),
        }
    }

    /// Returns true if this is a transient error that can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnstableRead { .. } => true,
            Self::Bank(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if this error indicates damaged media.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }
}
