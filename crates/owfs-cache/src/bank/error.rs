//! Memory bank (transport) errors.

use owfs_common::{DeviceAddress, ErrorKind};
use thiserror::Error;

/// Result type for memory bank operations.
pub type BankResult<T> = Result<T, BankError>;

/// Errors reported by a paged memory bank or the bus behind it.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum BankError {
    /// The device did not answer on the bus.
    #[error("device {address} not present on the bus")]
    DeviceNotFound { address: DeviceAddress },

    /// Bus-level I/O failure.
    #[error("transport failure on device {address}: {message}")]
    Transport {
        address: DeviceAddress,
        message: String,
    },

    /// The device-computed CRC of a page read did not match.
    #[error("device CRC check failed reading page {page} of {address}")]
    DeviceCrc { address: DeviceAddress, page: usize },

    /// Page number outside the bank.
    #[error("page {page} outside bank of {pages} pages")]
    PageOutOfRange { page: usize, pages: usize },

    /// Write longer than the page.
    #[error("write of {len} bytes exceeds page length {page_length}")]
    WriteTooLong { len: usize, page_length: usize },
}

impl BankError {
    /// Creates a transport error.
    pub fn transport(address: DeviceAddress, message: impl Into<String>) -> Self {
        Self::Transport {
            address,
            message: message.into(),
        }
    }

    /// Returns the stable error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound { .. } | Self::Transport { .. } | Self::DeviceCrc { .. } => {
                ErrorKind::Transport
            }
            Self::PageOutOfRange { .. } | Self::WriteTooLong { .. } => ErrorKind::InvalidArgument,
        }
    }

    /// Returns true if this is a transient error that can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. } | Self::Transport { .. } | Self::DeviceCrc { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        let err = BankError::transport(DeviceAddress::new(1), "no presence pulse");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());

        let err = BankError::PageOutOfRange { page: 9, pages: 8 };
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = BankError::transport(DeviceAddress::new(0x0C), "short");
        assert_eq!(
            err.to_string(),
            "transport failure on device 000000000000000C: short"
        );
    }
}
