//! Stable error kinds.

use std::fmt;

/// Error kinds for categorizing filesystem failures.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorKind {
    // Usage errors (0x0000 - 0x00FF)
    /// A path was malformed.
    InvalidPath = 0x0000,
    /// An argument was out of range.
    InvalidArgument = 0x0001,
    /// The handle is not in a state that allows the operation.
    InvalidState = 0x0002,

    // Namespace errors (0x0100 - 0x01FF)
    /// The file or directory does not exist.
    NotFound = 0x0100,
    /// The target exists, is open for writing, or is not empty.
    Busy = 0x0101,

    // Media errors (0x0200 - 0x02FF)
    /// On-media data failed validation.
    Corruption = 0x0200,
    /// No free pages remain.
    OutOfSpace = 0x0201,
    /// A flush could not be verified.
    SyncVerification = 0x0202,
    /// The device group cannot hold a filesystem.
    InvalidGeometry = 0x0203,

    // Bus errors (0x0300 - 0x03FF)
    /// The device could not be reached.
    Transport = 0x0300,
}

impl ErrorKind {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "Usage",
            0x01 => "Namespace",
            0x02 => "Media",
            0x03 => "Bus",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_category() {
        assert_eq!(ErrorKind::InvalidPath.category(), "Usage");
        assert_eq!(ErrorKind::Busy.category(), "Namespace");
        assert_eq!(ErrorKind::OutOfSpace.category(), "Media");
        assert_eq!(ErrorKind::Transport.category(), "Bus");
    }

    #[test]
    fn test_error_kind_codes_are_stable() {
        assert_eq!(ErrorKind::NotFound.as_u16(), 0x0100);
        assert_eq!(ErrorKind::SyncVerification.as_u16(), 0x0202);
        assert_eq!(ErrorKind::Corruption.to_string(), "Corruption");
    }
}
