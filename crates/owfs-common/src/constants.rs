//! On-media constants for the 1-Wire filesystem.
//!
//! These values are fixed by the media format and must not change between
//! releases: a filesystem formatted by one version has to mount on the next.

// =============================================================================
// Packet Framing
// =============================================================================

/// Residual left by the 1-Wire CRC16 when run over a packet plus its
/// inverted CRC trailer.
pub const CRC16_RESIDUAL: u16 = 0xB001;

/// Number of CRC16 trailer bytes following a packet's payload.
pub const CRC16_LEN: usize = 2;

/// Number of length bytes preceding a packet's payload.
pub const PACKET_LENGTH_BYTES: usize = 1;

/// Groups with at most this many pages use 1-byte page pointers; larger
/// groups use 2-byte pointers.
pub const WIDE_POINTER_THRESHOLD: usize = 256;

// =============================================================================
// Directory Entries
// =============================================================================

/// Length of the name field of a directory entry (4 name bytes + extension).
pub const LEN_FILENAME: usize = 5;

/// Number of name characters in a directory entry.
pub const NAME_CHARS: usize = 4;

/// Padding byte for names shorter than [`NAME_CHARS`].
pub const NAME_PAD: u8 = b' ';

/// Extension value marking a directory.
pub const EXT_DIRECTORY: u8 = 0x7F;

/// Extension value of a parsed element whose type is not yet known.
///
/// Never stored on media; it is reconciled against the entry found on disk.
pub const EXT_UNKNOWN: u8 = 0x7E;

/// Largest extension a file may carry.
pub const MAX_EXTENSION: u8 = 102;

/// Flag bit in the extension byte: read-only file or hidden directory.
pub const EXT_FLAG: u8 = 0x80;

/// Mask for the extension value without the flag bit.
pub const EXT_MASK: u8 = 0x7F;

/// Extension byte of an entry excluded from directory listings.
pub const EXT_HIDDEN: u8 = 0xFF;

/// Lowest printable character allowed in a name.
pub const NAME_CHAR_MIN: u8 = 0x21;

/// Highest printable character allowed in a name.
pub const NAME_CHAR_MAX: u8 = 0x7E;

/// Path element separator.
pub const PATH_SEPARATOR: char = '/';

/// Name recorded as the parent of top-level directories.
pub const ROOT_NAME: [u8; NAME_CHARS] = *b"ROOT";

// =============================================================================
// Root Control Page
// =============================================================================

/// Marker low nibble for 1-byte page pointers.
pub const MARKER_NARROW: u8 = 0x0A;

/// Marker low nibble for 2-byte page pointers.
pub const MARKER_WIDE: u8 = 0x0B;

/// Marker high nibble for a single-device filesystem.
pub const MARKER_SINGLE: u8 = 0xA0;

/// Marker high nibble for a multi-device filesystem.
pub const MARKER_MULTI: u8 = 0xB0;

/// Control byte flag: the free-page bitmap lives in the root page.
pub const CONTROL_LOCAL_BITMAP: u8 = 0x80;

/// Control byte flag: this device is the master of a multi-device group.
pub const CONTROL_MASTER: u8 = 0x02;

/// Number of bytes of the bitmap kept in the root page.
pub const LOCAL_BITMAP_BYTES: usize = 4;

/// Groups with at most this many pages keep their bitmap in the root page.
pub const LOCAL_BITMAP_MAX_PAGES: usize = LOCAL_BITMAP_BYTES * 8;

// =============================================================================
// Device Map
// =============================================================================

/// Length of a 1-Wire device address.
pub const DEVICE_ADDRESS_LEN: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(LEN_FILENAME, NAME_CHARS + 1);
        assert_eq!(LOCAL_BITMAP_MAX_PAGES, 32);
        assert!(MAX_EXTENSION < EXT_UNKNOWN);
        assert!(EXT_UNKNOWN < EXT_DIRECTORY);
        assert_eq!(EXT_HIDDEN & EXT_MASK, EXT_DIRECTORY);
    }

    #[test]
    fn test_marker_nibbles_do_not_overlap() {
        assert_eq!(MARKER_NARROW & 0xF0, 0);
        assert_eq!(MARKER_SINGLE & 0x0F, 0);
        assert_ne!(MARKER_SINGLE, MARKER_MULTI);
    }
}
