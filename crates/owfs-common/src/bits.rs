//! Bit-array helpers for page bitmaps.
//!
//! Bit `n` lives in byte `n / 8` at bit position `n % 8` (LSB first), the
//! layout used by every bitmap placement on media.

/// Reads bit `bit` of `bytes`. Bits past the end read as `false`.
#[inline]
#[must_use]
pub fn read_bit(bytes: &[u8], bit: usize) -> bool {
    bytes
        .get(bit / 8)
        .map_or(false, |byte| byte & (1 << (bit % 8)) != 0)
}

/// Sets or clears bit `bit` of `bytes`. Bits past the end are ignored.
#[inline]
pub fn write_bit(bytes: &mut [u8], bit: usize, value: bool) {
    if let Some(byte) = bytes.get_mut(bit / 8) {
        if value {
            *byte |= 1 << (bit % 8);
        } else {
            *byte &= !(1 << (bit % 8));
        }
    }
}

/// Returns the number of bytes needed to hold `bits` bits.
#[inline]
#[must_use]
pub const fn bytes_for_bits(bits: usize) -> usize {
    (bits + 7) / 8
}
