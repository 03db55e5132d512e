//! Packet framing and the 1-Wire CRC16.
//!
//! Every page holds one packet:
//!
//! ```text
//! +--------+------------------+----------+----------+
//! | len: 1 | payload: len     | !crc lo  | !crc hi  |
//! +--------+------------------+----------+----------+
//! ```
//!
//! The CRC16 runs over the length byte and payload, seeded with the
//! bank-local page number. Running it over the whole packet, trailer
//! included, leaves [`CRC16_RESIDUAL`].

use crc::{Crc, CRC_16_MAXIM_DOW};
use owfs_common::constants::{CRC16_LEN, CRC16_RESIDUAL, PACKET_LENGTH_BYTES};

/// The 1-Wire CRC16 (x^16 + x^15 + x^2 + 1, reflected). The catalog entry
/// inverts its output, which `crc16` undoes.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MAXIM_DOW);

/// Framing overhead of one packet.
pub const PACKET_OVERHEAD: usize = PACKET_LENGTH_BYTES + CRC16_LEN;

/// Computes the 1-Wire CRC16 of `data` starting from `seed`.
///
/// # Example
///
/// ```rust
/// use owfs_cache::packet::crc16;
///
/// assert_eq!(crc16(0, &[]), 0);
/// assert_ne!(crc16(0, b"1-Wire"), crc16(1, b"1-Wire"));
/// ```
pub fn crc16(seed: u16, data: &[u8]) -> u16 {
    // The initial value is given in unreflected form.
    let mut digest = CRC16.digest_with_initial(seed.reverse_bits());
    digest.update(data);
    !digest.finalize()
}

/// Derives the CRC seed of a bank-local page.
#[inline]
pub fn page_seed(local_page: usize) -> u16 {
    // Seeds wrap the same way the device's 16-bit CRC register does.
    (local_page & 0xFFFF) as u16
}

/// Frames `payload` into `frame` for the page with CRC seed `seed`.
///
/// Returns the framed length. `frame` must hold at least
/// `payload.len() + PACKET_OVERHEAD` bytes and the payload must fit the
/// single length byte.
pub fn encode_packet(seed: u16, payload: &[u8], frame: &mut [u8]) -> usize {
    debug_assert!(payload.len() <= usize::from(u8::MAX));
    debug_assert!(frame.len() >= payload.len() + PACKET_OVERHEAD);

    let len = payload.len();
    frame[0] = len as u8;
    frame[1..=len].copy_from_slice(payload);
    let crc = !crc16(seed, &frame[..=len]);
    frame[len + 1..len + 3].copy_from_slice(&crc.to_le_bytes());
    len + PACKET_OVERHEAD
}

/// Returns the declared payload length of a raw page.
#[inline]
pub fn packet_len(raw: &[u8]) -> usize {
    raw.first().map_or(0, |&len| usize::from(len))
}

/// Checks the CRC of the packet at the start of `raw`.
///
/// Returns false if the declared length runs past `raw`.
pub fn packet_crc_ok(seed: u16, raw: &[u8]) -> bool {
    let framed = packet_len(raw) + PACKET_OVERHEAD;
    raw.len() >= framed && crc16(seed, &raw[..framed]) == CRC16_RESIDUAL
}

/// Returns the payload of a framed packet.
#[inline]
pub fn packet_payload(raw: &[u8]) -> &[u8] {
    let len = packet_len(raw).min(raw.len().saturating_sub(PACKET_LENGTH_BYTES));
    &raw[PACKET_LENGTH_BYTES..PACKET_LENGTH_BYTES + len]
}
