//! 16-bit checksum shared by the coordination block and the handshake.
//!
//! CRC-16/X-25 (ISO 3309): reflected polynomial `0x8408`, initial value
//! `0xFFFF`, final complement. Both sides of the protocol and every process
//! touching the block must agree on it bit for bit.

const POLY_REFLECTED: u16 = 0x8408;

/// Computes the checksum of `data`.
///
/// ```
/// assert_eq!(sole_core::checksum16(b"123456789"), 0x906E);
/// ```
pub fn checksum16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
        }
    }
    !crc
}
