//! 16-bit additive checksum used to frame every datagram.
//!
//! The sum is taken over consecutive **little-endian** 16-bit words and
//! wraps on overflow.  An odd trailing byte is added as the low byte of a
//! final word whose high byte is zero.  The function is pure: identical
//! input always yields an identical checksum.
//!
//! The checksum is not a CRC and makes no collision guarantees; it catches
//! the random byte errors a lossy datagram path produces.

use byteorder::{ByteOrder, LittleEndian};

/// Byte length of the checksum prefix on the wire.
pub const CHECKSUM_LEN: usize = 2;

/// Compute the checksum of `data`, starting the running sum at `seed`.
///
/// A sub-range of a larger buffer is checksummed by slicing it first,
/// e.g. `compute(0, &buf[offset..offset + len])`.
pub fn compute(seed: u16, data: &[u8]) -> u16 {
    let mut words = data.chunks_exact(2);
    let mut sum = seed;
    for word in &mut words {
        sum = sum.wrapping_add(LittleEndian::read_u16(word));
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(u16::from(*last));
    }
    sum
}

/// Checksum of `data` with a zero seed.
pub fn checksum16(data: &[u8]) -> u16 {
    compute(0, data)
}

/// Write the checksum of `frame[CHECKSUM_LEN..]` into the first two bytes.
///
/// `frame` must be at least [`CHECKSUM_LEN`] bytes long.
pub fn seal(frame: &mut [u8]) {
    let sum = checksum16(&frame[CHECKSUM_LEN..]);
    LittleEndian::write_u16(&mut frame[..CHECKSUM_LEN], sum);
}

/// `true` when the prefix of `frame` matches the checksum of the rest.
///
/// Frames shorter than the prefix never verify.
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < CHECKSUM_LEN {
        return false;
    }
    let expected = LittleEndian::read_u16(&frame[..CHECKSUM_LEN]);
    checksum16(&frame[CHECKSUM_LEN..]) == expected
}
