//! Unsigned LEB128 varints. Frame lengths and all collection counts on the
//! wire use this encoding: 7 data bits per byte, high bit set on every byte
//! except the last.

use crate::WireError;
use bytes::{Buf, BufMut, BytesMut};

/// Appends `value` to `buf` as an unsigned LEB128 varint.
pub fn write_uleb128(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint of up to 64 bits.
///
/// A continuation past the tenth byte, or data bits beyond bit 63, is a
/// [`WireError::VarintOverflow`].
pub fn read_uleb128(buf: &mut impl Buf) -> Result<u64, WireError> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(WireError::UnexpectedEof);
        }
        let byte = buf.get_u8();
        let bits = u64::from(byte & 0x7f);
        // The final group only has a single bit of room left.
        if shift == 63 && bits > 1 {
            return Err(WireError::VarintOverflow);
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(WireError::VarintOverflow)
}

/// Reads a varint and refuses any value wider than 32 bits. Frame lengths
/// and collection counts are read through this guard.
pub fn read_uleb128_u32(buf: &mut impl Buf) -> Result<u32, WireError> {
    let value = read_uleb128(buf)?;
    u32::try_from(value).map_err(|_| WireError::VarintTooWide)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: u64) -> u64 {
        let mut buf = BytesMut::new();
        write_uleb128(&mut buf, value);
        read_uleb128(&mut &buf[..]).unwrap()
    }

    #[test]
    fn round_trips_boundaries() {
        for value in [
            0,
            1,
            127,
            128,
            16383,
            16384,
            u64::from(u32::MAX),
            u64::from(u32::MAX) + 1,
            u64::MAX - 1,
            u64::MAX,
        ] {
            assert_eq!(round_trip(value), value);
        }
    }

    #[test]
    fn round_trips_sampled_range() {
        let mut value = 1u64;
        while value < u64::MAX / 3 {
            assert_eq!(round_trip(value), value);
            assert_eq!(round_trip(value - 1), value - 1);
            value = value.wrapping_mul(3).wrapping_add(7);
        }
    }

    #[test]
    fn encoded_width_matches_value() {
        let mut buf = BytesMut::new();
        write_uleb128(&mut buf, 127);
        assert_eq!(buf.len(), 1);
        buf.clear();
        write_uleb128(&mut buf, 128);
        assert_eq!(buf.len(), 2);
        buf.clear();
        write_uleb128(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn rejects_truncated_input() {
        assert_eq!(
            read_uleb128(&mut &[0x80u8, 0x80][..]),
            Err(WireError::UnexpectedEof)
        );
    }

    #[test]
    fn rejects_overlong_input() {
        let eleven = [0x80u8; 11];
        assert_eq!(
            read_uleb128(&mut &eleven[..]),
            Err(WireError::VarintOverflow)
        );
        // Ten bytes but with data bits past bit 63.
        let mut overfull = [0x80u8; 10];
        overfull[9] = 0x02;
        assert_eq!(
            read_uleb128(&mut &overfull[..]),
            Err(WireError::VarintOverflow)
        );
    }

    #[test]
    fn u32_guard_rejects_wide_values() {
        let mut buf = BytesMut::new();
        write_uleb128(&mut buf, u64::from(u32::MAX));
        assert_eq!(read_uleb128_u32(&mut &buf[..]), Ok(u32::MAX));

        buf.clear();
        write_uleb128(&mut buf, u64::from(u32::MAX) + 1);
        assert_eq!(
            read_uleb128_u32(&mut &buf[..]),
            Err(WireError::VarintTooWide)
        );
    }
}
