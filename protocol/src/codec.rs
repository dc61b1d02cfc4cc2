//! Primitive value codec. All fixed-width integers and floats are
//! little-endian, strings are UTF-8 with a ULEB128 byte-length prefix,
//! booleans are a single 0/1 byte and touch coordinates travel as 16-bit
//! IEEE-754 floats.

use crate::varint::{read_uleb128, read_uleb128_u32, write_uleb128};
use bytes::{BufMut, BytesMut};
use half::f16;

/// Checked reader over a frame payload. Every accessor validates the
/// remaining length before touching the buffer, so a truncated payload
/// surfaces as [`WireError::UnexpectedEof`] instead of a panic.
pub struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// The number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::UnexpectedEof);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, WireError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn f16(&mut self) -> Result<f16, WireError> {
        Ok(f16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            byte => Err(WireError::InvalidBool(byte)),
        }
    }

    pub fn uleb(&mut self) -> Result<u64, WireError> {
        read_uleb128(&mut self.buf)
    }

    /// A collection count. Counts share the 32-bit width guard with frame
    /// lengths.
    pub fn count(&mut self) -> Result<usize, WireError> {
        Ok(read_uleb128_u32(&mut self.buf)? as usize)
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let len = self.count()?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

pub fn write_f16(buf: &mut BytesMut, value: f16) {
    buf.put_slice(&value.to_le_bytes());
}

pub fn write_string(buf: &mut BytesMut, value: &str) {
    write_uleb128(buf, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

/// Errors raised while decoding frames or payloads. All of them are fatal
/// for the stream they occur on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of payload")]
    UnexpectedEof,
    #[error("varint does not terminate within 64 bits")]
    VarintOverflow,
    #[error("varint exceeds 32 bits")]
    VarintTooWide,
    #[error("frame length {0} exceeds the 2 MiB limit")]
    FrameTooLarge(u64),
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown {family} tag {tag}")]
    UnknownTag { family: &'static str, tag: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xab);
        buf.put_i8(-3);
        buf.put_u16_le(0xbeef);
        buf.put_u32_le(0xdead_beef);
        buf.put_i32_le(-12345);
        buf.put_i64_le(-1_234_567_890_123);
        buf.put_f32_le(13.75);
        write_f16(&mut buf, f16::from_f32(0.5));
        write_bool(&mut buf, true);
        write_string(&mut buf, "こんにちは");

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.u8().unwrap(), 0xab);
        assert_eq!(reader.i8().unwrap(), -3);
        assert_eq!(reader.u16().unwrap(), 0xbeef);
        assert_eq!(reader.u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.i32().unwrap(), -12345);
        assert_eq!(reader.i64().unwrap(), -1_234_567_890_123);
        assert_eq!(reader.f32().unwrap(), 13.75);
        assert_eq!(reader.f16().unwrap(), f16::from_f32(0.5));
        assert!(reader.bool().unwrap());
        assert_eq!(reader.string().unwrap(), "こんにちは");
        assert!(reader.is_empty());
    }

    #[test]
    fn truncation_is_an_error() {
        let mut reader = ByteReader::new(&[1, 2, 3]);
        assert_eq!(reader.u32(), Err(WireError::UnexpectedEof));
    }

    #[test]
    fn bool_rejects_junk() {
        let mut reader = ByteReader::new(&[7]);
        assert_eq!(reader.bool(), Err(WireError::InvalidBool(7)));
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut buf = BytesMut::new();
        write_uleb128(&mut buf, 2);
        buf.put_slice(&[0xff, 0xfe]);
        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.string(), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn string_length_is_bounded_by_payload() {
        let mut buf = BytesMut::new();
        write_uleb128(&mut buf, 100);
        buf.put_slice(b"short");
        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.string(), Err(WireError::UnexpectedEof));
    }
}
