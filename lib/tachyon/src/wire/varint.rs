use crate::shared::{
    Decode, Encode, ErrorCode, SizedRead, SizedWrite, TransportError, TransportResult,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;

/// A QUIC variable-length integer. The two high bits of the first byte select
/// the 1/2/4/8-byte form; the remainder is a big-endian unsigned integer of at
/// most 62 bits.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(u64);

impl VarInt {
    pub const MAX: VarInt = VarInt((1 << 62) - 1);

    /// Wraps a value known to fit the encodable range.
    pub fn new(value: u64) -> TransportResult<VarInt> {
        if value > Self::MAX.0 {
            return Err(ErrorCode::InternalError.with("value exceeds the 62-bit integer range"));
        }

        Ok(VarInt(value))
    }

    #[inline]
    pub const fn from_u32(value: u32) -> VarInt {
        VarInt(value as u64)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// The number of bytes the encoded form occupies: the smallest length
    /// class that fits the value.
    #[inline]
    pub fn size(self) -> usize {
        if self.0 < (1 << 6) {
            1
        } else if self.0 < (1 << 14) {
            2
        } else if self.0 < (1 << 30) {
            4
        } else {
            8
        }
    }

    /// The encoded size of a raw value, without constructing the wrapper.
    #[inline]
    pub fn size_of(value: u64) -> usize {
        VarInt(value).size()
    }
}

impl From<u8> for VarInt {
    #[inline]
    fn from(value: u8) -> VarInt {
        VarInt(u64::from(value))
    }
}

impl From<u16> for VarInt {
    #[inline]
    fn from(value: u16) -> VarInt {
        VarInt(u64::from(value))
    }
}

impl From<u32> for VarInt {
    #[inline]
    fn from(value: u32) -> VarInt {
        VarInt(u64::from(value))
    }
}

impl From<VarInt> for u64 {
    #[inline]
    fn from(value: VarInt) -> u64 {
        value.0
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Encode for VarInt {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> TransportResult<()> {
        let size = self.size();

        if stream.free_capacity() < size {
            return Err(TransportError::Wait);
        }

        match size {
            1 => stream.write_u8(self.0 as u8)?,
            2 => stream.write_u16::<BigEndian>(self.0 as u16 | 0x4000)?,
            4 => stream.write_u32::<BigEndian>(self.0 as u32 | 0x8000_0000)?,
            _ => stream.write_u64::<BigEndian>(self.0 | 0xc000_0000_0000_0000)?,
        }

        Ok(())
    }
}

impl Decode for VarInt {
    fn decode<R: SizedRead>(stream: &mut R) -> TransportResult<VarInt> {
        if stream.remaining_data() < 1 {
            return Err(ErrorCode::FrameEncodingError.with("truncated variable-length integer"));
        }

        let first = stream.read_u8()?;
        let tail = (1usize << (first >> 6)) - 1;

        if stream.remaining_data() < tail {
            return Err(ErrorCode::FrameEncodingError.with("truncated variable-length integer"));
        }

        let mut value = u64::from(first & 0x3f);
        for _ in 0..tail {
            value = value << 8 | u64::from(stream.read_u8()?);
        }

        Ok(VarInt(value))
    }
}

/// Decodes a variable-length integer directly to its raw value.
#[inline]
pub fn read_varint<R: SizedRead>(stream: &mut R) -> TransportResult<u64> {
    VarInt::decode(stream).map(VarInt::value)
}

/// Encodes a raw value as a variable-length integer.
#[inline]
pub fn write_varint<W: SizedWrite>(stream: &mut W, value: u64) -> TransportResult<()> {
    VarInt::new(value)?.encode(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::encode_to_vec;
    use std::io::Cursor;

    fn roundtrip(value: u64) -> Vec<u8> {
        let encoded = encode_to_vec(&VarInt::new(value).unwrap());
        let decoded = VarInt::decode(&mut Cursor::new(&encoded[..])).unwrap();

        assert_eq!(decoded.value(), value);
        assert_eq!(encoded.len(), VarInt::size_of(value));

        encoded
    }

    #[test]
    fn test_two_byte_form() {
        assert_eq!(roundtrip(0x3fff), vec![0x7f, 0xff]);
    }

    #[test]
    fn test_eight_byte_form() {
        assert_eq!(
            roundtrip(151_288_809_941_952_652),
            vec![0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]
        );
    }

    #[test]
    fn test_length_class_boundaries() {
        assert_eq!(roundtrip(0).len(), 1);
        assert_eq!(roundtrip(63).len(), 1);
        assert_eq!(roundtrip(64).len(), 2);
        assert_eq!(roundtrip((1 << 14) - 1).len(), 2);
        assert_eq!(roundtrip(1 << 14).len(), 4);
        assert_eq!(roundtrip((1 << 30) - 1).len(), 4);
        assert_eq!(roundtrip(1 << 30).len(), 8);
        assert_eq!(roundtrip(VarInt::MAX.value()).len(), 8);
    }

    #[test]
    fn test_known_single_byte() {
        assert_eq!(roundtrip(37), vec![0x25]);
        assert_eq!(roundtrip(63), vec![0x3f]);
    }

    #[test]
    fn test_value_too_large() {
        assert!(VarInt::new(1 << 62).is_err());
        assert!(VarInt::new(u64::max_value()).is_err());
    }

    #[test]
    fn test_decode_empty_is_encoding_error() {
        let err = VarInt::decode(&mut Cursor::new(&[][..])).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FrameEncodingError));
    }

    #[test]
    fn test_decode_truncated_tail() {
        // Two-byte form with the second byte missing
        let err = VarInt::decode(&mut Cursor::new(&[0x7f][..])).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FrameEncodingError));

        // Eight-byte form with only four bytes present
        let err = VarInt::decode(&mut Cursor::new(&[0xc2, 0x19, 0x7c, 0x5e][..])).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FrameEncodingError));
    }

    #[test]
    fn test_encode_without_capacity_waits() {
        let mut buf = [0u8; 1];
        let mut stream = Cursor::new(&mut buf[..]);

        let result = VarInt::from(0x3fffu16).encode(&mut stream);

        assert_eq!(result.unwrap_err(), TransportError::Wait);
        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn test_exhaustive_small_range() {
        for value in 0..=16_500u64 {
            roundtrip(value);
        }
    }
}
