use crate::shared::{ErrorCode, SizedRead, SizedWrite, TransportError, TransportResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// On-the-wire length of a truncated packet number.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PnLen {
    One,
    Two,
    Four,
}

impl PnLen {
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            PnLen::One => 1,
            PnLen::Two => 2,
            PnLen::Four => 4,
        }
    }

    /// The two pn-len bits carried in the first header byte.
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            PnLen::One => 0b00,
            PnLen::Two => 0b01,
            PnLen::Four => 0b10,
        }
    }

    #[inline]
    pub fn from_bits(bits: u8) -> TransportResult<PnLen> {
        Ok(match bits & 0b11 {
            0b00 => PnLen::One,
            0b01 => PnLen::Two,
            0b10 => PnLen::Four,
            _ => {
                return Err(ErrorCode::FrameEncodingError.with("reserved packet-number length"));
            }
        })
    }

    #[inline]
    fn mask(self) -> u64 {
        (1u64 << (8 * self.bytes())) - 1
    }
}

/// A packet number as it travels on the wire: the low 1, 2 or 4 bytes of the
/// full 62-bit value. The receiver reconstructs the full value against the
/// next packet number it expects.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TruncatedPn {
    value: u32,
    len: PnLen,
}

impl TruncatedPn {
    /// Truncates a full packet number, keeping enough low bytes for the peer
    /// to reconstruct it against the largest number it has acknowledged.
    pub fn new(pn: u64, largest_acked: Option<u64>) -> TruncatedPn {
        let unacked = match largest_acked {
            Some(largest) => pn - largest,
            None => pn + 1,
        };

        let len = if unacked < (1 << 7) {
            PnLen::One
        } else if unacked < (1 << 15) {
            PnLen::Two
        } else {
            PnLen::Four
        };

        TruncatedPn {
            value: (pn & len.mask()) as u32,
            len,
        }
    }

    #[inline]
    pub fn from_parts(value: u32, len: PnLen) -> TruncatedPn {
        TruncatedPn {
            value: value & len.mask() as u32,
            len,
        }
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.value
    }

    #[inline]
    pub fn len(self) -> PnLen {
        self.len
    }

    /// Reconstructs the full packet number by choosing the candidate closest
    /// to the next expected value; the window is half the truncated range on
    /// either side.
    pub fn expand(self, expected: u64) -> u64 {
        let win = 1u64 << (8 * self.len.bytes());
        let hwin = win / 2;
        let mask = win - 1;

        let candidate = (expected & !mask) | u64::from(self.value);

        if candidate + hwin <= expected {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }

    pub fn encode<W: SizedWrite>(self, stream: &mut W) -> TransportResult<()> {
        if stream.free_capacity() < self.len.bytes() {
            return Err(TransportError::Wait);
        }

        match self.len {
            PnLen::One => stream.write_u8(self.value as u8)?,
            PnLen::Two => stream.write_u16::<BigEndian>(self.value as u16)?,
            PnLen::Four => stream.write_u32::<BigEndian>(self.value)?,
        }

        Ok(())
    }

    pub fn decode<R: SizedRead>(stream: &mut R, len: PnLen) -> TransportResult<TruncatedPn> {
        if stream.remaining_data() < len.bytes() {
            return Err(ErrorCode::FrameEncodingError.with("truncated packet number"));
        }

        let value = match len {
            PnLen::One => u32::from(stream.read_u8()?),
            PnLen::Two => u32::from(stream.read_u16::<BigEndian>()?),
            PnLen::Four => stream.read_u32::<BigEndian>()?,
        };

        Ok(TruncatedPn { value, len })
    }
}
