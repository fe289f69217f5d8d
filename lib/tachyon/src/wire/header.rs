use crate::shared::{
    Encode, ErrorCode, SizedRead, SizedWrite, TransportError, TransportResult,
};
use crate::wire::cid::ConnectionId;
use crate::wire::pnum::{PnLen, TruncatedPn};
use crate::wire::varint::{read_varint, VarInt};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use photon::crypto;

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const LONG_TYPE_MASK: u8 = 0x30;
const SPIN_BIT: u8 = 0x20;
const KEY_PHASE_BIT: u8 = 0x04;
const PN_LEN_MASK: u8 = 0x03;

/// The two type bits of a long header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            LongType::Initial => 0b00,
            LongType::ZeroRtt => 0b01,
            LongType::Handshake => 0b10,
            LongType::Retry => 0b11,
        }
    }

    #[inline]
    pub fn from_bits(bits: u8) -> LongType {
        match bits & 0b11 {
            0b00 => LongType::Initial,
            0b01 => LongType::ZeroRtt,
            0b10 => LongType::Handshake,
            _ => LongType::Retry,
        }
    }
}

/// A parsed, unprotected packet header.
///
/// Long headers carry the version and both connection IDs and appear only
/// during the handshake; short headers carry the destination ID alone, with
/// its length fixed by local policy. Version negotiation rides a long header
/// with version zero and no protected payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Header {
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
        versions: Vec<u32>,
    },
    Long {
        ty: LongType,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        /// Length of the remainder of the packet: packet number plus sealed payload.
        payload_len: u64,
        pn: TruncatedPn,
    },
    Short {
        spin: bool,
        key_phase: bool,
        dcid: ConnectionId,
        pn: TruncatedPn,
    },
}

impl Header {
    #[inline]
    pub fn is_long(&self) -> bool {
        !matches!(self, Header::Short { .. })
    }

    #[inline]
    pub fn long_type(&self) -> Option<LongType> {
        match self {
            Header::Long { ty, .. } => Some(*ty),
            _ => None,
        }
    }

    #[inline]
    pub fn dcid(&self) -> &ConnectionId {
        match self {
            Header::VersionNegotiation { dcid, .. } => dcid,
            Header::Long { dcid, .. } => dcid,
            Header::Short { dcid, .. } => dcid,
        }
    }

    #[inline]
    pub fn pn(&self) -> Option<TruncatedPn> {
        match self {
            Header::VersionNegotiation { .. } => None,
            Header::Long { pn, .. } => Some(*pn),
            Header::Short { pn, .. } => Some(*pn),
        }
    }

    /// Total encoded size, packet number included.
    pub fn encoded_size(&self) -> usize {
        match self {
            Header::VersionNegotiation {
                dcid,
                scid,
                versions,
            } => 1 + 4 + 1 + dcid.len() + scid.len() + 4 * versions.len(),
            Header::Long {
                dcid,
                scid,
                payload_len,
                pn,
                ..
            } => 1 + 4 + 1 + dcid.len() + scid.len() + VarInt::size_of(*payload_len) + pn.len().bytes(),
            Header::Short { dcid, pn, .. } => 1 + dcid.len() + pn.len().bytes(),
        }
    }

    /// Byte offset of the packet-number field, where header protection
    /// sampling starts. Version negotiation has no packet number.
    pub fn pn_offset(&self) -> Option<usize> {
        match self {
            Header::VersionNegotiation { .. } => None,
            Header::Long {
                dcid,
                scid,
                payload_len,
                ..
            } => Some(1 + 4 + 1 + dcid.len() + scid.len() + VarInt::size_of(*payload_len)),
            Header::Short { dcid, .. } => Some(1 + dcid.len()),
        }
    }

    /// Parses an unprotected header. Short headers have no destination-ID
    /// length on the wire, so the local policy length is supplied.
    pub fn decode<R: SizedRead>(stream: &mut R, local_cid_len: usize) -> TransportResult<Header> {
        if stream.remaining_data() < 1 {
            return Err(ErrorCode::FrameEncodingError.with("empty header"));
        }

        let first = stream.read_u8()?;

        if first & FORM_BIT != 0 {
            Self::decode_long(stream, first)
        } else {
            Self::decode_short(stream, first, local_cid_len)
        }
    }

    fn decode_long<R: SizedRead>(stream: &mut R, first: u8) -> TransportResult<Header> {
        if stream.remaining_data() < 5 {
            return Err(ErrorCode::FrameEncodingError.with("truncated long header"));
        }

        let version = stream.read_u32::<BigEndian>()?;
        let cil = stream.read_u8()?;

        let dcid = read_cid(stream, ConnectionId::len_from_nibble(cil >> 4))?;
        let scid = read_cid(stream, ConnectionId::len_from_nibble(cil & 0x0f))?;

        if version == 0 {
            let remaining = stream.remaining_data();
            if remaining == 0 || remaining % 4 != 0 {
                return Err(
                    ErrorCode::FrameEncodingError.with("malformed version negotiation list")
                );
            }

            let mut versions = Vec::with_capacity(remaining / 4);
            for _ in 0..remaining / 4 {
                versions.push(stream.read_u32::<BigEndian>()?);
            }

            return Ok(Header::VersionNegotiation {
                dcid,
                scid,
                versions,
            });
        }

        if first & FIXED_BIT == 0 {
            return Err(ErrorCode::FrameEncodingError.with("fixed bit cleared in long header"));
        }

        let payload_len = read_varint(stream)?;
        let pn_len = PnLen::from_bits(first & PN_LEN_MASK)?;
        let pn = TruncatedPn::decode(stream, pn_len)?;

        Ok(Header::Long {
            ty: LongType::from_bits((first & LONG_TYPE_MASK) >> 4),
            version,
            dcid,
            scid,
            payload_len,
            pn,
        })
    }

    fn decode_short<R: SizedRead>(
        stream: &mut R,
        first: u8,
        local_cid_len: usize,
    ) -> TransportResult<Header> {
        if first & FIXED_BIT == 0 {
            return Err(ErrorCode::FrameEncodingError.with("fixed bit cleared in short header"));
        }

        let dcid = read_cid(stream, local_cid_len)?;
        let pn_len = PnLen::from_bits(first & PN_LEN_MASK)?;
        let pn = TruncatedPn::decode(stream, pn_len)?;

        Ok(Header::Short {
            spin: first & SPIN_BIT != 0,
            key_phase: first & KEY_PHASE_BIT != 0,
            dcid,
            pn,
        })
    }
}

impl Encode for Header {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> TransportResult<()> {
        if stream.free_capacity() < self.encoded_size() {
            return Err(TransportError::Wait);
        }

        match self {
            Header::VersionNegotiation {
                dcid,
                scid,
                versions,
            } => {
                // Bits below the form bit are unused and set randomly.
                let mut noise = [0u8; 1];
                crypto::random_bytes(&mut noise);
                stream.write_u8(FORM_BIT | (noise[0] & 0x7f))?;

                stream.write_u32::<BigEndian>(0)?;
                stream.write_u8(dcid.len_nibble() << 4 | scid.len_nibble())?;
                stream.write_all(dcid)?;
                stream.write_all(scid)?;

                for version in versions {
                    stream.write_u32::<BigEndian>(*version)?;
                }
            }
            Header::Long {
                ty,
                version,
                dcid,
                scid,
                payload_len,
                pn,
            } => {
                stream.write_u8(FORM_BIT | FIXED_BIT | ty.bits() << 4 | pn.len().bits())?;
                stream.write_u32::<BigEndian>(*version)?;
                stream.write_u8(dcid.len_nibble() << 4 | scid.len_nibble())?;
                stream.write_all(dcid)?;
                stream.write_all(scid)?;
                VarInt::new(*payload_len)?.encode(stream)?;
                pn.encode(stream)?;
            }
            Header::Short {
                spin,
                key_phase,
                dcid,
                pn,
            } => {
                let mut first = FIXED_BIT | pn.len().bits();
                if *spin {
                    first |= SPIN_BIT;
                }
                if *key_phase {
                    first |= KEY_PHASE_BIT;
                }

                stream.write_u8(first)?;
                stream.write_all(dcid)?;
                pn.encode(stream)?;
            }
        }

        Ok(())
    }
}

fn read_cid<R: SizedRead>(stream: &mut R, len: usize) -> TransportResult<ConnectionId> {
    if stream.remaining_data() < len {
        return Err(ErrorCode::FrameEncodingError.with("truncated connection ID"));
    }

    let mut bytes = [0u8; crate::wire::cid::MAX_CID_SIZE];
    stream.read_exact(&mut bytes[..len])?;

    Ok(ConnectionId::new(&bytes[..len]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::encode_to_vec;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    fn roundtrip(header: &Header, local_cid_len: usize) {
        let encoded = encode_to_vec(header);
        assert_eq!(encoded.len(), header.encoded_size());

        let decoded = Header::decode(&mut Cursor::new(&encoded[..]), local_cid_len).unwrap();
        assert_eq!(&decoded, header);
    }

    fn sample_pn() -> TruncatedPn {
        TruncatedPn::from_parts(0xbeef, PnLen::Two)
    }

    #[test]
    fn test_initial_roundtrip() {
        roundtrip(
            &Header::Long {
                ty: LongType::Initial,
                version: crate::QUIC_VERSION,
                dcid: ConnectionId::new(&[1; 8]),
                scid: ConnectionId::new(&[2; 8]),
                payload_len: 1337,
                pn: sample_pn(),
            },
            0,
        );
    }

    #[test]
    fn test_all_long_types_roundtrip() {
        for &ty in &[
            LongType::Initial,
            LongType::ZeroRtt,
            LongType::Handshake,
            LongType::Retry,
        ] {
            roundtrip(
                &Header::Long {
                    ty,
                    version: crate::QUIC_VERSION,
                    dcid: ConnectionId::new(&[3; 18]),
                    scid: ConnectionId::EMPTY,
                    payload_len: 19,
                    pn: TruncatedPn::from_parts(7, PnLen::One),
                },
                0,
            );
        }
    }

    #[test]
    fn test_short_roundtrip() {
        roundtrip(
            &Header::Short {
                spin: true,
                key_phase: false,
                dcid: ConnectionId::new(&[9; 8]),
                pn: TruncatedPn::from_parts(0xdead_beef, PnLen::Four),
            },
            8,
        );

        roundtrip(
            &Header::Short {
                spin: false,
                key_phase: true,
                dcid: ConnectionId::new(&[4; 4]),
                pn: TruncatedPn::from_parts(1, PnLen::One),
            },
            4,
        );
    }

    #[test]
    fn test_version_negotiation_roundtrip() {
        roundtrip(
            &Header::VersionNegotiation {
                dcid: ConnectionId::new(&[5; 8]),
                scid: ConnectionId::new(&[6; 8]),
                versions: vec![crate::QUIC_VERSION, 0xff00_000b],
            },
            0,
        );
    }

    #[test]
    fn test_random_long_headers() {
        let mut rng = StdRng::seed_from_u64(0x7ac);

        for _ in 0..200 {
            let dcid_len = [0usize, 4, 8, 11, 18][rng.gen_range(0..5)];
            let scid_len = [0usize, 4, 8, 11, 18][rng.gen_range(0..5)];

            roundtrip(
                &Header::Long {
                    ty: LongType::from_bits(rng.gen_range(0..4)),
                    version: rng.gen_range(1..u32::max_value()),
                    dcid: ConnectionId::random(dcid_len),
                    scid: ConnectionId::random(scid_len),
                    payload_len: rng.gen_range(0..(1u64 << 30)),
                    pn: TruncatedPn::from_parts(rng.gen(), PnLen::Four),
                },
                0,
            );
        }
    }

    #[test]
    fn test_fixed_bit_cleared_rejected() {
        let header = Header::Long {
            ty: LongType::Handshake,
            version: crate::QUIC_VERSION,
            dcid: ConnectionId::new(&[1; 8]),
            scid: ConnectionId::new(&[2; 8]),
            payload_len: 5,
            pn: sample_pn(),
        };

        let mut encoded = encode_to_vec(&header);
        encoded[0] &= !FIXED_BIT;

        let err = Header::decode(&mut Cursor::new(&encoded[..]), 0).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FrameEncodingError));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let header = Header::Long {
            ty: LongType::Initial,
            version: crate::QUIC_VERSION,
            dcid: ConnectionId::new(&[1; 8]),
            scid: ConnectionId::new(&[2; 8]),
            payload_len: 5,
            pn: sample_pn(),
        };

        let encoded = encode_to_vec(&header);

        for cut in 1..encoded.len() {
            let err = Header::decode(&mut Cursor::new(&encoded[..cut]), 0);
            assert!(err.is_err(), "cut at {} should fail", cut);
        }
    }

    #[test]
    fn test_empty_version_list_rejected() {
        let header = Header::VersionNegotiation {
            dcid: ConnectionId::new(&[5; 8]),
            scid: ConnectionId::new(&[6; 8]),
            versions: vec![],
        };

        let encoded = encode_to_vec(&header);
        let err = Header::decode(&mut Cursor::new(&encoded[..]), 0).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::FrameEncodingError));
    }

    #[test]
    fn test_pn_offset_matches_layout() {
        let header = Header::Long {
            ty: LongType::Initial,
            version: crate::QUIC_VERSION,
            dcid: ConnectionId::new(&[1; 8]),
            scid: ConnectionId::new(&[2; 4]),
            payload_len: 77,
            pn: sample_pn(),
        };

        let offset = header.pn_offset().unwrap();
        assert_eq!(offset + sample_pn().len().bytes(), header.encoded_size());

        let short = Header::Short {
            spin: false,
            key_phase: false,
            dcid: ConnectionId::new(&[1; 8]),
            pn: sample_pn(),
        };
        assert_eq!(short.pn_offset(), Some(9));
    }
}
