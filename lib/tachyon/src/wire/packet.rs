use crate::crypto::DirectionalKeys;
use crate::shared::{encode_to_vec, Decode, Encode, ErrorCode, TransportError, TransportResult};
use crate::wire::cid::{ConnectionId, MAX_CID_SIZE, MIN_CID_SIZE};
use crate::wire::frame::Frame;
use crate::wire::header::{Header, LongType};
use crate::wire::pnum::{PnLen, TruncatedPn};
use crate::wire::varint::VarInt;
use byteorder::{BigEndian, ByteOrder};
use photon::crypto as aead;
use std::io::Cursor;

/// Initial packets ride in datagrams of at least this size.
pub const MIN_INITIAL_SIZE: usize = 1200;

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const LONG_PN_MASK: u8 = 0x0f;
const SHORT_PN_MASK: u8 = 0x1f;

/// A fully opened protected packet.
#[derive(Debug)]
pub struct Packet {
    pub header: Header,
    pub pn: u64,
    pub frames: Vec<Frame>,
}

/// What can be read off a packet before header protection is removed: enough
/// to route it, pick an encryption level, and delimit it within a coalesced
/// datagram.
#[derive(Debug)]
pub struct Probe {
    pub is_long: bool,
    pub ty: Option<LongType>,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: Option<ConnectionId>,
    pub is_version_negotiation: bool,
    pub pn_offset: usize,
    /// Bytes this packet occupies in the datagram.
    pub packet_len: usize,
}

/// Parses the unprotected prefix of the packet starting at `buf[0]`.
///
/// Failures here are the silent-drop class and come back as `Wait`: a
/// malformed or foreign datagram never tears down a connection.
pub fn probe(buf: &[u8], local_cid_len: usize) -> TransportResult<Probe> {
    if buf.is_empty() {
        return Err(TransportError::Wait);
    }

    let first = buf[0];

    if first & FORM_BIT == 0 {
        if first & FIXED_BIT == 0 || buf.len() < 1 + local_cid_len {
            return Err(TransportError::Wait);
        }

        return Ok(Probe {
            is_long: false,
            ty: None,
            version: 0,
            dcid: read_cid(&buf[1..], local_cid_len)?,
            scid: None,
            is_version_negotiation: false,
            pn_offset: 1 + local_cid_len,
            packet_len: buf.len(),
        });
    }

    if buf.len() < 6 {
        return Err(TransportError::Wait);
    }

    let version = BigEndian::read_u32(&buf[1..5]);
    let cil = buf[5];
    let dcid_len = ConnectionId::len_from_nibble(cil >> 4);
    let scid_len = ConnectionId::len_from_nibble(cil & 0x0f);

    let mut offset = 6;
    if buf.len() < offset + dcid_len + scid_len {
        return Err(TransportError::Wait);
    }

    let dcid = read_cid(&buf[offset..], dcid_len)?;
    offset += dcid_len;
    let scid = read_cid(&buf[offset..], scid_len)?;
    offset += scid_len;

    if version == 0 {
        return Ok(Probe {
            is_long: true,
            ty: None,
            version,
            dcid,
            scid: Some(scid),
            is_version_negotiation: true,
            pn_offset: offset,
            packet_len: buf.len(),
        });
    }

    if first & FIXED_BIT == 0 {
        return Err(TransportError::Wait);
    }

    let mut stream = Cursor::new(&buf[offset..]);
    let payload_len = match VarInt::decode(&mut stream) {
        Ok(value) => value.value(),
        Err(_) => return Err(TransportError::Wait),
    };
    offset += stream.position() as usize;

    let packet_len = offset + payload_len as usize;
    if payload_len > buf.len() as u64 || packet_len > buf.len() {
        return Err(TransportError::Wait);
    }

    Ok(Probe {
        is_long: true,
        ty: Some(LongType::from_bits((first >> 4) & 0x3)),
        version,
        dcid,
        scid: Some(scid),
        is_version_negotiation: false,
        pn_offset: offset,
        packet_len,
    })
}

fn read_cid(buf: &[u8], len: usize) -> TransportResult<ConnectionId> {
    if buf.len() < len {
        return Err(TransportError::Wait);
    }
    Ok(ConnectionId::new(&buf[..len]))
}

/// Assembles, seals and header-protects one packet into `out`, returning its
/// total size. The long-header payload length is computed here; `full_pn` is
/// the number `header.pn` was truncated from and doubles as the AEAD nonce.
pub fn seal(
    out: &mut [u8],
    header: &Header,
    full_pn: u64,
    frames: &[Frame],
    keys: &DirectionalKeys,
) -> TransportResult<usize> {
    let pn_len = match header.pn() {
        Some(pn) => pn.len(),
        None => return Err(ErrorCode::InternalError.with("sealing a packet with no number")),
    };

    let mut payload_stream = Cursor::new(Vec::new());
    for frame in frames {
        frame.encode(&mut payload_stream)?;
    }
    let mut payload = payload_stream.into_inner();

    // The header-protection sample starts four bytes past the packet number,
    // so the ciphertext must reach that far; pad with PADDING bytes.
    let min_payload = 4usize.saturating_sub(pn_len.bytes());
    while payload.len() < min_payload {
        payload.push(0);
    }

    let cipher_len = payload.len() + aead::MAC_SIZE;

    let mut header = header.clone();
    if let Header::Long { payload_len, .. } = &mut header {
        *payload_len = (pn_len.bytes() + cipher_len) as u64;
    }

    let header_len = header.encoded_size();
    let total = header_len + cipher_len;
    if out.len() < total {
        return Err(TransportError::Wait);
    }

    header.encode(&mut Cursor::new(&mut out[..]))?;

    let (head, tail) = out.split_at_mut(header_len);
    if !aead::encrypt(&mut tail[..cipher_len], &payload, head, full_pn, &keys.key) {
        return Err(ErrorCode::InternalError.with("packet seal failed"));
    }

    let pn_offset = header
        .pn_offset()
        .expect("sealed packets carry a packet number");
    apply_mask(out, pn_offset, pn_len.bytes(), header.is_long(), &keys.hp);

    Ok(total)
}

/// Removes header protection and opens one packet in place. `expected_pn` is
/// the next number the receiving space expects; it anchors packet-number
/// expansion. Undecryptable packets are the silent-drop class (`Wait`);
/// malformed frames inside an authenticated packet are fatal.
pub fn open(
    buf: &mut [u8],
    probe: &Probe,
    expected_pn: u64,
    keys: &DirectionalKeys,
) -> TransportResult<Packet> {
    let pn_offset = probe.pn_offset;
    let packet_len = probe.packet_len;

    if packet_len > buf.len() || pn_offset + 4 + aead::SAMPLE_SIZE > packet_len {
        return Err(TransportError::Wait);
    }

    let mut sample = [0u8; aead::SAMPLE_SIZE];
    sample.copy_from_slice(&buf[pn_offset + 4..pn_offset + 4 + aead::SAMPLE_SIZE]);
    let mask = aead::hp_mask(&sample, &keys.hp);

    let first_mask = if probe.is_long { LONG_PN_MASK } else { SHORT_PN_MASK };
    buf[0] ^= mask[0] & first_mask;

    let pn_len = match PnLen::from_bits(buf[0] & 0x03) {
        Ok(len) => len,
        Err(_) => return Err(TransportError::Wait),
    };

    for index in 0..pn_len.bytes() {
        buf[pn_offset + index] ^= mask[1 + index];
    }

    let truncated =
        TruncatedPn::decode(&mut Cursor::new(&buf[pn_offset..packet_len]), pn_len)
            .map_err(|_| TransportError::Wait)?;
    let pn = truncated.expand(expected_pn);

    let header_len = pn_offset + pn_len.bytes();
    let cipher_len = packet_len - header_len;
    if cipher_len < aead::MAC_SIZE {
        return Err(TransportError::Wait);
    }

    let (head, tail) = buf.split_at_mut(header_len);
    let mut plain = vec![0u8; cipher_len - aead::MAC_SIZE];
    if !aead::decrypt(&mut plain, &tail[..cipher_len], head, pn, &keys.key) {
        return Err(TransportError::Wait);
    }

    let header = Header::decode(&mut Cursor::new(&buf[..header_len]), probe.dcid.len())
        .map_err(|_| TransportError::Wait)?;

    // Frame errors inside an authenticated packet are the peer's fault
    let frames = Frame::decode_all(&mut Cursor::new(&plain[..]))?;

    Ok(Packet { header, pn, frames })
}

fn apply_mask(buf: &mut [u8], pn_offset: usize, pn_bytes: usize, is_long: bool, hp: &[u8; 32]) {
    let mut sample = [0u8; aead::SAMPLE_SIZE];
    sample.copy_from_slice(&buf[pn_offset + 4..pn_offset + 4 + aead::SAMPLE_SIZE]);
    let mask = aead::hp_mask(&sample, hp);

    buf[0] ^= mask[0] & if is_long { LONG_PN_MASK } else { SHORT_PN_MASK };
    for index in 0..pn_bytes {
        buf[pn_offset + index] ^= mask[1 + index];
    }
}

/// Builds a version negotiation packet listing the supported versions.
pub fn version_negotiation(dcid: ConnectionId, scid: ConnectionId, versions: &[u32]) -> Vec<u8> {
    encode_to_vec(&Header::VersionNegotiation {
        dcid,
        scid,
        versions: versions.to_vec(),
    })
}

/// Builds a Retry packet. Retry carries no frames and no protection: the body
/// is the original destination CID plus the retry token.
pub fn retry(
    out: &mut [u8],
    version: u32,
    dcid: ConnectionId,
    scid: ConnectionId,
    odcid: &ConnectionId,
    token: &[u8],
) -> TransportResult<usize> {
    let body_len = 1 + odcid.len() + token.len();

    let header = Header::Long {
        ty: LongType::Retry,
        version,
        dcid,
        scid,
        payload_len: (1 + body_len) as u64,
        pn: TruncatedPn::from_parts(0, PnLen::One),
    };

    let header_len = header.encoded_size();
    let total = header_len + body_len;
    if out.len() < total {
        return Err(TransportError::Wait);
    }

    header.encode(&mut Cursor::new(&mut out[..]))?;

    out[header_len] = odcid.len() as u8;
    out[header_len + 1..header_len + 1 + odcid.len()].copy_from_slice(odcid);
    out[header_len + 1 + odcid.len()..total].copy_from_slice(token);

    Ok(total)
}

/// Extracts the original destination CID and token from a probed Retry.
pub fn parse_retry(buf: &[u8], probe: &Probe) -> TransportResult<(ConnectionId, Vec<u8>)> {
    let body = buf
        .get(probe.pn_offset + 1..probe.packet_len)
        .ok_or(TransportError::Wait)?;

    if body.is_empty() {
        return Err(TransportError::Wait);
    }

    let odcid_len = body[0] as usize;
    if odcid_len < MIN_CID_SIZE || odcid_len > MAX_CID_SIZE || body.len() < 1 + odcid_len {
        return Err(TransportError::Wait);
    }

    let odcid = ConnectionId::new(&body[1..1 + odcid_len]);
    let token = body[1 + odcid_len..].to_vec();

    Ok((odcid, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame::StreamFrame;
    use photon::crypto::KEY_SIZE;

    fn keys() -> DirectionalKeys {
        DirectionalKeys {
            key: [0x11; KEY_SIZE],
            hp: [0x22; KEY_SIZE],
        }
    }

    fn initial_header(pn: u64, largest_acked: Option<u64>) -> Header {
        Header::Long {
            ty: LongType::Initial,
            version: crate::QUIC_VERSION,
            dcid: ConnectionId::new(&[1; 8]),
            scid: ConnectionId::new(&[2; 8]),
            payload_len: 0,
            pn: TruncatedPn::new(pn, largest_acked),
        }
    }

    fn short_header(pn: u64) -> Header {
        Header::Short {
            spin: false,
            key_phase: false,
            dcid: ConnectionId::new(&[3; 8]),
            pn: TruncatedPn::new(pn, None),
        }
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Crypto {
                offset: 0,
                data: vec![0x16; 32],
            },
            Frame::Ping,
        ]
    }

    #[test]
    fn test_seal_open_long() {
        let mut buf = [0u8; 1500];

        let len = seal(&mut buf, &initial_header(0, None), 0, &sample_frames(), &keys()).unwrap();

        let probe = probe(&buf[..len], 8).unwrap();
        assert!(probe.is_long);
        assert_eq!(probe.ty, Some(LongType::Initial));
        assert_eq!(probe.packet_len, len);
        assert_eq!(&probe.dcid[..], &[1; 8]);

        let packet = open(&mut buf[..len], &probe, 0, &keys()).unwrap();
        assert_eq!(packet.pn, 0);
        assert_eq!(packet.frames, sample_frames());
    }

    #[test]
    fn test_seal_open_short() {
        let mut buf = [0u8; 1500];

        let frames = vec![Frame::Stream(StreamFrame {
            stream_id: 4,
            offset: 0,
            data: b"hello".to_vec(),
            fin: false,
        })];

        let len = seal(&mut buf, &short_header(7), 7, &frames, &keys()).unwrap();

        let probe = probe(&buf[..len], 8).unwrap();
        assert!(!probe.is_long);

        let packet = open(&mut buf[..len], &probe, 7, &keys()).unwrap();
        assert_eq!(packet.pn, 7);
        assert_eq!(packet.frames, frames);
    }

    #[test]
    fn test_small_payload_padded_for_sampling() {
        let mut buf = [0u8; 1500];

        let len = seal(&mut buf, &short_header(0), 0, &[Frame::Ping], &keys()).unwrap();

        let probe = probe(&buf[..len], 8).unwrap();
        let packet = open(&mut buf[..len], &probe, 0, &keys()).unwrap();

        assert_eq!(packet.frames[0], Frame::Ping);
        // The padding appended to reach the sample is visible as a frame
        assert!(matches!(packet.frames.get(1), Some(Frame::Padding(_))));
    }

    #[test]
    fn test_tampered_packet_dropped() {
        let mut buf = [0u8; 1500];
        let len = seal(&mut buf, &short_header(3), 3, &sample_frames(), &keys()).unwrap();

        buf[len - 1] ^= 0xff;

        let probe = probe(&buf[..len], 8).unwrap();
        let err = open(&mut buf[..len], &probe, 3, &keys()).unwrap_err();
        assert_eq!(err, TransportError::Wait);
    }

    #[test]
    fn test_wrong_keys_dropped() {
        let mut buf = [0u8; 1500];
        let len = seal(&mut buf, &short_header(3), 3, &sample_frames(), &keys()).unwrap();

        let wrong = DirectionalKeys {
            key: [0x33; KEY_SIZE],
            hp: [0x22; KEY_SIZE],
        };

        let probe = probe(&buf[..len], 8).unwrap();
        let err = open(&mut buf[..len], &probe, 3, &wrong).unwrap_err();
        assert_eq!(err, TransportError::Wait);
    }

    #[test]
    fn test_pn_expansion_through_seal() {
        let mut buf = [0u8; 1500];

        // A 1-byte truncation of pn 258 against largest acked 256
        let len = seal(
            &mut buf,
            &initial_header(258, Some(256)),
            258,
            &sample_frames(),
            &keys(),
        )
        .unwrap();

        let probe = probe(&buf[..len], 8).unwrap();
        let packet = open(&mut buf[..len], &probe, 257, &keys()).unwrap();
        assert_eq!(packet.pn, 258);
    }

    #[test]
    fn test_coalesced_packets() {
        let mut buf = [0u8; 3000];

        let first_len = seal(&mut buf, &initial_header(0, None), 0, &sample_frames(), &keys())
            .unwrap();
        let second_len = {
            let (_, rest) = buf.split_at_mut(first_len);
            seal(
                rest,
                &Header::Long {
                    ty: LongType::Handshake,
                    version: crate::QUIC_VERSION,
                    dcid: ConnectionId::new(&[1; 8]),
                    scid: ConnectionId::new(&[2; 8]),
                    payload_len: 0,
                    pn: TruncatedPn::new(0, None),
                },
                0,
                &[Frame::Ping],
                &keys(),
            )
            .unwrap()
        };

        let total = first_len + second_len;

        let first_probe = probe(&buf[..total], 8).unwrap();
        assert_eq!(first_probe.packet_len, first_len);
        assert_eq!(first_probe.ty, Some(LongType::Initial));

        let second_probe = probe(&buf[first_len..total], 8).unwrap();
        assert_eq!(second_probe.packet_len, second_len);
        assert_eq!(second_probe.ty, Some(LongType::Handshake));

        open(&mut buf[..first_len], &first_probe, 0, &keys()).unwrap();
        open(&mut buf[first_len..total], &second_probe, 0, &keys()).unwrap();
    }

    #[test]
    fn test_version_negotiation_builder() {
        let datagram = version_negotiation(
            ConnectionId::new(&[1; 8]),
            ConnectionId::new(&[2; 8]),
            crate::SUPPORTED_VERSIONS,
        );

        let probe = probe(&datagram, 8).unwrap();
        assert!(probe.is_version_negotiation);

        let header = Header::decode(&mut Cursor::new(&datagram[..]), 0).unwrap();
        match header {
            Header::VersionNegotiation { versions, .. } => {
                assert_eq!(versions, crate::SUPPORTED_VERSIONS);
            }
            other => panic!("Unexpected header {:?}", other),
        }
    }

    #[test]
    fn test_retry_roundtrip() {
        let mut buf = [0u8; 256];

        let odcid = ConnectionId::new(&[9; 8]);
        let token = b"retry-token";

        let len = retry(
            &mut buf,
            crate::QUIC_VERSION,
            ConnectionId::new(&[1; 8]),
            ConnectionId::new(&[2; 8]),
            &odcid,
            token,
        )
        .unwrap();

        let probe = probe(&buf[..len], 8).unwrap();
        assert_eq!(probe.ty, Some(LongType::Retry));
        assert_eq!(probe.packet_len, len);

        let (parsed_odcid, parsed_token) = parse_retry(&buf[..len], &probe).unwrap();
        assert_eq!(parsed_odcid, odcid);
        assert_eq!(parsed_token, token);
    }

    #[test]
    fn test_probe_rejects_garbage() {
        assert!(probe(&[], 8).is_err());
        assert!(probe(&[0x40], 8).is_err());

        // Short header with the fixed bit cleared
        assert!(probe(&[0x00, 1, 2, 3, 4, 5, 6, 7, 8, 0], 8).is_err());

        // Long header truncated before the connection IDs
        assert!(probe(&[0xc0, 0xff, 0x00, 0x00], 8).is_err());

        // Long header whose declared length overruns the datagram
        let mut buf = [0u8; 1500];
        let len = seal(&mut buf, &initial_header(0, None), 0, &sample_frames(), &keys()).unwrap();
        assert!(probe(&buf[..len - 1], 8).is_err());
    }
}
