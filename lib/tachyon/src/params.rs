use crate::shared::{
    Encode, ErrorCode, Side, SizedRead, SizedWrite, TransportError, TransportResult,
};
use crate::wire::cid::{ConnectionId, ResetToken, MAX_CID_SIZE, RESET_TOKEN_SIZE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

mod tag {
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u16 = 0x00;
    pub const INITIAL_MAX_DATA: u16 = 0x01;
    pub const INITIAL_MAX_BIDI_STREAMS: u16 = 0x02;
    pub const IDLE_TIMEOUT: u16 = 0x03;
    pub const PREFERRED_ADDRESS: u16 = 0x04;
    pub const MAX_PACKET_SIZE: u16 = 0x05;
    pub const STATELESS_RESET_TOKEN: u16 = 0x06;
    pub const ACK_DELAY_EXPONENT: u16 = 0x07;
    pub const INITIAL_MAX_UNI_STREAMS: u16 = 0x08;
    pub const DISABLE_MIGRATION: u16 = 0x09;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u16 = 0x0a;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u16 = 0x0b;
    pub const MAX_ACK_DELAY: u16 = 0x0c;
    pub const ORIGINAL_CONNECTION_ID: u16 = 0x0d;
}

/// Typed transport parameters, exchanged once inside the handshake extension
/// and immutable afterwards. Serialized as a `type(2) | length(2) | value`
/// list with no duplicates.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportParameters {
    pub initial_max_stream_data_bidi_local: u32,
    pub initial_max_stream_data_bidi_remote: u32,
    pub initial_max_stream_data_uni: u32,
    pub initial_max_data: u32,
    pub initial_max_bidi_streams: u16,
    pub initial_max_uni_streams: u16,
    /// Seconds; zero disables the idle timer.
    pub idle_timeout: u16,
    pub max_packet_size: u16,
    pub ack_delay_exponent: u8,
    /// Milliseconds.
    pub max_ack_delay: u8,
    pub disable_migration: bool,
    /// Opaque; migration is out of scope, the bytes are carried through.
    pub preferred_address: Option<Vec<u8>>,
    pub stateless_reset_token: Option<ResetToken>,
    pub original_connection_id: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> TransportParameters {
        TransportParameters {
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_data: 0,
            initial_max_bidi_streams: 0,
            initial_max_uni_streams: 0,
            idle_timeout: 0,
            max_packet_size: 65527,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_migration: false,
            preferred_address: None,
            stateless_reset_token: None,
            original_connection_id: None,
        }
    }
}

impl TransportParameters {
    /// Parses a parameter list sent by `from`. Unknown tags are skipped,
    /// duplicates and server-only parameters from a client are fatal.
    pub fn decode<R: SizedRead>(stream: &mut R, from: Side) -> TransportResult<TransportParameters> {
        let mut params = TransportParameters::default();
        let mut seen: u32 = 0;

        while stream.remaining_data() > 0 {
            if stream.remaining_data() < 4 {
                return Err(ErrorCode::TransportParameterError.with("truncated parameter header"));
            }

            let ty = stream.read_u16::<BigEndian>()?;
            let len = stream.read_u16::<BigEndian>()? as usize;

            if stream.remaining_data() < len {
                return Err(ErrorCode::TransportParameterError.with("truncated parameter value"));
            }

            if ty <= tag::ORIGINAL_CONNECTION_ID {
                let bit = 1u32 << ty;
                if seen & bit != 0 {
                    return Err(ErrorCode::TransportParameterError
                        .with(format!("duplicate parameter {:#04x}", ty)));
                }
                seen |= bit;
            }

            match ty {
                tag::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = read_u32(stream, len)?;
                }
                tag::INITIAL_MAX_DATA => params.initial_max_data = read_u32(stream, len)?,
                tag::INITIAL_MAX_BIDI_STREAMS => {
                    params.initial_max_bidi_streams = read_u16(stream, len)?;
                }
                tag::IDLE_TIMEOUT => params.idle_timeout = read_u16(stream, len)?,
                tag::PREFERRED_ADDRESS => {
                    require_server(from, ty)?;
                    let mut value = vec![0u8; len];
                    stream.read_exact(&mut value)?;
                    params.preferred_address = Some(value);
                }
                tag::MAX_PACKET_SIZE => {
                    let value = read_u16(stream, len)?;
                    if value < 1200 {
                        return Err(ErrorCode::TransportParameterError
                            .with("max packet size below 1200"));
                    }
                    params.max_packet_size = value;
                }
                tag::STATELESS_RESET_TOKEN => {
                    require_server(from, ty)?;
                    if len != RESET_TOKEN_SIZE {
                        return Err(ErrorCode::TransportParameterError
                            .with("stateless reset token must be 16 bytes"));
                    }
                    let mut token = [0u8; RESET_TOKEN_SIZE];
                    stream.read_exact(&mut token)?;
                    params.stateless_reset_token = Some(ResetToken::new(token));
                }
                tag::ACK_DELAY_EXPONENT => {
                    let value = read_u8(stream, len)?;
                    if value > 20 {
                        return Err(ErrorCode::TransportParameterError
                            .with("ack delay exponent above 20"));
                    }
                    params.ack_delay_exponent = value;
                }
                tag::INITIAL_MAX_UNI_STREAMS => {
                    params.initial_max_uni_streams = read_u16(stream, len)?;
                }
                tag::DISABLE_MIGRATION => {
                    if len != 0 {
                        return Err(ErrorCode::TransportParameterError
                            .with("disable migration carries no value"));
                    }
                    params.disable_migration = true;
                }
                tag::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = read_u32(stream, len)?;
                }
                tag::INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = read_u32(stream, len)?;
                }
                tag::MAX_ACK_DELAY => params.max_ack_delay = read_u8(stream, len)?,
                tag::ORIGINAL_CONNECTION_ID => {
                    require_server(from, ty)?;
                    if len != 0 && (len < crate::wire::cid::MIN_CID_SIZE || len > MAX_CID_SIZE) {
                        return Err(ErrorCode::TransportParameterError
                            .with("original connection ID length out of range"));
                    }
                    let mut cid = [0u8; MAX_CID_SIZE];
                    stream.read_exact(&mut cid[..len])?;
                    params.original_connection_id = Some(ConnectionId::new(&cid[..len]));
                }
                _ => {
                    // Unknown parameters are skipped
                    let mut skipped = vec![0u8; len];
                    stream.read_exact(&mut skipped)?;
                }
            }
        }

        Ok(params)
    }

    fn encoded_size(&self) -> usize {
        // Four u32 values, four u16 values and two u8 values are always present
        let mut size = 4 * (4 + 4) + 4 * (4 + 2) + 2 * (4 + 1);
        if self.disable_migration {
            size += 4;
        }
        if let Some(address) = &self.preferred_address {
            size += 4 + address.len();
        }
        if self.stateless_reset_token.is_some() {
            size += 4 + RESET_TOKEN_SIZE;
        }
        if let Some(cid) = &self.original_connection_id {
            size += 4 + cid.len();
        }
        size
    }
}

impl Encode for TransportParameters {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> TransportResult<()> {
        if stream.free_capacity() < self.encoded_size() {
            return Err(TransportError::Wait);
        }

        write_u32(
            stream,
            tag::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        )?;
        write_u32(stream, tag::INITIAL_MAX_DATA, self.initial_max_data)?;
        write_u16(
            stream,
            tag::INITIAL_MAX_BIDI_STREAMS,
            self.initial_max_bidi_streams,
        )?;
        write_u16(stream, tag::IDLE_TIMEOUT, self.idle_timeout)?;
        write_u16(stream, tag::MAX_PACKET_SIZE, self.max_packet_size)?;
        write_u8(stream, tag::ACK_DELAY_EXPONENT, self.ack_delay_exponent)?;
        write_u16(
            stream,
            tag::INITIAL_MAX_UNI_STREAMS,
            self.initial_max_uni_streams,
        )?;
        write_u32(
            stream,
            tag::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        )?;
        write_u32(
            stream,
            tag::INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        )?;
        write_u8(stream, tag::MAX_ACK_DELAY, self.max_ack_delay)?;

        if self.disable_migration {
            stream.write_u16::<BigEndian>(tag::DISABLE_MIGRATION)?;
            stream.write_u16::<BigEndian>(0)?;
        }
        if let Some(address) = &self.preferred_address {
            stream.write_u16::<BigEndian>(tag::PREFERRED_ADDRESS)?;
            stream.write_u16::<BigEndian>(address.len() as u16)?;
            stream.write_all(address)?;
        }
        if let Some(token) = &self.stateless_reset_token {
            stream.write_u16::<BigEndian>(tag::STATELESS_RESET_TOKEN)?;
            stream.write_u16::<BigEndian>(RESET_TOKEN_SIZE as u16)?;
            stream.write_all(&token[..])?;
        }
        if let Some(cid) = &self.original_connection_id {
            stream.write_u16::<BigEndian>(tag::ORIGINAL_CONNECTION_ID)?;
            stream.write_u16::<BigEndian>(cid.len() as u16)?;
            stream.write_all(cid)?;
        }

        Ok(())
    }
}

fn require_server(from: Side, ty: u16) -> TransportResult<()> {
    if from.is_client() {
        return Err(ErrorCode::TransportParameterError
            .with(format!("client sent server-only parameter {:#04x}", ty)));
    }
    Ok(())
}

fn read_u8<R: SizedRead>(stream: &mut R, len: usize) -> TransportResult<u8> {
    if len != 1 {
        return Err(ErrorCode::TransportParameterError.with("parameter length mismatch"));
    }
    Ok(stream.read_u8()?)
}

fn read_u16<R: SizedRead>(stream: &mut R, len: usize) -> TransportResult<u16> {
    if len != 2 {
        return Err(ErrorCode::TransportParameterError.with("parameter length mismatch"));
    }
    Ok(stream.read_u16::<BigEndian>()?)
}

fn read_u32<R: SizedRead>(stream: &mut R, len: usize) -> TransportResult<u32> {
    if len != 4 {
        return Err(ErrorCode::TransportParameterError.with("parameter length mismatch"));
    }
    Ok(stream.read_u32::<BigEndian>()?)
}

fn write_u8<W: SizedWrite>(stream: &mut W, ty: u16, value: u8) -> TransportResult<()> {
    stream.write_u16::<BigEndian>(ty)?;
    stream.write_u16::<BigEndian>(1)?;
    stream.write_u8(value)?;
    Ok(())
}

fn write_u16<W: SizedWrite>(stream: &mut W, ty: u16, value: u16) -> TransportResult<()> {
    stream.write_u16::<BigEndian>(ty)?;
    stream.write_u16::<BigEndian>(2)?;
    stream.write_u16::<BigEndian>(value)?;
    Ok(())
}

fn write_u32<W: SizedWrite>(stream: &mut W, ty: u16, value: u32) -> TransportResult<()> {
    stream.write_u16::<BigEndian>(ty)?;
    stream.write_u16::<BigEndian>(4)?;
    stream.write_u32::<BigEndian>(value)?;
    Ok(())
}
