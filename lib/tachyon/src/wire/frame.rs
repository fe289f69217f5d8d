use crate::shared::{
    ErrorCode, SizedRead, SizedWrite, TransportError, TransportResult,
};
use crate::wire::cid::{ConnectionId, ResetToken, MAX_CID_SIZE, MIN_CID_SIZE, RESET_TOKEN_SIZE};
use crate::wire::varint::{read_varint, write_varint, VarInt};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Frame type bytes. STREAM occupies 0x10-0x17 with its flag bits.
pub(crate) mod kind {
    pub const PADDING: u8 = 0x00;
    pub const RST_STREAM: u8 = 0x01;
    pub const CONNECTION_CLOSE: u8 = 0x02;
    pub const APPLICATION_CLOSE: u8 = 0x03;
    pub const MAX_DATA: u8 = 0x04;
    pub const MAX_STREAM_DATA: u8 = 0x05;
    pub const MAX_STREAM_ID: u8 = 0x06;
    pub const PING: u8 = 0x07;
    pub const BLOCKED: u8 = 0x08;
    pub const STREAM_BLOCKED: u8 = 0x09;
    pub const STREAM_ID_BLOCKED: u8 = 0x0a;
    pub const NEW_CONNECTION_ID: u8 = 0x0b;
    pub const STOP_SENDING: u8 = 0x0c;
    pub const ACK: u8 = 0x0d;
    pub const PATH_CHALLENGE: u8 = 0x0e;
    pub const PATH_RESPONSE: u8 = 0x0f;
    pub const STREAM_BASE: u8 = 0x10;
    pub const STREAM_MASK: u8 = 0xf8;
    pub const STREAM_FIN: u8 = 0x01;
    pub const STREAM_LEN: u8 = 0x02;
    pub const STREAM_OFF: u8 = 0x04;
    pub const CRYPTO: u8 = 0x18;
    pub const ACK_ECN: u8 = 0x1a;
}

/// Acknowledged packet-number ranges, descending from `largest`.
///
/// The first block covers `largest - first_range ..= largest`; each further
/// range hangs below the previous block, separated by `gap + 1` unacknowledged
/// numbers.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckFrame {
    pub largest: u64,
    /// Wire ack delay; scaling by the peer's delay exponent happens at dispatch.
    pub delay: u64,
    pub first_range: u64,
    pub ranges: Vec<AckRange>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckRange {
    pub gap: u64,
    pub length: u64,
}

impl AckFrame {
    /// Resolves the wire form into inclusive `(smallest, largest)` ranges,
    /// ordered descending. A range that would underflow past zero is a peer
    /// encoding error.
    pub fn ranges_inclusive(&self) -> TransportResult<Vec<(u64, u64)>> {
        let mut resolved = Vec::with_capacity(self.ranges.len() + 1);

        let mut smallest = self
            .largest
            .checked_sub(self.first_range)
            .ok_or_else(|| ErrorCode::FrameEncodingError.with("negative ack range"))?;
        resolved.push((smallest, self.largest));

        for range in &self.ranges {
            let next_largest = smallest
                .checked_sub(range.gap + 2)
                .ok_or_else(|| ErrorCode::FrameEncodingError.with("negative ack gap"))?;
            smallest = next_largest
                .checked_sub(range.length)
                .ok_or_else(|| ErrorCode::FrameEncodingError.with("negative ack range"))?;
            resolved.push((smallest, next_largest));
        }

        Ok(resolved)
    }

    /// Every acknowledged packet number, descending.
    pub fn acked(&self) -> TransportResult<Vec<u64>> {
        let mut pns = Vec::new();
        for (smallest, largest) in self.ranges_inclusive()? {
            let mut pn = largest;
            loop {
                pns.push(pn);
                if pn == smallest {
                    break;
                }
                pn -= 1;
            }
        }
        Ok(pns)
    }

    /// Builds the wire form from inclusive `(smallest, largest)` ranges
    /// ordered descending. Returns `None` when there is nothing to
    /// acknowledge.
    pub fn from_ranges(ranges: &[(u64, u64)], delay: u64) -> Option<AckFrame> {
        let (first_smallest, largest) = *ranges.first()?;

        let mut frame = AckFrame {
            largest,
            delay,
            first_range: largest - first_smallest,
            ranges: Vec::with_capacity(ranges.len() - 1),
        };

        let mut prev_smallest = first_smallest;
        for &(smallest, block_largest) in &ranges[1..] {
            frame.ranges.push(AckRange {
                gap: prev_smallest - block_largest - 2,
                length: block_largest - smallest,
            });
            prev_smallest = smallest;
        }

        Some(frame)
    }

    fn wire_size(&self) -> usize {
        let mut size = VarInt::size_of(self.largest)
            + VarInt::size_of(self.delay)
            + VarInt::size_of(self.ranges.len() as u64)
            + VarInt::size_of(self.first_range);

        for range in &self.ranges {
            size += VarInt::size_of(range.gap) + VarInt::size_of(range.length);
        }

        size
    }

    fn write<W: SizedWrite>(&self, stream: &mut W) -> TransportResult<()> {
        write_varint(stream, self.largest)?;
        write_varint(stream, self.delay)?;
        write_varint(stream, self.ranges.len() as u64)?;
        write_varint(stream, self.first_range)?;

        for range in &self.ranges {
            write_varint(stream, range.gap)?;
            write_varint(stream, range.length)?;
        }

        Ok(())
    }

    fn read<R: SizedRead>(stream: &mut R) -> TransportResult<AckFrame> {
        let largest = read_varint(stream)?;
        let delay = read_varint(stream)?;
        let count = read_varint(stream)?;
        let first_range = read_varint(stream)?;

        let mut ranges = Vec::new();
        for _ in 0..count {
            ranges.push(AckRange {
                gap: read_varint(stream)?,
                length: read_varint(stream)?,
            });
        }

        Ok(AckFrame {
            largest,
            delay,
            first_range,
            ranges,
        })
    }
}

/// ECN counter totals carried by ACK_ECN.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub offset: u64,
    pub data: Vec<u8>,
    pub fin: bool,
}

/// The closed set of frames. Dispatch is an exhaustive match; adding a kind
/// without handling it everywhere is a compile error.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    /// A run of consecutive padding bytes, coalesced with the count kept for
    /// accounting.
    Padding(usize),
    RstStream {
        stream_id: u64,
        error_code: u16,
        final_offset: u64,
    },
    ConnectionClose {
        error_code: u16,
        reason: String,
    },
    ApplicationClose {
        error_code: u16,
        reason: String,
    },
    MaxData {
        maximum: u64,
    },
    MaxStreamData {
        stream_id: u64,
        maximum: u64,
    },
    MaxStreamId {
        stream_id: u64,
    },
    Ping,
    Blocked {
        offset: u64,
    },
    StreamBlocked {
        stream_id: u64,
        offset: u64,
    },
    StreamIdBlocked {
        stream_id: u64,
    },
    NewConnectionId {
        sequence: u64,
        cid: ConnectionId,
        reset_token: ResetToken,
    },
    StopSending {
        stream_id: u64,
        error_code: u16,
    },
    Ack(AckFrame),
    AckEcn {
        ack: AckFrame,
        ecn: Option<EcnCounts>,
    },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    Stream(StreamFrame),
    Crypto {
        offset: u64,
        data: Vec<u8>,
    },
}

impl Frame {
    /// The representative type byte; STREAM includes its flag bits.
    pub fn ty(&self) -> u8 {
        match self {
            Frame::Padding(_) => kind::PADDING,
            Frame::RstStream { .. } => kind::RST_STREAM,
            Frame::ConnectionClose { .. } => kind::CONNECTION_CLOSE,
            Frame::ApplicationClose { .. } => kind::APPLICATION_CLOSE,
            Frame::MaxData { .. } => kind::MAX_DATA,
            Frame::MaxStreamData { .. } => kind::MAX_STREAM_DATA,
            Frame::MaxStreamId { .. } => kind::MAX_STREAM_ID,
            Frame::Ping => kind::PING,
            Frame::Blocked { .. } => kind::BLOCKED,
            Frame::StreamBlocked { .. } => kind::STREAM_BLOCKED,
            Frame::StreamIdBlocked { .. } => kind::STREAM_ID_BLOCKED,
            Frame::NewConnectionId { .. } => kind::NEW_CONNECTION_ID,
            Frame::StopSending { .. } => kind::STOP_SENDING,
            Frame::Ack(_) => kind::ACK,
            Frame::AckEcn { .. } => kind::ACK_ECN,
            Frame::PathChallenge(_) => kind::PATH_CHALLENGE,
            Frame::PathResponse(_) => kind::PATH_RESPONSE,
            Frame::Stream(frame) => {
                let mut ty = kind::STREAM_BASE | kind::STREAM_LEN;
                if frame.offset > 0 {
                    ty |= kind::STREAM_OFF;
                }
                if frame.fin {
                    ty |= kind::STREAM_FIN;
                }
                ty
            }
            Frame::Crypto { .. } => kind::CRYPTO,
        }
    }

    /// A packet carrying at least one ack-eliciting frame must be
    /// acknowledged by the peer.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_)
                | Frame::Ack(_)
                | Frame::AckEcn { .. }
                | Frame::ConnectionClose { .. }
                | Frame::ApplicationClose { .. }
        )
    }

    /// Exact encoded size, type byte included.
    pub fn wire_size(&self) -> usize {
        match self {
            Frame::Padding(count) => *count,
            Frame::RstStream {
                stream_id,
                final_offset,
                ..
            } => 1 + VarInt::size_of(*stream_id) + 2 + VarInt::size_of(*final_offset),
            Frame::ConnectionClose { reason, .. } | Frame::ApplicationClose { reason, .. } => {
                1 + 2 + VarInt::size_of(reason.len() as u64) + reason.len()
            }
            Frame::MaxData { maximum } => 1 + VarInt::size_of(*maximum),
            Frame::MaxStreamData { stream_id, maximum } => {
                1 + VarInt::size_of(*stream_id) + VarInt::size_of(*maximum)
            }
            Frame::MaxStreamId { stream_id } => 1 + VarInt::size_of(*stream_id),
            Frame::Ping => 1,
            Frame::Blocked { offset } => 1 + VarInt::size_of(*offset),
            Frame::StreamBlocked { stream_id, offset } => {
                1 + VarInt::size_of(*stream_id) + VarInt::size_of(*offset)
            }
            Frame::StreamIdBlocked { stream_id } => 1 + VarInt::size_of(*stream_id),
            Frame::NewConnectionId { sequence, cid, .. } => {
                1 + VarInt::size_of(*sequence) + 1 + cid.len() + RESET_TOKEN_SIZE
            }
            Frame::StopSending { stream_id, .. } => 1 + VarInt::size_of(*stream_id) + 2,
            Frame::Ack(ack) => 1 + ack.wire_size(),
            Frame::AckEcn { ack, ecn } => {
                let mut size = 1 + ack.wire_size();
                if let Some(counts) = ecn {
                    size += VarInt::size_of(counts.ect0)
                        + VarInt::size_of(counts.ect1)
                        + VarInt::size_of(counts.ce);
                }
                size
            }
            Frame::PathChallenge(_) | Frame::PathResponse(_) => 1 + 8,
            Frame::Stream(frame) => {
                let mut size = 1 + VarInt::size_of(frame.stream_id);
                if frame.offset > 0 {
                    size += VarInt::size_of(frame.offset);
                }
                size + VarInt::size_of(frame.data.len() as u64) + frame.data.len()
            }
            Frame::Crypto { offset, data } => {
                1 + VarInt::size_of(*offset) + VarInt::size_of(data.len() as u64) + data.len()
            }
        }
    }

    /// Writes the frame. Capacity is validated upfront; on `Wait` nothing has
    /// been written.
    pub fn encode<W: SizedWrite>(&self, stream: &mut W) -> TransportResult<()> {
        if stream.free_capacity() < self.wire_size() {
            return Err(TransportError::Wait);
        }

        match self {
            Frame::Padding(count) => {
                for _ in 0..*count {
                    stream.write_u8(kind::PADDING)?;
                }
            }
            Frame::RstStream {
                stream_id,
                error_code,
                final_offset,
            } => {
                stream.write_u8(kind::RST_STREAM)?;
                write_varint(stream, *stream_id)?;
                stream.write_u16::<BigEndian>(*error_code)?;
                write_varint(stream, *final_offset)?;
            }
            Frame::ConnectionClose { error_code, reason } => {
                stream.write_u8(kind::CONNECTION_CLOSE)?;
                write_close(stream, *error_code, reason)?;
            }
            Frame::ApplicationClose { error_code, reason } => {
                stream.write_u8(kind::APPLICATION_CLOSE)?;
                write_close(stream, *error_code, reason)?;
            }
            Frame::MaxData { maximum } => {
                stream.write_u8(kind::MAX_DATA)?;
                write_varint(stream, *maximum)?;
            }
            Frame::MaxStreamData { stream_id, maximum } => {
                stream.write_u8(kind::MAX_STREAM_DATA)?;
                write_varint(stream, *stream_id)?;
                write_varint(stream, *maximum)?;
            }
            Frame::MaxStreamId { stream_id } => {
                stream.write_u8(kind::MAX_STREAM_ID)?;
                write_varint(stream, *stream_id)?;
            }
            Frame::Ping => stream.write_u8(kind::PING)?,
            Frame::Blocked { offset } => {
                stream.write_u8(kind::BLOCKED)?;
                write_varint(stream, *offset)?;
            }
            Frame::StreamBlocked { stream_id, offset } => {
                stream.write_u8(kind::STREAM_BLOCKED)?;
                write_varint(stream, *stream_id)?;
                write_varint(stream, *offset)?;
            }
            Frame::StreamIdBlocked { stream_id } => {
                stream.write_u8(kind::STREAM_ID_BLOCKED)?;
                write_varint(stream, *stream_id)?;
            }
            Frame::NewConnectionId {
                sequence,
                cid,
                reset_token,
            } => {
                stream.write_u8(kind::NEW_CONNECTION_ID)?;
                write_varint(stream, *sequence)?;
                stream.write_u8(cid.len() as u8)?;
                stream.write_all(cid)?;
                stream.write_all(&reset_token[..])?;
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                stream.write_u8(kind::STOP_SENDING)?;
                write_varint(stream, *stream_id)?;
                stream.write_u16::<BigEndian>(*error_code)?;
            }
            Frame::Ack(ack) => {
                stream.write_u8(kind::ACK)?;
                ack.write(stream)?;
            }
            Frame::AckEcn { ack, ecn } => {
                stream.write_u8(kind::ACK_ECN)?;
                ack.write(stream)?;
                if let Some(counts) = ecn {
                    write_varint(stream, counts.ect0)?;
                    write_varint(stream, counts.ect1)?;
                    write_varint(stream, counts.ce)?;
                }
            }
            Frame::PathChallenge(data) => {
                stream.write_u8(kind::PATH_CHALLENGE)?;
                stream.write_all(data)?;
            }
            Frame::PathResponse(data) => {
                stream.write_u8(kind::PATH_RESPONSE)?;
                stream.write_all(data)?;
            }
            Frame::Stream(frame) => {
                stream.write_u8(self.ty())?;
                write_varint(stream, frame.stream_id)?;
                if frame.offset > 0 {
                    write_varint(stream, frame.offset)?;
                }
                write_varint(stream, frame.data.len() as u64)?;
                stream.write_all(&frame.data)?;
            }
            Frame::Crypto { offset, data } => {
                stream.write_u8(kind::CRYPTO)?;
                write_varint(stream, *offset)?;
                write_varint(stream, data.len() as u64)?;
                stream.write_all(data)?;
            }
        }

        Ok(())
    }

    /// Reads one frame whose type byte has already been consumed.
    pub fn read<R: SizedRead>(stream: &mut R, ty: u8) -> TransportResult<Frame> {
        Ok(match ty {
            kind::PADDING => Frame::Padding(1),
            kind::RST_STREAM => Frame::RstStream {
                stream_id: read_varint(stream)?,
                error_code: read_u16(stream)?,
                final_offset: read_varint(stream)?,
            },
            kind::CONNECTION_CLOSE => {
                let (error_code, reason) = read_close(stream)?;
                Frame::ConnectionClose { error_code, reason }
            }
            kind::APPLICATION_CLOSE => {
                let (error_code, reason) = read_close(stream)?;
                Frame::ApplicationClose { error_code, reason }
            }
            kind::MAX_DATA => Frame::MaxData {
                maximum: read_varint(stream)?,
            },
            kind::MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: read_varint(stream)?,
                maximum: read_varint(stream)?,
            },
            kind::MAX_STREAM_ID => Frame::MaxStreamId {
                stream_id: read_varint(stream)?,
            },
            kind::PING => Frame::Ping,
            kind::BLOCKED => Frame::Blocked {
                offset: read_varint(stream)?,
            },
            kind::STREAM_BLOCKED => Frame::StreamBlocked {
                stream_id: read_varint(stream)?,
                offset: read_varint(stream)?,
            },
            kind::STREAM_ID_BLOCKED => Frame::StreamIdBlocked {
                stream_id: read_varint(stream)?,
            },
            kind::NEW_CONNECTION_ID => {
                let sequence = read_varint(stream)?;

                if stream.remaining_data() < 1 {
                    return Err(ErrorCode::FrameEncodingError.with("truncated connection ID"));
                }
                let len = stream.read_u8()? as usize;
                if len < MIN_CID_SIZE || len > MAX_CID_SIZE {
                    return Err(
                        ErrorCode::FrameEncodingError.with("connection ID length out of range")
                    );
                }
                if stream.remaining_data() < len + RESET_TOKEN_SIZE {
                    return Err(ErrorCode::FrameEncodingError.with("truncated connection ID"));
                }

                let mut cid = [0u8; MAX_CID_SIZE];
                stream.read_exact(&mut cid[..len])?;
                let mut token = [0u8; RESET_TOKEN_SIZE];
                stream.read_exact(&mut token)?;

                Frame::NewConnectionId {
                    sequence,
                    cid: ConnectionId::new(&cid[..len]),
                    reset_token: ResetToken::new(token),
                }
            }
            kind::STOP_SENDING => Frame::StopSending {
                stream_id: read_varint(stream)?,
                error_code: read_u16(stream)?,
            },
            kind::ACK => Frame::Ack(AckFrame::read(stream)?),
            kind::ACK_ECN => {
                let ack = AckFrame::read(stream)?;
                let ecn = if stream.remaining_data() == 0 {
                    None
                } else {
                    Some(EcnCounts {
                        ect0: read_varint(stream)?,
                        ect1: read_varint(stream)?,
                        ce: read_varint(stream)?,
                    })
                };
                Frame::AckEcn { ack, ecn }
            }
            kind::PATH_CHALLENGE => Frame::PathChallenge(read_path_data(stream)?),
            kind::PATH_RESPONSE => Frame::PathResponse(read_path_data(stream)?),
            kind::CRYPTO => {
                let offset = read_varint(stream)?;
                let data = read_sized_data(stream)?;
                Frame::Crypto { offset, data }
            }
            ty if ty & kind::STREAM_MASK == kind::STREAM_BASE => {
                let stream_id = read_varint(stream)?;

                let offset = if ty & kind::STREAM_OFF != 0 {
                    read_varint(stream)?
                } else {
                    0
                };

                let data = if ty & kind::STREAM_LEN != 0 {
                    read_sized_data(stream)?
                } else {
                    // No length field: the data extends to the end of the packet
                    let mut data = vec![0u8; stream.remaining_data()];
                    stream.read_exact(&mut data)?;
                    data
                };

                Frame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    data,
                    fin: ty & kind::STREAM_FIN != 0,
                })
            }
            _ => {
                return Err(
                    ErrorCode::FrameEncodingError.with(format!("unknown frame type {:#04x}", ty))
                );
            }
        })
    }

    /// Decodes a whole packet payload in wire order, coalescing padding runs.
    pub fn decode_all<R: SizedRead>(stream: &mut R) -> TransportResult<Vec<Frame>> {
        let mut frames = Vec::new();
        let mut pending: Option<u8> = None;

        while pending.is_some() || stream.remaining_data() > 0 {
            let ty = match pending.take() {
                Some(ty) => ty,
                None => stream.read_u8()?,
            };

            if ty == kind::PADDING {
                let mut count = 1;
                while stream.remaining_data() > 0 {
                    let next = stream.read_u8()?;
                    if next == kind::PADDING {
                        count += 1;
                    } else {
                        pending = Some(next);
                        break;
                    }
                }
                frames.push(Frame::Padding(count));
            } else {
                frames.push(Frame::read(stream, ty)?);
            }
        }

        Ok(frames)
    }
}

fn read_u16<R: SizedRead>(stream: &mut R) -> TransportResult<u16> {
    if stream.remaining_data() < 2 {
        return Err(ErrorCode::FrameEncodingError.with("truncated error code"));
    }
    Ok(stream.read_u16::<BigEndian>()?)
}

fn write_close<W: SizedWrite>(
    stream: &mut W,
    error_code: u16,
    reason: &str,
) -> TransportResult<()> {
    stream.write_u16::<BigEndian>(error_code)?;
    write_varint(stream, reason.len() as u64)?;
    stream.write_all(reason.as_bytes())?;
    Ok(())
}

fn read_close<R: SizedRead>(stream: &mut R) -> TransportResult<(u16, String)> {
    let error_code = read_u16(stream)?;

    // The reason phrase is exactly `len` bytes starting where the length
    // integer ended.
    let len = read_varint(stream)? as usize;
    if stream.remaining_data() < len {
        return Err(ErrorCode::FrameEncodingError.with("truncated reason phrase"));
    }

    let mut reason = vec![0u8; len];
    stream.read_exact(&mut reason)?;

    Ok((error_code, String::from_utf8_lossy(&reason).into_owned()))
}

fn read_path_data<R: SizedRead>(stream: &mut R) -> TransportResult<[u8; 8]> {
    if stream.remaining_data() < 8 {
        return Err(ErrorCode::FrameEncodingError.with("truncated path data"));
    }

    let mut data = [0u8; 8];
    stream.read_exact(&mut data)?;
    Ok(data)
}

fn read_sized_data<R: SizedRead>(stream: &mut R) -> TransportResult<Vec<u8>> {
    let len = read_varint(stream)? as usize;
    if stream.remaining_data() < len {
        return Err(ErrorCode::FrameEncodingError.with("frame data exceeds packet"));
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data)?;
    Ok(data)
}
