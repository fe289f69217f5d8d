use crate::shared::{ErrorCode, TransportResult};
use crate::wire::varint::VarInt;
use std::collections::BTreeMap;

/// Ordered reassembly of byte ranges addressed by 62-bit offsets. Segments
/// are clipped on insert so the map stays disjoint; contiguous data at the
/// front is drained by the reader.
#[derive(Debug, Default)]
pub struct Assembler {
    segments: BTreeMap<u64, Vec<u8>>,
    delivered: u64,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            segments: BTreeMap::new(),
            delivered: 0,
        }
    }

    /// Offset up to which data has been handed to the reader.
    #[inline]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// End of the contiguous prefix currently known, delivered or buffered.
    pub fn contiguous_end(&self) -> u64 {
        let mut end = self.delivered;
        for (&start, segment) in &self.segments {
            if start > end {
                break;
            }
            end = start + segment.len() as u64;
        }
        end
    }

    /// Number of bytes buffered but not yet delivered.
    pub fn buffered(&self) -> usize {
        self.segments.values().map(Vec::len).sum()
    }

    /// Inserts received data, dropping anything already delivered or buffered.
    pub fn insert(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        let mut cursor = offset.max(self.delivered);

        while cursor < end {
            // Skip over an existing segment covering the cursor
            if let Some((&start, segment)) = self.segments.range(..=cursor).next_back() {
                let segment_end = start + segment.len() as u64;
                if segment_end > cursor {
                    cursor = segment_end;
                    continue;
                }
            }

            // The hole runs to the next segment or the end of the input
            let hole_end = self
                .segments
                .range(cursor..)
                .next()
                .map(|(&start, _)| start.min(end))
                .unwrap_or(end);

            if hole_end > cursor {
                let piece = &data[(cursor - offset) as usize..(hole_end - offset) as usize];
                self.segments.insert(cursor, piece.to_vec());
                cursor = hole_end;
            }
        }
    }

    /// Drains all contiguous data at the front.
    pub fn pop_contiguous(&mut self) -> Vec<u8> {
        let mut out = Vec::new();

        while let Some(segment) = self.segments.remove(&self.delivered) {
            self.delivered += segment.len() as u64;
            out.extend_from_slice(&segment);
        }

        out
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

/// Receive half of a stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvState {
    /// Accepting data; the final size is not yet known.
    Receiving,
    /// FIN seen; data up to the final offset may still be in flight.
    SizeKnown,
    /// Every byte up to the final offset has been delivered.
    Finished,
    /// Peer abandoned the stream with the carried application code.
    Reset(u16),
}

#[derive(Debug)]
pub struct RecvStream {
    state: RecvState,
    assembler: Assembler,
    /// Highest offset seen, charged against flow-control windows.
    largest_offset: u64,
    final_offset: Option<u64>,
    /// Receive limit we advertised to the peer.
    max_stream_data: u64,
    /// Credit granted whenever the window is re-armed.
    window: u64,
}

impl RecvStream {
    pub fn new(max_stream_data: u64) -> RecvStream {
        RecvStream {
            state: RecvState::Receiving,
            assembler: Assembler::new(),
            largest_offset: 0,
            final_offset: None,
            max_stream_data,
            window: max_stream_data,
        }
    }

    #[inline]
    pub fn state(&self) -> RecvState {
        self.state
    }

    #[inline]
    pub fn max_stream_data(&self) -> u64 {
        self.max_stream_data
    }

    #[inline]
    pub fn final_offset(&self) -> Option<u64> {
        self.final_offset
    }

    /// True once the peer can send nothing further on this stream.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RecvState::Finished | RecvState::Reset(_))
    }

    /// Applies a STREAM frame. Returns the increase of the highest seen
    /// offset, which the caller charges against the connection window.
    pub fn on_stream_frame(&mut self, offset: u64, data: &[u8], fin: bool) -> TransportResult<u64> {
        let end = offset + data.len() as u64;

        if end > VarInt::MAX.value() {
            return Err(ErrorCode::FrameEncodingError.with("stream offset exceeds 62 bits"));
        }

        if let RecvState::Reset(_) = self.state {
            // Data after a reset carries no information
            return Ok(0);
        }

        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (fin && end != final_offset) {
                return Err(ErrorCode::FinalOffsetError.with("data beyond the final offset"));
            }
        }

        if fin {
            self.final_offset = Some(end);
            if self.state == RecvState::Receiving {
                self.state = RecvState::SizeKnown;
            }
        }

        if end > self.max_stream_data {
            return Err(ErrorCode::FlowControlError.with("stream flow-control limit exceeded"));
        }

        let newly_charged = end.saturating_sub(self.largest_offset);
        self.largest_offset = self.largest_offset.max(end);

        self.assembler.insert(offset, data);
        self.update_finished();

        Ok(newly_charged)
    }

    /// Applies RST_STREAM. The final offset must agree with everything seen
    /// so far. Returns the flow-control charge up to the final offset.
    pub fn on_reset(&mut self, final_offset: u64, error_code: u16) -> TransportResult<u64> {
        if final_offset < self.largest_offset {
            return Err(ErrorCode::FinalOffsetError.with("reset below received data"));
        }
        if let Some(previous) = self.final_offset {
            if previous != final_offset {
                return Err(ErrorCode::FinalOffsetError.with("reset contradicts final offset"));
            }
        }

        let newly_charged = final_offset - self.largest_offset;
        self.largest_offset = final_offset;
        self.final_offset = Some(final_offset);
        self.state = RecvState::Reset(error_code);
        self.assembler.clear();

        Ok(newly_charged)
    }

    /// Drains contiguous reassembled data.
    pub fn read(&mut self) -> Vec<u8> {
        let data = self.assembler.pop_contiguous();
        self.update_finished();
        data
    }

    /// When less than half the window remains, re-arms it and returns the new
    /// limit to advertise in MAX_STREAM_DATA.
    pub fn window_update(&mut self) -> Option<u64> {
        if self.state != RecvState::Receiving {
            return None;
        }

        let remaining = self.max_stream_data - self.assembler.delivered();
        if remaining >= self.window / 2 {
            return None;
        }

        self.max_stream_data = self.assembler.delivered() + self.window;
        Some(self.max_stream_data)
    }

    fn update_finished(&mut self) {
        if let Some(final_offset) = self.final_offset {
            if self.state == RecvState::SizeKnown && self.assembler.delivered() == final_offset {
                self.state = RecvState::Finished;
            }
        }
    }
}
