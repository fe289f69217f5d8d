use crate::shared::{ErrorCode, TransportResult};
use crate::space::RangeSet;
use std::collections::VecDeque;

/// Send half of a stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    /// Nothing written yet.
    Ready,
    /// Data buffered or in flight.
    Sending,
    /// Everything including FIN has been transmitted at least once.
    DataSent,
    /// Peer acknowledged all data and the FIN.
    DataAcked,
    /// RST_STREAM sent with the carried application code.
    ResetSent(u16),
    /// Peer acknowledged the reset.
    ResetAcked(u16),
}

#[derive(Debug)]
struct Chunk {
    offset: u64,
    data: Vec<u8>,
}

/// A slice of stream data handed to the packetizer.
#[derive(Debug)]
pub struct PoppedChunk {
    pub offset: u64,
    pub data: Vec<u8>,
    pub fin: bool,
    /// Bytes charged against the connection-level window: only data above the
    /// high-water mark counts, retransmits are free.
    pub new_flow: u64,
}

/// Why `pop_chunk` could not produce data.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendBlock {
    /// Nothing buffered.
    Idle,
    /// Stream-level limit reached; advertise via STREAM_BLOCKED.
    Stream,
    /// Connection-level limit reached; advertise via BLOCKED.
    Connection,
}

#[derive(Debug)]
pub struct SendStream {
    pending: VecDeque<Chunk>,
    /// Total bytes accepted from the application.
    next_offset: u64,
    /// Highest offset handed to the packetizer; flow control charges stop here.
    flow_watermark: u64,
    acked: RangeSet,
    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,
    reset: Option<(u16, u64)>,
    reset_acked: bool,
    /// Peer-advertised limit; monotone.
    max_stream_data: u64,
}

impl SendStream {
    pub fn new(max_stream_data: u64) -> SendStream {
        SendStream {
            pending: VecDeque::new(),
            next_offset: 0,
            flow_watermark: 0,
            acked: RangeSet::new(),
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            reset: None,
            reset_acked: false,
            max_stream_data,
        }
    }

    pub fn state(&self) -> SendState {
        if let Some((code, _)) = self.reset {
            return if self.reset_acked {
                SendState::ResetAcked(code)
            } else {
                SendState::ResetSent(code)
            };
        }

        if self.fin_acked && self.all_data_acked() {
            SendState::DataAcked
        } else if self.fin_sent && self.pending.is_empty() {
            SendState::DataSent
        } else if self.next_offset > 0 || self.fin_queued {
            SendState::Sending
        } else {
            SendState::Ready
        }
    }

    /// True once nothing further will ever be transmitted.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), SendState::DataAcked | SendState::ResetAcked(_))
    }

    /// True once the local direction has been closed (FIN or reset sent).
    #[inline]
    pub fn is_closed_locally(&self) -> bool {
        self.fin_sent || self.reset.is_some()
    }

    #[inline]
    pub fn max_stream_data(&self) -> u64 {
        self.max_stream_data
    }

    /// Buffers application data. The stream-level limit gates transmission,
    /// not buffering.
    pub fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
        if self.fin_queued || self.reset.is_some() {
            return Err(ErrorCode::StreamStateError.with("write on a closed stream"));
        }

        self.pending.push_back(Chunk {
            offset: self.next_offset,
            data: data.to_vec(),
        });
        self.next_offset += data.len() as u64;

        Ok(data.len())
    }

    /// Marks the end of the stream; the FIN rides the last data frame.
    pub fn finish(&mut self) -> TransportResult<()> {
        if self.reset.is_some() {
            return Err(ErrorCode::StreamStateError.with("finish on a reset stream"));
        }
        self.fin_queued = true;
        Ok(())
    }

    /// Abandons the stream. Returns the final offset the RST_STREAM frame
    /// must carry; `None` when a reset was already initiated.
    pub fn reset(&mut self, error_code: u16) -> Option<u64> {
        if self.reset.is_some() {
            return None;
        }

        self.reset = Some((error_code, self.next_offset));
        self.pending.clear();

        Some(self.next_offset)
    }

    /// Whether any data or FIN is waiting to be packed.
    pub fn wants_transmit(&self) -> bool {
        if self.reset.is_some() {
            return false;
        }
        !self.pending.is_empty() || (self.fin_queued && !self.fin_sent)
    }

    /// Hands out the next chunk, respecting the stream limit and the supplied
    /// connection-level credit.
    pub fn pop_chunk(
        &mut self,
        max_bytes: usize,
        conn_credit: u64,
    ) -> Result<PoppedChunk, SendBlock> {
        if self.reset.is_some() {
            return Err(SendBlock::Idle);
        }

        let chunk = match self.pending.front_mut() {
            Some(chunk) => chunk,
            None => {
                // A bare FIN still needs a frame
                if self.fin_queued && !self.fin_sent {
                    self.fin_sent = true;
                    return Ok(PoppedChunk {
                        offset: self.next_offset,
                        data: Vec::new(),
                        fin: true,
                        new_flow: 0,
                    });
                }
                return Err(SendBlock::Idle);
            }
        };

        let offset = chunk.offset;
        let mut end = offset + chunk.data.len() as u64;
        end = end.min(offset + max_bytes as u64);

        // Limits bind only above the high-water mark; retransmits pass freely
        if end > self.flow_watermark {
            if offset >= self.max_stream_data {
                return Err(SendBlock::Stream);
            }
            let conn_limit = self.flow_watermark + conn_credit;
            if offset >= conn_limit {
                return Err(SendBlock::Connection);
            }
            end = end.min(self.max_stream_data).min(conn_limit);
        }

        if end <= offset {
            return Err(SendBlock::Idle);
        }

        let take = (end - offset) as usize;
        let data = if take == chunk.data.len() {
            self.pending.pop_front().unwrap().data
        } else {
            let tail = chunk.data.split_off(take);
            let head = std::mem::replace(&mut chunk.data, tail);
            chunk.offset += take as u64;
            head
        };

        let fin = self.fin_queued && end == self.next_offset && self.pending.is_empty();
        if fin {
            self.fin_sent = true;
        }

        let new_flow = end.saturating_sub(self.flow_watermark);
        self.flow_watermark = self.flow_watermark.max(end);

        Ok(PoppedChunk {
            offset,
            data,
            fin,
            new_flow,
        })
    }

    /// Records acknowledged stream bytes.
    pub fn on_acked(&mut self, offset: u64, len: usize, fin: bool) {
        if len > 0 {
            self.acked.insert_range(offset, offset + len as u64 - 1);
        }
        if fin {
            self.fin_acked = true;
        }
    }

    /// Records an acknowledged RST_STREAM.
    pub fn on_reset_acked(&mut self) {
        if self.reset.is_some() {
            self.reset_acked = true;
        }
    }

    /// Requeues a lost chunk for retransmission under a fresh packet number.
    pub fn on_lost(&mut self, offset: u64, data: Vec<u8>, fin: bool) {
        if self.reset.is_some() {
            return;
        }

        if fin {
            self.fin_sent = false;
        }

        if !data.is_empty() {
            // Keep the queue ordered by offset so retransmits go out first
            let position = self
                .pending
                .iter()
                .position(|chunk| chunk.offset > offset)
                .unwrap_or(self.pending.len());
            self.pending.insert(position, Chunk { offset, data });
        }
    }

    /// Raises the peer-advertised limit; lower values are ignored.
    pub fn on_max_stream_data(&mut self, maximum: u64) {
        if maximum > self.max_stream_data {
            self.max_stream_data = maximum;
        }
    }

    fn all_data_acked(&self) -> bool {
        self.acked.contiguous_end(0) >= self.next_offset
    }
}
