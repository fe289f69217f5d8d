//! Stream multiplexing: stream identity, per-stream state machines and the
//! two-level flow-control ledger.

pub mod recv;
pub mod send;

pub use recv::{Assembler, RecvState, RecvStream};
pub use send::{PoppedChunk, SendBlock, SendState, SendStream};

use crate::shared::{ErrorCode, Side, TransportError, TransportResult};
use crate::wire::frame::{Frame, StreamFrame};
use hashbrown::HashMap;

/// Stream direction, encoded in bit 1 of the stream ID.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dir {
    Bidi,
    Uni,
}

impl Dir {
    #[inline]
    fn index(self) -> usize {
        match self {
            Dir::Bidi => 0,
            Dir::Uni => 1,
        }
    }
}

/// A 62-bit stream identifier. Bit 0 carries the initiator, bit 1 the
/// direction; the remaining bits are the per-type index.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub fn new(initiator: Side, dir: Dir, index: u64) -> StreamId {
        let mut id = index << 2;
        if initiator == Side::Server {
            id |= 0x1;
        }
        if dir == Dir::Uni {
            id |= 0x2;
        }
        StreamId(id)
    }

    #[inline]
    pub fn from_value(value: u64) -> StreamId {
        StreamId(value)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    #[inline]
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bidi
        } else {
            Dir::Uni
        }
    }

    #[inline]
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

/// Combined stream state as the application observes it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    ResetSent,
    ResetReceived,
    Closed,
}

#[derive(Debug)]
pub struct Stream {
    pub(crate) send: Option<SendStream>,
    pub(crate) recv: Option<RecvStream>,
}

impl Stream {
    pub fn state(&self) -> StreamState {
        let send_closed = self
            .send
            .as_ref()
            .map_or(true, SendStream::is_closed_locally);
        let send_terminal = self.send.as_ref().map_or(true, SendStream::is_terminal);
        let recv_terminal = self.recv.as_ref().map_or(true, RecvStream::is_terminal);

        let send_reset = matches!(
            self.send.as_ref().map(SendStream::state),
            Some(SendState::ResetSent(_)) | Some(SendState::ResetAcked(_))
        );
        let recv_reset = matches!(
            self.recv.as_ref().map(RecvStream::state),
            Some(RecvState::Reset(_))
        );

        if send_terminal && recv_terminal {
            StreamState::Closed
        } else if recv_reset {
            StreamState::ResetReceived
        } else if send_reset {
            StreamState::ResetSent
        } else if recv_terminal {
            StreamState::HalfClosedRemote
        } else if send_closed {
            StreamState::HalfClosedLocal
        } else {
            StreamState::Open
        }
    }
}

/// Connection-level flow-control ledger. `data_sent` must never exceed the
/// peer's limit; a peer exceeding ours is a FLOW_CONTROL_ERROR.
#[derive(Debug)]
pub struct FlowControl {
    max_data_local: u64,
    max_data_remote: u64,
    data_sent: u64,
    data_received: u64,
    delivered: u64,
    window: u64,
}

impl FlowControl {
    pub fn new(max_data_local: u64) -> FlowControl {
        FlowControl {
            max_data_local,
            max_data_remote: 0,
            data_sent: 0,
            data_received: 0,
            delivered: 0,
            window: max_data_local,
        }
    }

    #[inline]
    pub fn credit(&self) -> u64 {
        self.max_data_remote.saturating_sub(self.data_sent)
    }

    #[inline]
    pub fn data_sent(&self) -> u64 {
        self.data_sent
    }

    #[inline]
    pub fn data_received(&self) -> u64 {
        self.data_received
    }

    #[inline]
    pub fn charge_sent(&mut self, bytes: u64) {
        self.data_sent += bytes;
    }

    pub fn on_received(&mut self, bytes: u64) -> TransportResult<()> {
        self.data_received += bytes;
        if self.data_received > self.max_data_local {
            return Err(ErrorCode::FlowControlError.with("connection flow-control limit exceeded"));
        }
        Ok(())
    }

    #[inline]
    pub fn on_delivered(&mut self, bytes: u64) {
        self.delivered += bytes;
    }

    /// Monotone raise of the peer's budget.
    #[inline]
    pub fn raise_remote(&mut self, maximum: u64) {
        if maximum > self.max_data_remote {
            self.max_data_remote = maximum;
        }
    }

    /// Re-arms the local window once half of it is consumed; returns the new
    /// limit to advertise in MAX_DATA.
    pub fn window_update(&mut self) -> Option<u64> {
        let remaining = self.max_data_local - self.data_received;
        if remaining >= self.window / 2 {
            return None;
        }

        let target = self.delivered + self.window;
        if target <= self.max_data_local {
            return None;
        }

        self.max_data_local = target;
        Some(target)
    }
}

/// Per-type limits we impose and the peer imposes, in stream counts.
#[derive(Debug, Default, Copy, Clone)]
struct StreamLimits {
    local: [u64; 2],
    remote: [u64; 2],
}

/// Initial limits taken from the local configuration before the peer's
/// transport parameters arrive.
#[derive(Debug, Copy, Clone)]
pub struct LocalStreamConfig {
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub max_bidi_streams: u64,
    pub max_uni_streams: u64,
}

/// Owns every stream of a connection plus the shared ledger, and converts
/// between frames and stream-state transitions.
#[derive(Debug)]
pub struct StreamMap {
    side: Side,
    streams: HashMap<StreamId, Stream>,
    pub(crate) flow: FlowControl,
    limits: StreamLimits,
    next_index: [u64; 2],
    /// Receive window for each newly accepted stream.
    local_stream_window: u64,
    /// Send allowance for each new stream, from the peer's parameters.
    peer_stream_window: [u64; 3],
    /// Control frames waiting for the next packet.
    pending: Vec<Frame>,
    id_blocked: [bool; 2],
}

/// Indexes into `peer_stream_window`.
const PEER_BIDI: usize = 0;
const PEER_UNI: usize = 1;
const PEER_BIDI_REMOTE: usize = 2;

impl StreamMap {
    pub fn new(side: Side, config: LocalStreamConfig) -> StreamMap {
        let mut limits = StreamLimits::default();
        limits.local = [config.max_bidi_streams, config.max_uni_streams];

        StreamMap {
            side,
            streams: HashMap::new(),
            flow: FlowControl::new(config.initial_max_data),
            limits,
            next_index: [0, 0],
            local_stream_window: config.initial_max_stream_data,
            peer_stream_window: [0; 3],
            pending: Vec::new(),
            id_blocked: [false, false],
        }
    }

    /// Installs the peer's transport parameters once the handshake delivers
    /// them.
    pub fn apply_peer_params(
        &mut self,
        max_data: u64,
        stream_data_bidi: u64,
        stream_data_bidi_remote: u64,
        stream_data_uni: u64,
        max_bidi: u64,
        max_uni: u64,
    ) {
        self.flow.raise_remote(max_data);
        self.peer_stream_window = [stream_data_bidi, stream_data_uni, stream_data_bidi_remote];
        self.limits.remote = [max_bidi, max_uni];

        // Streams opened before the handshake settled were created with a
        // zero send allowance
        for (id, stream) in self.streams.iter_mut() {
            if let Some(send) = stream.send.as_mut() {
                send.on_max_stream_data(Self::initial_send_window(
                    self.side,
                    *id,
                    &self.peer_stream_window,
                ));
            }
        }
    }

    /// The allowance the peer's parameters grant a send half we own.
    fn initial_send_window(side: Side, id: StreamId, windows: &[u64; 3]) -> u64 {
        match id.dir() {
            Dir::Uni => windows[PEER_UNI],
            Dir::Bidi if id.initiator() == side => windows[PEER_BIDI],
            Dir::Bidi => windows[PEER_BIDI_REMOTE],
        }
    }

    /// Opens a locally initiated stream. `Wait` means the peer's stream limit
    /// is exhausted; a STREAM_ID_BLOCKED notice is queued.
    pub fn open(&mut self, dir: Dir) -> TransportResult<StreamId> {
        let index = self.next_index[dir.index()];

        if index >= self.limits.remote[dir.index()] {
            if !self.id_blocked[dir.index()] {
                self.id_blocked[dir.index()] = true;
                let blocked_id = StreamId::new(self.side, dir, index);
                self.pending.push(Frame::StreamIdBlocked {
                    stream_id: blocked_id.value(),
                });
            }
            return Err(TransportError::Wait);
        }

        self.next_index[dir.index()] = index + 1;
        let id = StreamId::new(self.side, dir, index);

        let send_window = Self::initial_send_window(self.side, id, &self.peer_stream_window);
        let stream = Stream {
            send: Some(SendStream::new(send_window)),
            recv: match dir {
                Dir::Bidi => Some(RecvStream::new(self.local_stream_window)),
                Dir::Uni => None,
            },
        };

        self.streams.insert(id, stream);
        Ok(id)
    }

    #[inline]
    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    #[inline]
    pub fn state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(&id).map(Stream::state)
    }

    /// Resolves the stream a peer frame names, creating peer-initiated
    /// streams on first use.
    fn incoming(&mut self, id: StreamId) -> TransportResult<&mut Stream> {
        if id.initiator() == self.side {
            if self.streams.contains_key(&id) {
                return Ok(self.streams.get_mut(&id).unwrap());
            }
            return Err(
                ErrorCode::StreamStateError.with("frame for a local stream that was never opened")
            );
        }

        if !self.streams.contains_key(&id) {
            if id.index() >= self.limits.local[id.dir().index()] {
                return Err(ErrorCode::StreamIdError.with("stream beyond the advertised limit"));
            }

            let stream = Stream {
                send: match id.dir() {
                    Dir::Bidi => Some(SendStream::new(Self::initial_send_window(
                        self.side,
                        id,
                        &self.peer_stream_window,
                    ))),
                    Dir::Uni => None,
                },
                recv: Some(RecvStream::new(self.local_stream_window)),
            };
            self.streams.insert(id, stream);
        }

        Ok(self.streams.get_mut(&id).unwrap())
    }

    /// Applies a STREAM frame. Returns true when new contiguous data became
    /// readable.
    pub fn on_stream_frame(&mut self, frame: &StreamFrame) -> TransportResult<bool> {
        let id = StreamId::from_value(frame.stream_id);

        if id.dir() == Dir::Uni && id.initiator() == self.side {
            return Err(ErrorCode::StreamStateError.with("data on a send-only stream"));
        }

        let stream = self.incoming(id)?;
        let recv = stream
            .recv
            .as_mut()
            .expect("receive half must exist for a receivable stream");

        let before = recv.state() == RecvState::Receiving || recv.state() == RecvState::SizeKnown;
        let charged = recv.on_stream_frame(frame.offset, &frame.data, frame.fin)?;
        let readable = before && (recv.state() == RecvState::Finished || charged > 0);

        self.flow.on_received(charged)?;
        Ok(readable)
    }

    pub fn on_rst_stream(
        &mut self,
        stream_id: u64,
        error_code: u16,
        final_offset: u64,
    ) -> TransportResult<()> {
        let id = StreamId::from_value(stream_id);

        if id.dir() == Dir::Uni && id.initiator() == self.side {
            return Err(ErrorCode::StreamStateError.with("reset of a send-only stream"));
        }

        let stream = self.incoming(id)?;
        let recv = stream
            .recv
            .as_mut()
            .expect("receive half must exist for a receivable stream");

        let charged = recv.on_reset(final_offset, error_code)?;
        self.flow.on_received(charged)
    }

    /// STOP_SENDING: abandon our send half and answer with RST_STREAM.
    pub fn on_stop_sending(&mut self, stream_id: u64, error_code: u16) -> TransportResult<()> {
        let id = StreamId::from_value(stream_id);

        if id.dir() == Dir::Uni && id.initiator() != self.side {
            return Err(ErrorCode::StreamStateError.with("stop sending on a receive-only stream"));
        }

        let stream = self.incoming(id)?;
        let send = stream
            .send
            .as_mut()
            .expect("send half must exist for a sendable stream");

        if let Some(final_offset) = send.reset(error_code) {
            self.pending.push(Frame::RstStream {
                stream_id,
                error_code,
                final_offset,
            });
        }

        Ok(())
    }

    pub fn on_max_data(&mut self, maximum: u64) {
        self.flow.raise_remote(maximum);
    }

    pub fn on_max_stream_data(&mut self, stream_id: u64, maximum: u64) -> TransportResult<()> {
        let id = StreamId::from_value(stream_id);

        if id.dir() == Dir::Uni && id.initiator() != self.side {
            return Err(
                ErrorCode::StreamStateError.with("max stream data for a receive-only stream")
            );
        }

        let stream = self.incoming(id)?;
        if let Some(send) = stream.send.as_mut() {
            send.on_max_stream_data(maximum);
        }

        Ok(())
    }

    /// MAX_STREAM_ID raises the count of streams we may open of the named
    /// type; lower values are ignored.
    pub fn on_max_stream_id(&mut self, stream_id: u64) {
        let id = StreamId::from_value(stream_id);
        if id.initiator() != self.side {
            return;
        }

        let allowed = id.index() + 1;
        let slot = id.dir().index();
        if allowed > self.limits.remote[slot] {
            self.limits.remote[slot] = allowed;
            self.id_blocked[slot] = false;
        }
    }

    /// Application write.
    pub fn write(&mut self, id: StreamId, data: &[u8]) -> TransportResult<usize> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| ErrorCode::StreamStateError.with("write on an unknown stream"))?;

        stream
            .send
            .as_mut()
            .ok_or_else(|| ErrorCode::StreamStateError.with("write on a receive-only stream"))?
            .write(data)
    }

    /// Application read of contiguous data.
    pub fn read(&mut self, id: StreamId) -> TransportResult<Vec<u8>> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| ErrorCode::StreamStateError.with("read on an unknown stream"))?;

        let recv = stream
            .recv
            .as_mut()
            .ok_or_else(|| ErrorCode::StreamStateError.with("read on a send-only stream"))?;

        let data = recv.read();
        self.flow.on_delivered(data.len() as u64);

        if let Some(maximum) = recv.window_update() {
            self.pending.push(Frame::MaxStreamData {
                stream_id: id.value(),
                maximum,
            });
        }

        Ok(data)
    }

    pub fn finish(&mut self, id: StreamId) -> TransportResult<()> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| ErrorCode::StreamStateError.with("finish on an unknown stream"))?;

        stream
            .send
            .as_mut()
            .ok_or_else(|| ErrorCode::StreamStateError.with("finish on a receive-only stream"))?
            .finish()
    }

    pub fn reset(&mut self, id: StreamId, error_code: u16) -> TransportResult<()> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| ErrorCode::StreamStateError.with("reset of an unknown stream"))?;

        let send = stream
            .send
            .as_mut()
            .ok_or_else(|| ErrorCode::StreamStateError.with("reset of a receive-only stream"))?;

        if let Some(final_offset) = send.reset(error_code) {
            self.pending.push(Frame::RstStream {
                stream_id: id.value(),
                error_code,
                final_offset,
            });
        }

        Ok(())
    }

    /// Drains queued control frames and freshly generated window updates.
    pub fn poll_control(&mut self, out: &mut Vec<Frame>) {
        if let Some(maximum) = self.flow.window_update() {
            out.push(Frame::MaxData { maximum });
        }

        out.append(&mut self.pending);
    }

    /// Fills stream frames up to `budget` bytes, charging the connection
    /// window as it goes. Emits BLOCKED/STREAM_BLOCKED notices when limits
    /// gate pending data.
    pub fn fill_stream_frames(&mut self, budget: usize, out: &mut Vec<Frame>) {
        let mut remaining = budget;
        let mut conn_blocked = false;

        let mut ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, stream)| {
                stream
                    .send
                    .as_ref()
                    .map_or(false, SendStream::wants_transmit)
            })
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();

        for id in ids {
            loop {
                // Worst-case frame overhead: type byte, stream ID, offset and
                // a length field
                let overhead = 1 + 8 + 8 + 4;
                if remaining <= overhead {
                    return;
                }

                let credit = self.flow.credit();
                let stream = self.streams.get_mut(&id).unwrap();
                let send = stream.send.as_mut().unwrap();

                match send.pop_chunk(remaining - overhead, credit) {
                    Ok(chunk) => {
                        self.flow.charge_sent(chunk.new_flow);
                        remaining = remaining
                            .saturating_sub(overhead + chunk.data.len());

                        let fin = chunk.fin;
                        out.push(Frame::Stream(StreamFrame {
                            stream_id: id.value(),
                            offset: chunk.offset,
                            data: chunk.data,
                            fin: chunk.fin,
                        }));

                        if fin {
                            break;
                        }
                    }
                    Err(SendBlock::Idle) => break,
                    Err(SendBlock::Stream) => {
                        self.pending.push(Frame::StreamBlocked {
                            stream_id: id.value(),
                            offset: send.max_stream_data(),
                        });
                        break;
                    }
                    Err(SendBlock::Connection) => {
                        conn_blocked = true;
                        break;
                    }
                }
            }
        }

        if conn_blocked {
            let offset = self.flow.data_sent();
            self.pending.push(Frame::Blocked { offset });
        }
    }

    /// Ack/loss plumbing from the recovery machinery.
    pub fn stream_acked(&mut self, stream_id: u64, offset: u64, len: usize, fin: bool) {
        if let Some(stream) = self.streams.get_mut(&StreamId::from_value(stream_id)) {
            if let Some(send) = stream.send.as_mut() {
                send.on_acked(offset, len, fin);
            }
        }
    }

    pub fn stream_lost(&mut self, stream_id: u64, offset: u64, data: Vec<u8>, fin: bool) {
        if let Some(stream) = self.streams.get_mut(&StreamId::from_value(stream_id)) {
            if let Some(send) = stream.send.as_mut() {
                send.on_lost(offset, data, fin);
            }
        }
    }

    pub fn rst_acked(&mut self, stream_id: u64) {
        if let Some(stream) = self.streams.get_mut(&StreamId::from_value(stream_id)) {
            if let Some(send) = stream.send.as_mut() {
                send.on_reset_acked();
            }
        }
    }

    /// True when any stream still has data to transmit.
    pub fn wants_transmit(&self) -> bool {
        !self.pending.is_empty()
            || self.streams.values().any(|stream| {
                stream
                    .send
                    .as_ref()
                    .map_or(false, SendStream::wants_transmit)
            })
    }
}
