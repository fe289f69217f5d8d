//! The per-connection state machine: ingress packet processing and frame
//! dispatch, the packetizer and ACK scheduler on egress, timers, and the
//! close/drain lifecycle. One connection is owned by one executor; every
//! method here runs synchronously to completion.

use crate::config::TransportConfig;
use crate::crypto::{CryptoContext, HandshakeOracle, Level, LEVEL_COUNT};
use crate::params::TransportParameters;
use crate::recovery::{LossDetection, NewReno, SentPacket, TimeoutOutcome};
use crate::shared::{ErrorCode, Side, TransportError, TransportResult};
use crate::streams::{Dir, StreamId, StreamMap, StreamState};
use crate::wire::cid::{ConnectionId, ResetToken, RESET_TOKEN_SIZE};
use crate::wire::frame::{AckFrame, Frame};
use crate::wire::header::{Header, LongType};
use crate::wire::packet::{self, Probe, MIN_INITIAL_SIZE};
use crate::wire::pnum::TruncatedPn;
use hashbrown::HashMap;
use photon::logging;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sealing overhead reserved per packet: the largest header this endpoint
/// emits plus the AEAD tag.
const PACKET_OVERHEAD: usize = 64;

/// Connection-level happenings surfaced to the host.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnEvent {
    HandshakeComplete,
    StreamReadable(StreamId),
    /// The connection is going away: the wire code, the reason phrase, and
    /// whether the peer initiated it.
    ConnectionLost {
        error_code: u16,
        reason: String,
        by_peer: bool,
    },
    /// The draining period elapsed; the connection can be reaped.
    Closed,
}

#[derive(Debug)]
enum State {
    Handshaking,
    Established,
    Closing {
        frame: Frame,
        until: Instant,
        send_pending: bool,
        last_sent: Option<Instant>,
    },
    Draining {
        until: Instant,
        /// A single close packet owed in response to the peer's close.
        echo: Option<Frame>,
    },
    Dead,
}

pub struct Connection {
    side: Side,
    state: State,
    version: u32,
    local_cid: ConnectionId,
    remote_cid: ConnectionId,
    original_dcid: ConnectionId,
    /// Alternative peer CIDs from NEW_CONNECTION_ID, keyed by sequence.
    remote_cids: HashMap<u64, (ConnectionId, ResetToken)>,
    peer_reset_tokens: Vec<ResetToken>,
    retry_token: Option<Vec<u8>>,
    contexts: [CryptoContext; LEVEL_COUNT],
    oracle: Box<dyn HandshakeOracle>,
    params_peer: Option<TransportParameters>,
    streams: StreamMap,
    recovery: LossDetection,
    congestion: NewReno,
    config: TransportConfig,
    /// Control frames awaiting transmission, per level.
    control: [Vec<Frame>; LEVEL_COUNT],
    path_response: Option<[u8; 8]>,
    probes_pending: [u32; LEVEL_COUNT],
    /// Initial-level handshake bytes, kept for a version-negotiation or
    /// retry restart.
    first_flight: Vec<u8>,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    events: VecDeque<ConnEvent>,
    dropped_packets: u64,
    log: logging::Logger,
}

impl Connection {
    /// Minimum spacing between close packets while closing.
    const CLOSE_RESEND_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new_client<'a, L: Into<Option<&'a logging::Logger>>>(
        config: TransportConfig,
        oracle: Box<dyn HandshakeOracle>,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        now: Instant,
        log: L,
    ) -> Connection {
        let mut conn = Connection::new(
            Side::Client,
            config,
            oracle,
            local_cid,
            remote_cid,
            remote_cid,
            log,
        );

        conn.pump_oracle(now);
        logging::debug!(conn.log, "client connection created";
                        "local_cid" => %conn.local_cid,
                        "remote_cid" => %conn.remote_cid);
        conn
    }

    pub fn new_server<'a, L: Into<Option<&'a logging::Logger>>>(
        config: TransportConfig,
        oracle: Box<dyn HandshakeOracle>,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        original_dcid: ConnectionId,
        now: Instant,
        log: L,
    ) -> Connection {
        let mut conn = Connection::new(
            Side::Server,
            config,
            oracle,
            local_cid,
            remote_cid,
            original_dcid,
            log,
        );

        conn.pump_oracle(now);
        logging::debug!(conn.log, "server connection created";
                        "local_cid" => %conn.local_cid,
                        "remote_cid" => %conn.remote_cid,
                        "original_dcid" => %conn.original_dcid);
        conn
    }

    fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        side: Side,
        config: TransportConfig,
        oracle: Box<dyn HandshakeOracle>,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        original_dcid: ConnectionId,
        log: L,
    ) -> Connection {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let streams = StreamMap::new(side, config.stream_config());
        let recovery = LossDetection::new(
            config.packet_threshold,
            config.time_threshold,
            config.initial_rtt(),
            config.max_ack_delay(),
        );
        let congestion = NewReno::new(u64::from(config.max_datagram_size));
        let idle_timeout = config.idle_timeout();

        Connection {
            side,
            state: State::Handshaking,
            version: crate::QUIC_VERSION,
            local_cid,
            remote_cid,
            original_dcid,
            remote_cids: HashMap::new(),
            peer_reset_tokens: Vec::new(),
            retry_token: None,
            contexts: [
                CryptoContext::new(Level::Initial),
                CryptoContext::new(Level::ZeroRtt),
                CryptoContext::new(Level::Handshake),
                CryptoContext::new(Level::OneRtt),
            ],
            oracle,
            params_peer: None,
            streams,
            recovery,
            congestion,
            config,
            control: Default::default(),
            path_response: None,
            probes_pending: [0; LEVEL_COUNT],
            first_flight: Vec::new(),
            idle_timeout,
            idle_deadline: None,
            events: VecDeque::new(),
            dropped_packets: 0,
            log,
        }
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.side
    }

    #[inline]
    pub fn local_cid(&self) -> &ConnectionId {
        &self.local_cid
    }

    #[inline]
    pub fn remote_cid(&self) -> &ConnectionId {
        &self.remote_cid
    }

    #[inline]
    pub fn original_dcid(&self) -> &ConnectionId {
        &self.original_dcid
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(
            self.state,
            State::Closing { .. } | State::Draining { .. } | State::Dead
        )
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        matches!(self.state, State::Dead)
    }

    /// Packets dropped without processing: undecryptable, malformed, or
    /// duplicates.
    #[inline]
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    #[inline]
    pub fn poll_event(&mut self) -> Option<ConnEvent> {
        self.events.pop_front()
    }

    // ---- ingress ---------------------------------------------------------

    /// Feeds one received datagram, walking every coalesced packet in order.
    pub fn handle_datagram(&mut self, now: Instant, datagram: &[u8]) {
        if self.is_dead() {
            return;
        }

        if let State::Draining { .. } = self.state {
            // Drain absorbs everything silently
            return;
        }

        let mut offset = 0;
        while offset < datagram.len() {
            let mut buf = datagram[offset..].to_vec();

            match self.process_packet(now, &mut buf) {
                Ok(consumed) => {
                    offset += consumed;
                }
                Err(TransportError::Wait) => {
                    // Unparseable remainder: drop the rest of the datagram
                    self.dropped_packets += 1;
                    self.check_stateless_reset(datagram);
                    return;
                }
                Err(TransportError::Fatal(code, reason)) => {
                    logging::warn!(self.log, "protocol error";
                                   "code" => ?code,
                                   "reason" => &reason);
                    self.fatal_close(now, code, &reason);
                    return;
                }
            }

            if self.is_closed() {
                return;
            }
        }
    }

    /// Processes one packet at the front of `buf`; returns the bytes it
    /// occupied.
    fn process_packet(&mut self, now: Instant, buf: &mut [u8]) -> TransportResult<usize> {
        let probe = packet::probe(buf, self.local_cid.len())?;

        if probe.is_version_negotiation {
            self.on_version_negotiation(now, buf)?;
            return Ok(buf.len());
        }

        if probe.ty == Some(LongType::Retry) {
            self.on_retry(now, buf, &probe);
            return Ok(probe.packet_len);
        }

        if probe.is_long && probe.version != self.version {
            self.dropped_packets += 1;
            return Ok(probe.packet_len);
        }

        let level = match probe.ty {
            Some(ty) => Level::from_long_type(ty).expect("retry handled above"),
            None => Level::OneRtt,
        };

        if !self.contexts[level.index()].has_keys() {
            logging::trace!(self.log, "buffering packet for missing keys"; "level" => ?level);
            self.contexts[level.index()].buffer_undecrypted(buf[..probe.packet_len].to_vec());
            return Ok(probe.packet_len);
        }

        let expected = self.contexts[level.index()].space.expected();
        let keys = self.contexts[level.index()]
            .keys()
            .expect("keys checked above")
            .recv
            .clone();

        let packet = match packet::open(&mut buf[..probe.packet_len], &probe, expected, &keys) {
            Ok(packet) => packet,
            Err(TransportError::Wait) => {
                self.dropped_packets += 1;
                if !probe.is_long {
                    // An undecryptable short-header datagram may be a
                    // stateless reset
                    self.check_stateless_reset(&buf[..probe.packet_len]);
                }
                return Ok(probe.packet_len);
            }
            Err(fatal) => return Err(fatal),
        };

        // Anything arriving while closing just evokes another close packet
        if let State::Closing {
            send_pending,
            last_sent,
            ..
        } = &mut self.state
        {
            let due = last_sent
                .map_or(true, |at| now.duration_since(at) >= Self::CLOSE_RESEND_INTERVAL);
            if due {
                *send_pending = true;
            }
            return Ok(probe.packet_len);
        }

        // The first long-header reply fixes the peer's chosen connection ID
        if self.side.is_client() && matches!(self.state, State::Handshaking) {
            if let Some(scid) = probe.scid {
                if scid != self.remote_cid {
                    logging::debug!(self.log, "adopting peer connection ID"; "scid" => %scid);
                    self.remote_cid = scid;
                }
            }
        }

        let ack_eliciting = packet.frames.iter().any(Frame::is_ack_eliciting);
        if !self.contexts[level.index()]
            .space
            .on_received(packet.pn, ack_eliciting, now)
        {
            // Duplicate packet number
            self.dropped_packets += 1;
            return Ok(probe.packet_len);
        }

        logging::trace!(self.log, "packet received";
                        "level" => ?level,
                        "pn" => packet.pn,
                        "frames" => packet.frames.len(),
                        "ack_eliciting" => ack_eliciting);

        self.arm_idle(now);

        for frame in packet.frames {
            self.dispatch_frame(now, level, frame)?;
            if self.is_closed() {
                return Ok(probe.packet_len);
            }
        }

        self.pump_oracle(now);
        self.replay_buffered(now)?;

        Ok(probe.packet_len)
    }

    /// Applies one decoded frame to the connection state, in wire order.
    fn dispatch_frame(&mut self, now: Instant, level: Level, frame: Frame) -> TransportResult<()> {
        match frame {
            Frame::Padding(_) | Frame::Ping => {}
            Frame::Ack(ack) => self.on_ack(now, level, ack)?,
            Frame::AckEcn { ack, ecn } => {
                if let Some(counts) = ecn {
                    logging::trace!(self.log, "ecn counts";
                                    "ect0" => counts.ect0,
                                    "ect1" => counts.ect1,
                                    "ce" => counts.ce);
                }
                self.on_ack(now, level, ack)?;
            }
            Frame::Crypto { offset, data } => {
                self.contexts[level.index()].stream.recv_insert(offset, &data)?;
            }
            Frame::Stream(stream_frame) => {
                if level != Level::OneRtt && level != Level::ZeroRtt {
                    return Err(
                        ErrorCode::ProtocolViolation.with("stream data at a handshake level")
                    );
                }
                let id = StreamId::from_value(stream_frame.stream_id);
                if self.streams.on_stream_frame(&stream_frame)? {
                    self.events.push_back(ConnEvent::StreamReadable(id));
                }
            }
            Frame::RstStream {
                stream_id,
                error_code,
                final_offset,
            } => {
                self.streams.on_rst_stream(stream_id, error_code, final_offset)?;
                self.events
                    .push_back(ConnEvent::StreamReadable(StreamId::from_value(stream_id)));
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => self.streams.on_stop_sending(stream_id, error_code)?,
            Frame::MaxData { maximum } => self.streams.on_max_data(maximum),
            Frame::MaxStreamData { stream_id, maximum } => {
                self.streams.on_max_stream_data(stream_id, maximum)?;
            }
            Frame::MaxStreamId { stream_id } => self.streams.on_max_stream_id(stream_id),
            Frame::Blocked { offset } => {
                logging::debug!(self.log, "peer blocked on connection window"; "offset" => offset);
            }
            Frame::StreamBlocked { stream_id, offset } => {
                logging::debug!(self.log, "peer blocked on stream window";
                                "stream_id" => stream_id,
                                "offset" => offset);
            }
            Frame::StreamIdBlocked { stream_id } => {
                logging::debug!(self.log, "peer blocked on stream limit"; "stream_id" => stream_id);
            }
            Frame::NewConnectionId {
                sequence,
                cid,
                reset_token,
            } => {
                if let Some((known_cid, _)) = self.remote_cids.get(&sequence) {
                    if *known_cid != cid {
                        return Err(ErrorCode::ProtocolViolation
                            .with("connection ID sequence reused with a different ID"));
                    }
                } else {
                    self.remote_cids.insert(sequence, (cid, reset_token));
                    self.peer_reset_tokens.push(reset_token);
                }
            }
            Frame::PathChallenge(data) => {
                self.path_response = Some(data);
            }
            Frame::PathResponse(data) => {
                logging::debug!(self.log, "path response"; "data" => ?data);
            }
            Frame::ConnectionClose { error_code, reason } => {
                self.on_peer_close(now, error_code, reason, false);
            }
            Frame::ApplicationClose { error_code, reason } => {
                self.on_peer_close(now, error_code, reason, true);
            }
        }

        Ok(())
    }

    fn on_ack(&mut self, now: Instant, level: Level, ack: AckFrame) -> TransportResult<()> {
        let ranges = self.contexts[level.index()].space.on_ack_received(&ack)?;

        let exponent = self
            .params_peer
            .as_ref()
            .map_or(3, |params| params.ack_delay_exponent);
        let delay_micros = ack
            .delay
            .checked_shl(u32::from(exponent))
            .unwrap_or(u64::max_value());
        let ack_delay = Duration::from_micros(delay_micros);

        let outcome = self
            .recovery
            .on_ack_received(level, ack.largest, &ranges, ack_delay, now);

        for acked in &outcome.newly_acked {
            self.congestion.on_packet_acked(level, acked);
            for frame in &acked.frames {
                match frame {
                    Frame::Stream(stream_frame) => self.streams.stream_acked(
                        stream_frame.stream_id,
                        stream_frame.offset,
                        stream_frame.data.len(),
                        stream_frame.fin,
                    ),
                    Frame::RstStream { stream_id, .. } => self.streams.rst_acked(*stream_id),
                    _ => {}
                }
            }
        }

        if !outcome.lost.is_empty() {
            self.recycle_lost(level, outcome.lost);
        }

        Ok(())
    }

    /// Returns lost frames to their sources so they ride a fresh packet
    /// number: stream data to its stream, crypto data to its level, control
    /// frames to the resend queue. Padding and ACKs are regenerated, not
    /// recycled.
    fn recycle_lost(&mut self, level: Level, lost: Vec<SentPacket>) {
        logging::debug!(self.log, "packets lost";
                        "level" => ?level,
                        "count" => lost.len());

        self.congestion.on_packets_lost(level, &lost);

        for packet in lost {
            for frame in packet.frames {
                match frame {
                    Frame::Padding(_)
                    | Frame::Ack(_)
                    | Frame::AckEcn { .. }
                    | Frame::ConnectionClose { .. }
                    | Frame::ApplicationClose { .. } => {}
                    Frame::Stream(stream_frame) => self.streams.stream_lost(
                        stream_frame.stream_id,
                        stream_frame.offset,
                        stream_frame.data,
                        stream_frame.fin,
                    ),
                    Frame::Crypto { offset, data } => {
                        self.contexts[level.index()].stream.on_lost(offset, data);
                    }
                    other => self.control[level.index()].push(other),
                }
            }
        }
    }

    /// Runs the handshake oracle until it stops making progress: delivers
    /// contiguous CRYPTO bytes, installs freshly derived keys, queues
    /// produced bytes, and applies the peer's transport parameters.
    fn pump_oracle(&mut self, now: Instant) {
        loop {
            let mut progressed = false;

            for level in &Level::ALL {
                let data = self.contexts[level.index()].stream.pop_recv();
                if !data.is_empty() {
                    if let Err(error) = self.oracle.accept(*level, &data) {
                        let (code, reason) = match error {
                            TransportError::Fatal(code, reason) => (code, reason),
                            TransportError::Wait => {
                                (ErrorCode::InternalError, "handshake stalled".to_string())
                            }
                        };
                        self.fatal_close(now, code, &reason);
                        return;
                    }
                    progressed = true;
                }
            }

            while let Some((level, keys)) = self.oracle.poll_keys() {
                logging::debug!(self.log, "keys installed"; "level" => ?level);
                self.contexts[level.index()].install_keys(keys);
                progressed = true;
            }

            for level in &Level::ALL {
                while let Some(data) = self.oracle.produce(*level) {
                    if *level == Level::Initial && matches!(self.state, State::Handshaking) {
                        self.first_flight.extend_from_slice(&data);
                    }
                    self.contexts[level.index()].stream.queue_send(data);
                    progressed = true;
                }
            }

            if let Some(raw) = self.oracle.peer_parameters() {
                match self.apply_peer_parameters(&raw) {
                    Ok(()) => progressed = true,
                    Err(TransportError::Fatal(code, reason)) => {
                        self.fatal_close(now, code, &reason);
                        return;
                    }
                    Err(TransportError::Wait) => {}
                }
            }

            if self.oracle.is_established() && matches!(self.state, State::Handshaking) {
                logging::info!(self.log, "handshake complete";
                               "local_cid" => %self.local_cid,
                               "remote_cid" => %self.remote_cid);
                self.state = State::Established;
                self.events.push_back(ConnEvent::HandshakeComplete);
                progressed = true;
            }

            if !progressed {
                return;
            }
        }
    }

    fn apply_peer_parameters(&mut self, raw: &[u8]) -> TransportResult<()> {
        let params = TransportParameters::decode(
            &mut std::io::Cursor::new(raw),
            self.side.peer(),
        )?;

        self.streams.apply_peer_params(
            u64::from(params.initial_max_data),
            u64::from(params.initial_max_stream_data_bidi_remote),
            u64::from(params.initial_max_stream_data_bidi_local),
            u64::from(params.initial_max_stream_data_uni),
            u64::from(params.initial_max_bidi_streams),
            u64::from(params.initial_max_uni_streams),
        );

        self.recovery
            .set_max_ack_delay(Duration::from_millis(u64::from(params.max_ack_delay)));

        // The effective idle timeout is the stricter of the two
        if params.idle_timeout > 0 {
            let peer = Duration::from_secs(u64::from(params.idle_timeout));
            self.idle_timeout = Some(self.idle_timeout.map_or(peer, |local| local.min(peer)));
        }

        if let Some(token) = params.stateless_reset_token {
            self.peer_reset_tokens.push(token);
        }

        logging::debug!(self.log, "peer transport parameters applied";
                        "max_data" => params.initial_max_data,
                        "idle_timeout" => params.idle_timeout);
        self.params_peer = Some(params);

        Ok(())
    }

    /// Replays packets that were parked while their level's keys were
    /// missing.
    fn replay_buffered(&mut self, now: Instant) -> TransportResult<()> {
        for index in 0..LEVEL_COUNT {
            if !self.contexts[index].has_keys() {
                continue;
            }

            let parked = self.contexts[index].take_undecrypted();

            for mut datagram in parked {
                self.process_packet(now, &mut datagram)?;
                if self.is_closed() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Client handling of a version negotiation packet: pick a mutual
    /// version and restart the Initial exchange from packet number zero.
    fn on_version_negotiation(&mut self, now: Instant, buf: &[u8]) -> TransportResult<()> {
        if self.side.is_server() || !matches!(self.state, State::Handshaking) {
            self.dropped_packets += 1;
            return Ok(());
        }

        if self.contexts[Level::Initial.index()]
            .space
            .largest_acked()
            .is_some()
        {
            // The peer already proved it speaks our version
            self.dropped_packets += 1;
            return Ok(());
        }

        let header = Header::decode(&mut std::io::Cursor::new(buf), self.local_cid.len())
            .map_err(|_| TransportError::Wait)?;
        let versions = match header {
            Header::VersionNegotiation { versions, .. } => versions,
            _ => return Err(TransportError::Wait),
        };

        let chosen = crate::SUPPORTED_VERSIONS
            .iter()
            .find(|version| versions.contains(version));

        let chosen = match chosen {
            Some(version) => *version,
            None => {
                return Err(ErrorCode::VersionNegotiationError
                    .with("no mutually supported version"));
            }
        };

        logging::info!(self.log, "version negotiated"; "version" => format!("{:#x}", chosen));
        self.version = chosen;
        self.restart_initial(now);

        Ok(())
    }

    /// Client handling of a Retry packet: adopt the server's CID, remember
    /// the token and resend the first flight.
    fn on_retry(&mut self, now: Instant, buf: &[u8], probe: &Probe) {
        if self.side.is_server()
            || !matches!(self.state, State::Handshaking)
            || self.retry_token.is_some()
        {
            self.dropped_packets += 1;
            return;
        }

        let (odcid, token) = match packet::parse_retry(buf, probe) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.dropped_packets += 1;
                return;
            }
        };

        if odcid != self.original_dcid {
            self.dropped_packets += 1;
            return;
        }

        let new_remote = probe.scid.expect("long headers carry a source CID");
        logging::info!(self.log, "retry received";
                       "new_remote_cid" => %new_remote,
                       "token_len" => token.len());

        self.remote_cid = new_remote;
        self.retry_token = Some(token);
        self.restart_initial(now);
    }

    /// Rebuilds the Initial context so the exchange restarts at packet
    /// number zero with the same handshake bytes.
    fn restart_initial(&mut self, _now: Instant) {
        let keys = self.contexts[Level::Initial.index()].keys().cloned();

        let mut fresh = CryptoContext::new(Level::Initial);
        if let Some(keys) = keys {
            fresh.install_keys(keys);
        }
        fresh.stream.queue_send(self.first_flight.clone());

        self.contexts[Level::Initial.index()] = fresh;
        self.recovery.discard(Level::Initial);
    }

    /// Exposed for the server's version-negotiation path: the next Initial
    /// from the client starts over at packet number zero.
    pub fn reset_initial_receive_state(&mut self) {
        self.contexts[Level::Initial.index()]
            .space
            .reset_receive_state();
    }

    /// A datagram ending in one of the peer's advertised reset tokens kills
    /// the connection without a packet exchange.
    fn check_stateless_reset(&mut self, datagram: &[u8]) {
        if datagram.len() < RESET_TOKEN_SIZE {
            return;
        }

        let tail = &datagram[datagram.len() - RESET_TOKEN_SIZE..];
        if self
            .peer_reset_tokens
            .iter()
            .any(|token| &token[..] == tail)
        {
            logging::info!(self.log, "stateless reset received");
            self.events.push_back(ConnEvent::ConnectionLost {
                error_code: ErrorCode::NoError.wire(),
                reason: "stateless reset".to_string(),
                by_peer: true,
            });
            self.events.push_back(ConnEvent::Closed);
            self.state = State::Dead;
        }
    }

    // ---- close lifecycle -------------------------------------------------

    fn on_peer_close(&mut self, now: Instant, error_code: u16, reason: String, app: bool) {
        logging::info!(self.log, "peer closed connection";
                       "code" => error_code,
                       "reason" => &reason,
                       "application" => app);

        self.events.push_back(ConnEvent::ConnectionLost {
            error_code,
            reason,
            by_peer: true,
        });

        // One close packet is owed in response, then silence
        self.state = State::Draining {
            until: now + self.drain_period(),
            echo: Some(Frame::ConnectionClose {
                error_code: ErrorCode::NoError.wire(),
                reason: String::new(),
            }),
        };
    }

    /// Application-initiated close.
    pub fn close(&mut self, now: Instant, error_code: u16, reason: &str) {
        if self.is_closed() {
            return;
        }

        self.enter_closing(
            now,
            Frame::ApplicationClose {
                error_code,
                reason: reason.to_string(),
            },
        );

        self.events.push_back(ConnEvent::ConnectionLost {
            error_code,
            reason: reason.to_string(),
            by_peer: false,
        });
    }

    /// Transport-level fatal close.
    fn fatal_close(&mut self, now: Instant, code: ErrorCode, reason: &str) {
        if self.is_closed() {
            return;
        }

        self.enter_closing(
            now,
            Frame::ConnectionClose {
                error_code: code.wire(),
                reason: reason.to_string(),
            },
        );

        self.events.push_back(ConnEvent::ConnectionLost {
            error_code: code.wire(),
            reason: reason.to_string(),
            by_peer: false,
        });
    }

    fn enter_closing(&mut self, now: Instant, frame: Frame) {
        logging::info!(self.log, "closing connection"; "frame" => ?frame);

        self.state = State::Closing {
            frame,
            until: now + self.drain_period(),
            send_pending: true,
            last_sent: None,
        };
        self.idle_deadline = None;
    }

    fn drain_period(&self) -> Duration {
        self.recovery.pto_interval() * 3
    }

    fn arm_idle(&mut self, now: Instant) {
        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(now + timeout);
        }
    }

    // ---- timers ----------------------------------------------------------

    /// The next instant at which `on_timeout` wants to run.
    pub fn next_timeout(&self) -> Option<Instant> {
        match &self.state {
            State::Dead => None,
            State::Closing { until, .. } | State::Draining { until, .. } => Some(*until),
            _ => {
                let loss = self.recovery.next_timeout().map(|(deadline, _)| deadline);
                match (loss, self.idle_deadline) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) => Some(a),
                    (None, b) => b,
                }
            }
        }
    }

    /// Drives expired timers: the drain clock, the idle clock, and loss
    /// detection.
    pub fn on_timeout(&mut self, now: Instant) {
        match &self.state {
            State::Dead => return,
            State::Closing { until, .. } | State::Draining { until, .. } => {
                if now >= *until {
                    logging::debug!(self.log, "drain period elapsed");
                    self.state = State::Dead;
                    self.events.push_back(ConnEvent::Closed);
                }
                return;
            }
            _ => {}
        }

        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                logging::info!(self.log, "idle timeout");
                self.fatal_close(now, ErrorCode::NoError, "idle timeout");
                return;
            }
        }

        match self.recovery.on_timeout(now) {
            TimeoutOutcome::Lost(level, lost) => {
                if !lost.is_empty() {
                    self.recycle_lost(level, lost);
                }
            }
            TimeoutOutcome::Probe(level, probes) => {
                logging::debug!(self.log, "probe timeout";
                                "level" => ?level,
                                "probes" => probes,
                                "pto_count" => self.recovery.pto_count());
                self.probes_pending[level.index()] += probes;

                // Two consecutive expiries count as a verified timeout
                if self.recovery.pto_count() >= 2 {
                    self.congestion.on_rto_verified();
                }
            }
            TimeoutOutcome::Idle => {}
        }
    }

    // ---- egress ----------------------------------------------------------

    /// Assembles at most one datagram into `out`, coalescing packets from
    /// multiple levels. Returns zero when there is nothing to send.
    pub fn poll_transmit(&mut self, now: Instant, out: &mut [u8]) -> usize {
        match &self.state {
            State::Dead => return 0,
            State::Closing { .. } | State::Draining { .. } => {
                return self.poll_close_transmit(now, out);
            }
            _ => {}
        }

        let budget = self.datagram_budget(out.len());
        let mut written = 0;

        for level in &[Level::Initial, Level::Handshake, Level::OneRtt] {
            if written + PACKET_OVERHEAD >= budget {
                break;
            }
            if !self.contexts[level.index()].has_keys() {
                continue;
            }

            let frames = self.collect_frames(*level, budget - written, now);
            if frames.is_empty() {
                continue;
            }

            match self.seal_packet(now, *level, &frames, &mut out[written..budget]) {
                Some(len) => written += len,
                None => break,
            }
        }

        written
    }

    fn datagram_budget(&self, available: usize) -> usize {
        let mut budget = available.min(usize::from(self.config.max_datagram_size));
        if let Some(params) = &self.params_peer {
            budget = budget.min(usize::from(params.max_packet_size));
        }
        budget
    }

    /// Gathers the frames one packet at this level should carry, within
    /// `space_left` bytes of datagram budget.
    fn collect_frames(&mut self, level: Level, space_left: usize, now: Instant) -> Vec<Frame> {
        let mut budget = space_left.saturating_sub(PACKET_OVERHEAD);
        let mut frames = Vec::new();

        let index = level.index();

        let probing = self.probes_pending[index] > 0;

        // An ACK rides at the front of the packet when it fits; the pending
        // flag stays set until a frame actually goes out. A probing level
        // keeps one byte of headroom so the ACK cannot crowd out the Ping.
        if self.contexts[index].space.ack_pending() {
            if let Some(ack) = self.contexts[index]
                .space
                .build_ack_frame(now, self.config.ack_delay_exponent)
            {
                let frame = Frame::Ack(ack);
                let headroom = if probing { 1 } else { 0 };
                if frame.wire_size() + headroom <= budget {
                    budget -= frame.wire_size();
                    self.contexts[index].space.clear_ack_pending();
                    frames.push(frame);
                }
            }
        }

        // The congestion gate holds back everything but ACKs and probes
        if !self.congestion.can_send() && !probing {
            return frames;
        }

        // Handshake payload
        while budget > 12 && self.contexts[index].stream.wants_transmit() {
            let head_room = budget - 12;
            if let Some((offset, data)) = self.contexts[index].stream.pop_chunk(head_room) {
                let frame = Frame::Crypto { offset, data };
                budget = budget.saturating_sub(frame.wire_size());
                frames.push(frame);
            } else {
                break;
            }
        }

        // Level-bound control frames queued for retransmission
        while let Some(frame) = self.control[index].last() {
            if frame.wire_size() > budget {
                break;
            }
            let frame = self.control[index].pop().unwrap();
            budget -= frame.wire_size();
            frames.push(frame);
        }

        if level == Level::OneRtt {
            if let Some(data) = self.path_response.take() {
                let frame = Frame::PathResponse(data);
                if frame.wire_size() <= budget {
                    budget -= frame.wire_size();
                    frames.push(frame);
                } else {
                    self.path_response = Some(data);
                }
            }

            let mut control = Vec::new();
            self.streams.poll_control(&mut control);
            for frame in control {
                if frame.wire_size() <= budget {
                    budget -= frame.wire_size();
                    frames.push(frame);
                } else {
                    self.control[index].push(frame);
                }
            }

            if self.is_established() {
                let before = frames.len();
                self.streams.fill_stream_frames(budget, &mut frames);
                for frame in &frames[before..] {
                    budget = budget.saturating_sub(frame.wire_size());
                }
            }
        }

        // A probe must carry something ack-eliciting
        if probing {
            if !frames.iter().any(Frame::is_ack_eliciting) && budget >= 1 {
                frames.push(Frame::Ping);
            }
            if frames.iter().any(Frame::is_ack_eliciting) {
                self.probes_pending[index] -= 1;
            }
        }

        // A client's Initial flight must fill the minimum datagram
        if level == Level::Initial
            && self.side.is_client()
            && frames.iter().any(Frame::is_ack_eliciting)
        {
            // Padding the payload to the full minimum keeps the datagram
            // over the floor regardless of header size
            let payload: usize = frames.iter().map(Frame::wire_size).sum();
            if payload < MIN_INITIAL_SIZE {
                frames.push(Frame::Padding(MIN_INITIAL_SIZE - payload));
            }
        }

        frames
    }

    /// Seals one packet and records it with recovery and congestion.
    fn seal_packet(
        &mut self,
        now: Instant,
        level: Level,
        frames: &[Frame],
        out: &mut [u8],
    ) -> Option<usize> {
        let index = level.index();

        let pn = self.contexts[index].space.next();
        let tpn = TruncatedPn::new(pn, self.contexts[index].space.largest_acked());

        let header = match level {
            Level::OneRtt => Header::Short {
                spin: false,
                key_phase: false,
                dcid: self.remote_cid,
                pn: tpn,
            },
            Level::Initial | Level::Handshake | Level::ZeroRtt => Header::Long {
                ty: match level {
                    Level::Initial => LongType::Initial,
                    Level::Handshake => LongType::Handshake,
                    _ => LongType::ZeroRtt,
                },
                version: self.version,
                dcid: self.remote_cid,
                scid: self.local_cid,
                payload_len: 0,
                pn: tpn,
            },
        };

        let keys = self.contexts[index].keys()?.send.clone();

        let len = match packet::seal(out, &header, pn, frames, &keys) {
            Ok(len) => len,
            Err(error) => {
                logging::error!(self.log, "packet seal failed";
                                "level" => ?level,
                                "error" => %error);
                return None;
            }
        };

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        let in_flight = frames
            .iter()
            .any(|frame| !matches!(frame, Frame::Ack(_) | Frame::AckEcn { .. }));

        logging::trace!(self.log, "packet sent";
                        "level" => ?level,
                        "pn" => pn,
                        "size" => len,
                        "ack_eliciting" => ack_eliciting);

        self.recovery.on_packet_sent(
            level,
            SentPacket {
                pn,
                time: now,
                size: len,
                ack_eliciting,
                in_flight,
                frames: frames.to_vec(),
            },
        );
        self.congestion.on_packet_sent(len, in_flight);

        Some(len)
    }

    /// Emits close packets: repeatedly while closing (rate limited), exactly
    /// once when draining in response to a peer close.
    fn poll_close_transmit(&mut self, now: Instant, out: &mut [u8]) -> usize {
        let frame = match &mut self.state {
            State::Closing {
                frame,
                send_pending,
                last_sent,
                ..
            } => {
                if !*send_pending {
                    return 0;
                }
                *send_pending = false;
                *last_sent = Some(now);
                frame.clone()
            }
            State::Draining { echo, .. } => match echo.take() {
                Some(frame) => frame,
                None => return 0,
            },
            _ => return 0,
        };

        // The close rides the highest level that has keys
        let level = [Level::OneRtt, Level::Handshake, Level::Initial]
            .iter()
            .cloned()
            .find(|level| self.contexts[level.index()].has_keys());

        let level = match level {
            Some(level) => level,
            None => return 0,
        };

        let budget = self.datagram_budget(out.len());
        self.seal_close_packet(level, &frame, &mut out[..budget])
    }

    fn seal_close_packet(&mut self, level: Level, frame: &Frame, out: &mut [u8]) -> usize {
        let index = level.index();
        let pn = self.contexts[index].space.next();
        let tpn = TruncatedPn::new(pn, self.contexts[index].space.largest_acked());

        let header = match level {
            Level::OneRtt => Header::Short {
                spin: false,
                key_phase: false,
                dcid: self.remote_cid,
                pn: tpn,
            },
            _ => Header::Long {
                ty: match level {
                    Level::Initial => LongType::Initial,
                    _ => LongType::Handshake,
                },
                version: self.version,
                dcid: self.remote_cid,
                scid: self.local_cid,
                payload_len: 0,
                pn: tpn,
            },
        };

        let keys = match self.contexts[index].keys() {
            Some(keys) => keys.send.clone(),
            None => return 0,
        };

        match packet::seal(out, &header, pn, &[frame.clone()], &keys) {
            Ok(len) => len,
            Err(_) => 0,
        }
    }

    // ---- application surface --------------------------------------------

    pub fn open_stream(&mut self, dir: Dir) -> TransportResult<StreamId> {
        self.streams.open(dir)
    }

    pub fn write_stream(&mut self, id: StreamId, data: &[u8]) -> TransportResult<usize> {
        self.streams.write(id, data)
    }

    pub fn read_stream(&mut self, id: StreamId) -> TransportResult<Vec<u8>> {
        self.streams.read(id)
    }

    pub fn finish_stream(&mut self, id: StreamId) -> TransportResult<()> {
        self.streams.finish(id)
    }

    pub fn reset_stream(&mut self, id: StreamId, error_code: u16) -> TransportResult<()> {
        self.streams.reset(id, error_code)
    }

    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.state(id)
    }
}
