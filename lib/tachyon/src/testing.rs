//! Deterministic test collaborators: a scripted handshake oracle with fixed
//! key schedules, and helpers for shuttling datagrams between two
//! connections in memory.

use crate::connection::Connection;
use crate::crypto::{DirectionalKeys, HandshakeOracle, Level, LevelKeys};
use crate::params::TransportParameters;
use crate::shared::{encode_to_vec, ErrorCode, Side, TransportResult};
use byteorder::{BigEndian, ByteOrder};
use photon::crypto::KEY_SIZE;
use std::collections::VecDeque;
use std::time::Instant;

const CHLO: &[u8; 4] = b"CHLO";
const SHLO: &[u8; 4] = b"SHLO";
const CFIN: &[u8; 4] = b"CFIN";

fn directional(level: Level, direction: u8) -> DirectionalKeys {
    let seed = 0x40 + level.index() as u8 * 4 + direction;
    DirectionalKeys {
        key: [seed; KEY_SIZE],
        hp: [seed ^ 0xff; KEY_SIZE],
    }
}

/// Both sides derive the same key material; one side's send keys are the
/// other side's receive keys.
pub(crate) fn test_keys(side: Side, level: Level) -> LevelKeys {
    let client_to_server = directional(level, 0);
    let server_to_client = directional(level, 1);

    match side {
        Side::Client => LevelKeys {
            send: client_to_server,
            recv: server_to_client,
        },
        Side::Server => LevelKeys {
            send: server_to_client,
            recv: client_to_server,
        },
    }
}

fn message(magic: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + body.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// A scripted TLS stand-in. The client opens with CHLO carrying its raw
/// transport parameters; the server answers with SHLO carrying its own and
/// both sides derive handshake and one-RTT keys; CFIN completes the server.
pub(crate) struct TestOracle {
    side: Side,
    params: Vec<u8>,
    peer_params: Option<Vec<u8>>,
    outbound: [VecDeque<Vec<u8>>; 4],
    keys_out: VecDeque<(Level, LevelKeys)>,
    inbound: [Vec<u8>; 4],
    established: bool,
}

impl TestOracle {
    pub fn client(params: &TransportParameters) -> TestOracle {
        let mut oracle = TestOracle::new(Side::Client, params);
        oracle
            .keys_out
            .push_back((Level::Initial, test_keys(Side::Client, Level::Initial)));

        let hello = message(CHLO, &oracle.params);
        oracle.outbound[Level::Initial.index()].push_back(hello);
        oracle
    }

    pub fn server(params: &TransportParameters) -> TestOracle {
        let mut oracle = TestOracle::new(Side::Server, params);
        oracle
            .keys_out
            .push_back((Level::Initial, test_keys(Side::Server, Level::Initial)));
        oracle
    }

    fn new(side: Side, params: &TransportParameters) -> TestOracle {
        TestOracle {
            side,
            params: encode_to_vec(params),
            peer_params: None,
            outbound: Default::default(),
            keys_out: VecDeque::new(),
            inbound: Default::default(),
            established: false,
        }
    }

    fn on_message(&mut self, magic: [u8; 4], body: Vec<u8>) -> TransportResult<()> {
        match (&magic[..], self.side) {
            (b"CHLO", Side::Server) => {
                self.peer_params = Some(body);

                let reply = message(SHLO, &self.params);
                self.outbound[Level::Initial.index()].push_back(reply);

                self.keys_out
                    .push_back((Level::Handshake, test_keys(Side::Server, Level::Handshake)));
                self.keys_out
                    .push_back((Level::OneRtt, test_keys(Side::Server, Level::OneRtt)));
            }
            (b"SHLO", Side::Client) => {
                self.peer_params = Some(body);

                self.keys_out
                    .push_back((Level::Handshake, test_keys(Side::Client, Level::Handshake)));
                self.keys_out
                    .push_back((Level::OneRtt, test_keys(Side::Client, Level::OneRtt)));

                self.outbound[Level::Handshake.index()].push_back(message(CFIN, &[]));
                self.established = true;
            }
            (b"CFIN", Side::Server) => {
                self.established = true;
            }
            _ => {
                return Err(ErrorCode::ProtocolViolation.with("unexpected handshake message"));
            }
        }

        Ok(())
    }
}

impl HandshakeOracle for TestOracle {
    fn accept(&mut self, level: Level, data: &[u8]) -> TransportResult<()> {
        self.inbound[level.index()].extend_from_slice(data);

        loop {
            let buffer = &self.inbound[level.index()];
            if buffer.len() < 6 {
                return Ok(());
            }

            let body_len = BigEndian::read_u16(&buffer[4..6]) as usize;
            if buffer.len() < 6 + body_len {
                return Ok(());
            }

            let mut magic = [0u8; 4];
            magic.copy_from_slice(&buffer[..4]);
            let body = buffer[6..6 + body_len].to_vec();
            self.inbound[level.index()].drain(..6 + body_len);

            self.on_message(magic, body)?;
        }
    }

    fn produce(&mut self, level: Level) -> Option<Vec<u8>> {
        self.outbound[level.index()].pop_front()
    }

    fn poll_keys(&mut self) -> Option<(Level, LevelKeys)> {
        self.keys_out.pop_front()
    }

    fn peer_parameters(&mut self) -> Option<Vec<u8>> {
        self.peer_params.take()
    }

    fn is_established(&self) -> bool {
        self.established
    }
}

/// Carries datagrams between two connections until both go quiet. Returns
/// the number of datagrams moved.
pub(crate) fn shuttle(now: Instant, left: &mut Connection, right: &mut Connection) -> usize {
    let mut moved = 0;
    let mut buf = [0u8; 4096];

    loop {
        let mut progressed = false;

        loop {
            let len = left.poll_transmit(now, &mut buf);
            if len == 0 {
                break;
            }
            right.handle_datagram(now, &buf[..len]);
            moved += 1;
            progressed = true;
        }

        loop {
            let len = right.poll_transmit(now, &mut buf);
            if len == 0 {
                break;
            }
            left.handle_datagram(now, &buf[..len]);
            moved += 1;
            progressed = true;
        }

        if !progressed {
            return moved;
        }
    }
}
