//! The endpoint: datagram demux by destination connection ID, server-side
//! connection acceptance, version negotiation replies, and the non-blocking
//! UDP driver. All connections run on the thread that owns the socket.

use crate::config::{EndpointConfig, TransportConfig};
use crate::connection::{ConnEvent, Connection};
use crate::crypto::HandshakeOracle;
use crate::shared::{Side, TransportResult};
use crate::wire::cid::ConnectionId;
use crate::wire::header::LongType;
use crate::wire::packet::{self, MIN_INITIAL_SIZE};
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use photon::logging;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub type ConnectionHandle = usize;

/// Mints a handshake oracle for every connection this endpoint creates.
pub type OracleFactory = Box<dyn Fn(Side) -> Box<dyn HandshakeOracle>>;

/// Describes a change in the set of connections managed by the endpoint.
#[derive(Debug, Clone)]
pub enum ConnectionChange {
    /// Handshake finished; the connection is usable.
    Connected(ConnectionHandle),
    /// A connection-level event other than the lifecycle edges.
    Event(ConnectionHandle, ConnEvent),
    /// The connection is gone and its handle recycled.
    Disconnected(ConnectionHandle),
}

pub struct Endpoint {
    socket: UdpSocket,
    poll: Poll,
    events: Events,

    config: EndpointConfig,
    transport: TransportConfig,
    oracles: OracleFactory,

    connections: Vec<Option<Connection>>,
    free: Vec<ConnectionHandle>,
    live: IndexSet<ConnectionHandle>,
    cid_table: HashMap<ConnectionId, ConnectionHandle>,
    peers: HashMap<ConnectionHandle, SocketAddr>,

    changes: Vec<ConnectionChange>,
    /// Raw replies (version negotiation) awaiting the next flush.
    pending_raw: Vec<(SocketAddr, Vec<u8>)>,

    dropped_datagrams: u64,
    recv_buf: Box<[u8]>,
    send_buf: Box<[u8]>,

    log: logging::Logger,
}

impl Endpoint {
    const SOCKET_TOKEN: Token = Token(0);
    const ZERO_TIME: Duration = Duration::from_millis(0);

    /// Binds the endpoint to `address` in `<ip>:<port>` format.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        address: &str,
        config: EndpointConfig,
        transport: TransportConfig,
        oracles: OracleFactory,
        log: L,
    ) -> TransportResult<Endpoint> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let address: SocketAddr = address
            .parse()
            .map_err(|_| crate::shared::ErrorCode::InternalError.with("unparseable address"))?;

        let mut socket = UdpSocket::bind(address)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, Self::SOCKET_TOKEN, Interest::READABLE)?;

        logging::info!(log, "endpoint bound"; "address" => %address);

        Ok(Endpoint {
            socket,
            poll,
            events: Events::with_capacity(1024),
            config,
            transport,
            oracles,
            connections: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            cid_table: HashMap::new(),
            peers: HashMap::new(),
            changes: Vec::new(),
            pending_raw: Vec::new(),
            dropped_datagrams: 0,
            recv_buf: vec![0u8; 65536].into_boxed_slice(),
            send_buf: vec![0u8; 65536].into_boxed_slice(),
            log,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Datagrams that matched no connection and created none.
    #[inline]
    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped_datagrams
    }

    /// Initiates a client connection to `remote`.
    pub fn connect(&mut self, remote: SocketAddr, now: Instant) -> ConnectionHandle {
        let local_cid = self.mint_cid();
        // The first destination CID is unpredictable; the server replaces it
        let remote_cid = ConnectionId::random(8);

        let oracle = (self.oracles)(Side::Client);
        let connection = Connection::new_client(
            self.transport.clone(),
            oracle,
            local_cid,
            remote_cid,
            now,
            &self.log,
        );

        let handle = self.store(connection, remote);
        self.cid_table.insert(local_cid, handle);

        logging::info!(self.log, "connecting";
                       "handle" => handle,
                       "remote" => %remote,
                       "local_cid" => %local_cid);
        handle
    }

    #[inline]
    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(handle).and_then(Option::as_ref)
    }

    #[inline]
    pub fn connection_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.connections.get_mut(handle).and_then(Option::as_mut)
    }

    /// Drains all the changes accumulated since the last `sync`.
    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = ConnectionChange> + '_ {
        self.changes.drain(..)
    }

    /// One event-loop turn: reads every available datagram, fires due
    /// timers, flushes every connection's output, and reaps the dead.
    pub fn sync(&mut self, now: Instant) {
        self.poll
            .poll(&mut self.events, Some(Self::ZERO_TIME))
            .expect("Socket poll failed");

        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(received) => received,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "socket receive error"; "error" => %err);
                    break;
                }
            };

            let datagram = self.recv_buf[..len].to_vec();
            self.route(now, &datagram, from);
        }

        let live: Vec<ConnectionHandle> = self.live.iter().cloned().collect();
        for handle in live {
            if let Some(connection) = self.connections[handle].as_mut() {
                if connection
                    .next_timeout()
                    .map_or(false, |deadline| deadline <= now)
                {
                    connection.on_timeout(now);
                }
            }

            self.flush_connection(now, handle);
            self.pump_events(handle);
        }

        for (addr, datagram) in std::mem::replace(&mut self.pending_raw, Vec::new()) {
            self.send_raw(&datagram, addr);
        }

        self.reap();
    }

    /// Routes one datagram to its connection, or accepts / rejects it.
    fn route(&mut self, now: Instant, datagram: &[u8], from: SocketAddr) {
        let probe = match packet::probe(datagram, self.config.local_cid_len) {
            Ok(probe) => probe,
            Err(_) => {
                self.dropped_datagrams += 1;
                return;
            }
        };

        if let Some(&handle) = self.cid_table.get(&probe.dcid) {
            // An Initial with a version we do not speak gets a negotiation
            // reply, and the receive state forgets the old exchange
            if probe.ty == Some(LongType::Initial)
                && !self.config.supported_versions.contains(&probe.version)
            {
                self.send_version_negotiation(&probe, from);
                if let Some(connection) = self.connections[handle].as_mut() {
                    connection.reset_initial_receive_state();
                }
                return;
            }

            if let Some(connection) = self.connections[handle].as_mut() {
                connection.handle_datagram(now, datagram);
            }
            self.flush_connection(now, handle);
            self.pump_events(handle);
            return;
        }

        // Unknown destination: only a well-formed Initial creates state
        if probe.ty != Some(LongType::Initial) {
            logging::trace!(self.log, "dropping datagram for unknown connection";
                            "dcid" => %probe.dcid,
                            "long" => probe.is_long);
            self.dropped_datagrams += 1;
            return;
        }

        if !self.config.supported_versions.contains(&probe.version) {
            self.send_version_negotiation(&probe, from);
            return;
        }

        if datagram.len() < MIN_INITIAL_SIZE {
            logging::debug!(self.log, "undersized initial"; "len" => datagram.len());
            self.dropped_datagrams += 1;
            return;
        }

        self.accept(now, &probe, datagram, from);
    }

    fn accept(&mut self, now: Instant, probe: &packet::Probe, datagram: &[u8], from: SocketAddr) {
        let local_cid = self.mint_cid();
        let remote_cid = probe.scid.expect("long headers carry a source CID");

        let oracle = (self.oracles)(Side::Server);
        let connection = Connection::new_server(
            self.transport.clone(),
            oracle,
            local_cid,
            remote_cid,
            probe.dcid,
            now,
            &self.log,
        );

        let handle = self.store(connection, from);

        // The client addresses us by its chosen CID until it learns ours
        self.cid_table.insert(probe.dcid, handle);
        self.cid_table.insert(local_cid, handle);

        logging::info!(self.log, "connection accepted";
                       "handle" => handle,
                       "remote" => %from,
                       "original_dcid" => %probe.dcid,
                       "local_cid" => %local_cid);

        if let Some(connection) = self.connections[handle].as_mut() {
            connection.handle_datagram(now, datagram);
        }
        self.flush_connection(now, handle);
        self.pump_events(handle);
    }

    fn send_version_negotiation(&mut self, probe: &packet::Probe, from: SocketAddr) {
        let scid = match probe.scid {
            Some(scid) => scid,
            None => return,
        };

        logging::debug!(self.log, "version negotiation";
                        "offered" => format!("{:#x}", probe.version),
                        "peer" => %from);

        let reply = packet::version_negotiation(scid, probe.dcid, &self.config.supported_versions);
        self.pending_raw.push((from, reply));
    }

    fn flush_connection(&mut self, now: Instant, handle: ConnectionHandle) {
        let addr = match self.peers.get(&handle) {
            Some(addr) => *addr,
            None => return,
        };

        loop {
            let len = match self.connections[handle].as_mut() {
                Some(connection) => connection.poll_transmit(now, &mut self.send_buf),
                None => return,
            };

            if len == 0 {
                return;
            }

            let datagram = self.send_buf[..len].to_vec();
            self.send_raw(&datagram, addr);
        }
    }

    fn send_raw(&mut self, datagram: &[u8], addr: SocketAddr) {
        match self.socket.send_to(datagram, addr) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Datagrams are droppable by definition
                logging::debug!(self.log, "send would block"; "len" => datagram.len());
            }
            Err(err) => {
                logging::warn!(self.log, "socket send error"; "error" => %err);
            }
        }
    }

    fn pump_events(&mut self, handle: ConnectionHandle) {
        let connection = match self.connections[handle].as_mut() {
            Some(connection) => connection,
            None => return,
        };

        while let Some(event) = connection.poll_event() {
            match event {
                ConnEvent::HandshakeComplete => {
                    self.changes.push(ConnectionChange::Connected(handle));
                }
                ConnEvent::Closed => {
                    // Reaped in `reap`; the change is emitted there
                }
                other => self.changes.push(ConnectionChange::Event(handle, other)),
            }
        }
    }

    /// Releases every connection whose draining period has elapsed.
    fn reap(&mut self) {
        let dead: Vec<ConnectionHandle> = self
            .live
            .iter()
            .cloned()
            .filter(|&handle| {
                self.connections[handle]
                    .as_ref()
                    .map_or(true, Connection::is_dead)
            })
            .collect();

        for handle in dead {
            logging::info!(self.log, "connection reaped"; "handle" => handle);

            self.cid_table.retain(|_, &mut entry| entry != handle);
            self.peers.remove(&handle);
            self.live.remove(&handle);
            self.connections[handle] = None;
            self.free.push(handle);
            self.changes.push(ConnectionChange::Disconnected(handle));
        }
    }

    fn store(&mut self, connection: Connection, peer: SocketAddr) -> ConnectionHandle {
        let handle = match self.free.pop() {
            Some(handle) => {
                self.connections[handle] = Some(connection);
                handle
            }
            None => {
                self.connections.push(Some(connection));
                self.connections.len() - 1
            }
        };

        self.live.insert(handle);
        self.peers.insert(handle, peer);
        handle
    }

    fn mint_cid(&mut self) -> ConnectionId {
        loop {
            let cid = ConnectionId::random(self.config.local_cid_len);
            if !self.cid_table.contains_key(&cid) {
                return cid;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::encode_to_vec;
    use crate::streams::Dir;
    use crate::testing::TestOracle;
    use crate::wire::header::Header;
    use crate::wire::pnum::{PnLen, TruncatedPn};
    use std::net::UdpSocket as StdUdpSocket;
    use std::thread::sleep;

    fn factory() -> OracleFactory {
        Box::new(|side| {
            let params = TransportConfig::default().to_parameters(side, None, None);
            match side {
                Side::Client => Box::new(TestOracle::client(&params)),
                Side::Server => Box::new(TestOracle::server(&params)),
            }
        })
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(
            "127.0.0.1:0",
            EndpointConfig::default(),
            TransportConfig::default(),
            factory(),
            None,
        )
        .unwrap()
    }

    /// Runs both endpoints until the predicate holds or the round budget is
    /// exhausted, collecting every change along the way.
    fn drive<F: FnMut(&[ConnectionChange]) -> bool>(
        client: &mut Endpoint,
        server: &mut Endpoint,
        changes: &mut Vec<ConnectionChange>,
        mut done: F,
    ) {
        for _ in 0..400 {
            let now = Instant::now();
            client.sync(now);
            server.sync(now);

            changes.extend(client.changes());
            changes.extend(server.changes());

            if done(changes) {
                return;
            }
            sleep(Duration::from_millis(2));
        }
        panic!("Endpoints failed to make progress: {:?}", changes);
    }

    fn server_handle(changes: &[ConnectionChange]) -> Option<ConnectionHandle> {
        // The server's Connected change carries the accepted handle; the
        // client connects explicitly so its handle is already known
        changes.iter().rev().find_map(|change| match change {
            ConnectionChange::Connected(handle) => Some(*handle),
            _ => None,
        })
    }

    #[test]
    fn test_connect_handshake_and_stream_exchange() {
        let mut server = endpoint();
        let mut client = endpoint();

        let server_addr = server.local_addr().unwrap();
        let handle = client.connect(server_addr, Instant::now());

        let mut changes = Vec::new();
        drive(&mut client, &mut server, &mut changes, |seen| {
            seen.iter()
                .filter(|change| matches!(change, ConnectionChange::Connected(_)))
                .count()
                >= 2
        });

        assert!(client.connection(handle).unwrap().is_established());

        let accepted = server_handle(&changes).unwrap();
        assert!(server.connection(accepted).unwrap().is_established());

        // Client to server
        let stream = {
            let conn = client.connection_mut(handle).unwrap();
            let stream = conn.open_stream(Dir::Bidi).unwrap();
            conn.write_stream(stream, b"over the wire").unwrap();
            conn.finish_stream(stream).unwrap();
            stream
        };

        let mut changes = Vec::new();
        drive(&mut client, &mut server, &mut changes, |seen| {
            seen.iter().any(|change| {
                matches!(
                    change,
                    ConnectionChange::Event(_, ConnEvent::StreamReadable(_))
                )
            })
        });

        let conn = server.connection_mut(accepted).unwrap();
        assert_eq!(conn.read_stream(stream).unwrap(), b"over the wire");
    }

    #[test]
    fn test_unsupported_version_gets_negotiation_reply() {
        let mut server = endpoint();
        let server_addr = server.local_addr().unwrap();

        let probe_socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        probe_socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        // An Initial carrying a version this endpoint does not speak
        let header = Header::Long {
            ty: LongType::Initial,
            version: 0x0a0a_0a0a,
            dcid: ConnectionId::random(8),
            scid: ConnectionId::random(8),
            payload_len: 1300,
            pn: TruncatedPn::from_parts(0, PnLen::One),
        };

        let mut datagram = encode_to_vec(&header);
        datagram.resize(datagram.len() + 1299, 0);
        assert!(datagram.len() >= MIN_INITIAL_SIZE);

        probe_socket.send_to(&datagram, server_addr).unwrap();

        let mut reply = [0u8; 2048];
        let mut received = None;
        for _ in 0..100 {
            server.sync(Instant::now());
            match probe_socket.recv_from(&mut reply) {
                Ok((len, _)) => {
                    received = Some(len);
                    break;
                }
                Err(_) => sleep(Duration::from_millis(5)),
            }
        }

        let len = received.expect("no version negotiation reply");
        let parsed = packet::probe(&reply[..len], 8).unwrap();
        assert!(parsed.is_version_negotiation);
    }

    #[test]
    fn test_unknown_short_header_dropped_silently() {
        let mut server = endpoint();
        let server_addr = server.local_addr().unwrap();

        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let mut junk = vec![0x43u8; 64];
        junk[1..9].copy_from_slice(&[9u8; 8]);
        socket.send_to(&junk, server_addr).unwrap();

        for _ in 0..50 {
            server.sync(Instant::now());
            if server.dropped_datagrams() > 0 {
                break;
            }
            sleep(Duration::from_millis(2));
        }

        assert_eq!(server.dropped_datagrams(), 1);
        assert!(server.changes().next().is_none());
    }

    #[test]
    fn test_undersized_initial_ignored() {
        let mut server = endpoint();
        let server_addr = server.local_addr().unwrap();

        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();

        let header = Header::Long {
            ty: LongType::Initial,
            version: crate::QUIC_VERSION,
            dcid: ConnectionId::random(8),
            scid: ConnectionId::random(8),
            payload_len: 40,
            pn: TruncatedPn::from_parts(0, PnLen::One),
        };
        let mut datagram = encode_to_vec(&header);
        datagram.resize(datagram.len() + 39, 0);

        socket.send_to(&datagram, server_addr).unwrap();

        for _ in 0..50 {
            server.sync(Instant::now());
            if server.dropped_datagrams() > 0 {
                break;
            }
            sleep(Duration::from_millis(2));
        }

        assert_eq!(server.dropped_datagrams(), 1);
        assert!(server.live.is_empty());
    }
}

