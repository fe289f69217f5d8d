//! Per-encryption-level crypto state: key bundles, the CRYPTO byte stream
//! carrying handshake payload, and the trait the external TLS engine
//! implements.

use crate::shared::{ErrorCode, TransportResult};
use crate::space::PacketNumberSpace;
use crate::streams::recv::Assembler;
use crate::wire::header::LongType;
use crate::wire::varint::VarInt;
use photon::crypto::KEY_SIZE;
use std::collections::VecDeque;
use std::fmt;

pub const LEVEL_COUNT: usize = 4;

/// Packets at a level that has no keys yet are buffered, not dropped; this
/// bounds how many.
const MAX_BUFFERED_PACKETS: usize = 16;

/// Encryption levels. Each carries independent keys and an independent
/// packet-number space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Level {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl Level {
    pub const ALL: [Level; LEVEL_COUNT] = [
        Level::Initial,
        Level::ZeroRtt,
        Level::Handshake,
        Level::OneRtt,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Level::Initial => 0,
            Level::ZeroRtt => 1,
            Level::Handshake => 2,
            Level::OneRtt => 3,
        }
    }

    /// The level a long-header packet type selects; Retry carries no
    /// protected payload.
    #[inline]
    pub fn from_long_type(ty: LongType) -> Option<Level> {
        match ty {
            LongType::Initial => Some(Level::Initial),
            LongType::ZeroRtt => Some(Level::ZeroRtt),
            LongType::Handshake => Some(Level::Handshake),
            LongType::Retry => None,
        }
    }
}

/// Keys for one direction of one level.
#[derive(Clone)]
pub struct DirectionalKeys {
    pub key: [u8; KEY_SIZE],
    /// Header-protection key.
    pub hp: [u8; KEY_SIZE],
}

impl fmt::Debug for DirectionalKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of the logs
        write!(f, "DirectionalKeys(..)")
    }
}

#[derive(Debug, Clone)]
pub struct LevelKeys {
    pub send: DirectionalKeys,
    pub recv: DirectionalKeys,
}

/// The external TLS 1.3 engine, reduced to the calls the transport makes.
/// Key material and transport-parameter bytes flow out; handshake bytes flow
/// both ways through CRYPTO frames.
pub trait HandshakeOracle {
    /// Feeds contiguous handshake bytes received at the given level.
    fn accept(&mut self, level: Level, data: &[u8]) -> TransportResult<()>;

    /// Drains handshake bytes the engine wants transmitted at the given level.
    fn produce(&mut self, level: Level) -> Option<Vec<u8>>;

    /// Keys derived since the last poll, one level per call.
    fn poll_keys(&mut self) -> Option<(Level, LevelKeys)>;

    /// The peer's raw transport-parameter extension, once read.
    fn peer_parameters(&mut self) -> Option<Vec<u8>>;

    /// True once the handshake has completed.
    fn is_established(&self) -> bool;
}

/// The ordered handshake byte stream of one level, addressed by 62-bit
/// offsets. No flow control and no FIN; the handshake ends by agreement.
#[derive(Debug)]
pub struct CryptoStream {
    next_offset: u64,
    pending: VecDeque<(u64, Vec<u8>)>,
    recv: Assembler,
}

impl CryptoStream {
    pub fn new() -> CryptoStream {
        CryptoStream {
            next_offset: 0,
            pending: VecDeque::new(),
            recv: Assembler::new(),
        }
    }

    /// Queues handshake bytes for transmission at the next offset.
    pub fn queue_send(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let offset = self.next_offset;
        self.next_offset += data.len() as u64;
        self.pending.push_back((offset, data));
    }

    #[inline]
    pub fn wants_transmit(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Hands out the next chunk for packing, split at `max_bytes`.
    pub fn pop_chunk(&mut self, max_bytes: usize) -> Option<(u64, Vec<u8>)> {
        if max_bytes == 0 {
            return None;
        }

        let (offset, data) = self.pending.front_mut()?;
        let offset = *offset;

        if data.len() <= max_bytes {
            let (_, data) = self.pending.pop_front().unwrap();
            return Some((offset, data));
        }

        let tail = data.split_off(max_bytes);
        let head = std::mem::replace(data, tail);
        self.pending.front_mut().unwrap().0 += max_bytes as u64;

        Some((offset, head))
    }

    /// Requeues a lost chunk, ordered by offset.
    pub fn on_lost(&mut self, offset: u64, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }

        let position = self
            .pending
            .iter()
            .position(|(chunk_offset, _)| *chunk_offset > offset)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, (offset, data));
    }

    /// Buffers received handshake bytes at their offset.
    pub fn recv_insert(&mut self, offset: u64, data: &[u8]) -> TransportResult<()> {
        if offset + data.len() as u64 > VarInt::MAX.value() {
            return Err(ErrorCode::FrameEncodingError.with("crypto offset exceeds 62 bits"));
        }

        self.recv.insert(offset, data);
        Ok(())
    }

    /// Drains contiguous received bytes for the handshake oracle.
    pub fn pop_recv(&mut self) -> Vec<u8> {
        self.recv.pop_contiguous()
    }
}

/// Everything one encryption level owns: keys once derived, its own
/// packet-number space, its CRYPTO stream, and packets parked until the keys
/// arrive.
#[derive(Debug)]
pub struct CryptoContext {
    pub level: Level,
    keys: Option<LevelKeys>,
    pub space: PacketNumberSpace,
    pub stream: CryptoStream,
    undecrypted: Vec<Vec<u8>>,
}

impl CryptoContext {
    pub fn new(level: Level) -> CryptoContext {
        CryptoContext {
            level,
            keys: None,
            space: PacketNumberSpace::new(),
            stream: CryptoStream::new(),
            undecrypted: Vec::new(),
        }
    }

    #[inline]
    pub fn keys(&self) -> Option<&LevelKeys> {
        self.keys.as_ref()
    }

    #[inline]
    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    /// Installs the level's keys and releases any packets that were waiting
    /// for them.
    pub fn install_keys(&mut self, keys: LevelKeys) -> Vec<Vec<u8>> {
        self.keys = Some(keys);
        self.take_undecrypted()
    }

    /// Drains the packets parked while keys were missing.
    pub fn take_undecrypted(&mut self) -> Vec<Vec<u8>> {
        std::mem::replace(&mut self.undecrypted, Vec::new())
    }

    /// Parks a packet that cannot be opened yet. Overflow drops the oldest.
    pub fn buffer_undecrypted(&mut self, datagram: Vec<u8>) {
        if self.undecrypted.len() >= MAX_BUFFERED_PACKETS {
            self.undecrypted.remove(0);
        }
        self.undecrypted.push(datagram);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_indices_are_stable() {
        for (position, level) in Level::ALL.iter().enumerate() {
            assert_eq!(level.index(), position);
        }
    }

    #[test]
    fn test_level_from_long_type() {
        assert_eq!(Level::from_long_type(LongType::Initial), Some(Level::Initial));
        assert_eq!(Level::from_long_type(LongType::ZeroRtt), Some(Level::ZeroRtt));
        assert_eq!(
            Level::from_long_type(LongType::Handshake),
            Some(Level::Handshake)
        );
        assert_eq!(Level::from_long_type(LongType::Retry), None);
    }

    #[test]
    fn test_crypto_stream_offsets() {
        let mut stream = CryptoStream::new();

        stream.queue_send(vec![1; 10]);
        stream.queue_send(vec![2; 5]);

        let (offset, data) = stream.pop_chunk(1200).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(data.len(), 10);

        let (offset, data) = stream.pop_chunk(1200).unwrap();
        assert_eq!(offset, 10);
        assert_eq!(data.len(), 5);

        assert!(stream.pop_chunk(1200).is_none());
    }

    #[test]
    fn test_crypto_stream_chunk_split() {
        let mut stream = CryptoStream::new();
        stream.queue_send(vec![7; 10]);

        let (offset, data) = stream.pop_chunk(6).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(data.len(), 6);

        let (offset, data) = stream.pop_chunk(6).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(data.len(), 4);
    }

    #[test]
    fn test_crypto_stream_retransmit_order() {
        let mut stream = CryptoStream::new();
        stream.queue_send(vec![1; 4]);
        stream.queue_send(vec![2; 4]);

        let (first_offset, first_data) = stream.pop_chunk(1200).unwrap();
        stream.on_lost(first_offset, first_data);

        let (offset, _) = stream.pop_chunk(1200).unwrap();
        assert_eq!(offset, 0);
        let (offset, _) = stream.pop_chunk(1200).unwrap();
        assert_eq!(offset, 4);
    }

    #[test]
    fn test_crypto_stream_reassembly() {
        let mut stream = CryptoStream::new();

        stream.recv_insert(4, b"shake").unwrap();
        assert_eq!(stream.pop_recv(), b"");

        stream.recv_insert(0, b"hand").unwrap();
        assert_eq!(stream.pop_recv(), b"handshake");
    }

    #[test]
    fn test_context_buffers_until_keys() {
        let mut context = CryptoContext::new(Level::Handshake);
        assert!(!context.has_keys());

        context.buffer_undecrypted(vec![1, 2, 3]);
        context.buffer_undecrypted(vec![4, 5]);

        let keys = LevelKeys {
            send: DirectionalKeys {
                key: [1; KEY_SIZE],
                hp: [2; KEY_SIZE],
            },
            recv: DirectionalKeys {
                key: [3; KEY_SIZE],
                hp: [4; KEY_SIZE],
            },
        };

        let parked = context.install_keys(keys);
        assert_eq!(parked, vec![vec![1, 2, 3], vec![4, 5]]);
        assert!(context.has_keys());

        let again = context.keys().unwrap().clone();
        assert!(context.install_keys(again).is_empty());
    }

    #[test]
    fn test_buffer_overflow_drops_oldest() {
        let mut context = CryptoContext::new(Level::OneRtt);

        for value in 0..(MAX_BUFFERED_PACKETS + 3) as u8 {
            context.buffer_undecrypted(vec![value]);
        }

        let keys = LevelKeys {
            send: DirectionalKeys {
                key: [0; KEY_SIZE],
                hp: [0; KEY_SIZE],
            },
            recv: DirectionalKeys {
                key: [0; KEY_SIZE],
                hp: [0; KEY_SIZE],
            },
        };

        let parked = context.install_keys(keys);
        assert_eq!(parked.len(), MAX_BUFFERED_PACKETS);
        assert_eq!(parked[0], vec![3]);
    }
}
