//! Wire codecs: variable-length integers, packet numbers, connection IDs,
//! headers, frames and whole packets.

pub mod cid;
pub mod frame;
pub mod header;
pub mod packet;
pub mod pnum;
pub mod varint;

pub use cid::{ConnectionId, ResetToken, MAX_CID_SIZE, MIN_CID_SIZE, RESET_TOKEN_SIZE};
pub use frame::{AckFrame, AckRange, EcnCounts, Frame, StreamFrame};
pub use header::{Header, LongType};
pub use packet::{Packet, Probe, MIN_INITIAL_SIZE};
pub use pnum::{PnLen, TruncatedPn};
pub use varint::VarInt;
