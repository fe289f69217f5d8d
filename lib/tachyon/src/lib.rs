//! `Tachyon` is the in-process core of a QUIC transport endpoint: datagram and
//! packet codecs, per-level packet-number spaces, loss recovery, congestion
//! control, stream multiplexing with flow control, and the connection state
//! machine tying them together. Socket plumbing lives in a thin `mio` driver;
//! the TLS engine and AEAD suite sit behind traits.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod params;
pub mod recovery;
pub mod shared;
pub mod space;
pub mod streams;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

/// Wire version transmitted in long headers (draft-12).
pub const QUIC_VERSION: u32 = 0xff00_000c;

/// Versions this endpoint is willing to negotiate, most preferred first.
pub const SUPPORTED_VERSIONS: &[u32] = &[QUIC_VERSION];

pub use crate::config::{EndpointConfig, TransportConfig};
pub use crate::connection::{ConnEvent, Connection};
pub use crate::endpoint::Endpoint;
pub use crate::shared::{ErrorCode, Side, TransportError, TransportResult};
