use std::fmt;
use std::io;

pub type TransportResult<T> = Result<T, TransportError>;

/// Two-level error plumbing for the transport. `Wait` conditions are benign
/// (not enough bytes buffered, window exhausted) and never tear down a
/// connection. `Fatal` conditions carry the 16-bit wire error code plus a
/// reason phrase and close the connection that raised them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportError {
    Wait,
    Fatal(ErrorCode, String),
}

impl TransportError {
    /// The wire error code for fatal errors; `Wait` has none.
    #[inline]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TransportError::Wait => None,
            TransportError::Fatal(code, _) => Some(*code),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Wait => write!(f, "wait"),
            TransportError::Fatal(code, reason) => write!(f, "{:?}: {}", code, reason),
        }
    }
}

impl From<io::Error> for TransportError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => TransportError::Wait,
            kind => ErrorCode::InternalError.with(format!("io error: {:?}", kind)),
        }
    }
}

/// Transport error codes carried in CONNECTION_CLOSE frames.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    NoError,
    InternalError,
    ServerBusy,
    FlowControlError,
    StreamIdError,
    StreamStateError,
    FinalOffsetError,
    FrameEncodingError,
    TransportParameterError,
    VersionNegotiationError,
    ProtocolViolation,
}

impl ErrorCode {
    /// The 16-bit wire representation.
    #[inline]
    pub fn wire(self) -> u16 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::InternalError => 0x1,
            ErrorCode::ServerBusy => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::StreamIdError => 0x4,
            ErrorCode::StreamStateError => 0x5,
            ErrorCode::FinalOffsetError => 0x6,
            ErrorCode::FrameEncodingError => 0x7,
            ErrorCode::TransportParameterError => 0x8,
            ErrorCode::VersionNegotiationError => 0x9,
            ErrorCode::ProtocolViolation => 0xA,
        }
    }

    /// Maps a wire code back to the known set, if it is one of ours.
    #[inline]
    pub fn from_wire(code: u16) -> Option<ErrorCode> {
        Some(match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::InternalError,
            0x2 => ErrorCode::ServerBusy,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::StreamIdError,
            0x5 => ErrorCode::StreamStateError,
            0x6 => ErrorCode::FinalOffsetError,
            0x7 => ErrorCode::FrameEncodingError,
            0x8 => ErrorCode::TransportParameterError,
            0x9 => ErrorCode::VersionNegotiationError,
            0xA => ErrorCode::ProtocolViolation,
            _ => return None,
        })
    }

    /// Wraps the code into a fatal error with the supplied reason phrase.
    #[inline]
    pub fn with<S: Into<String>>(self, reason: S) -> TransportError {
        TransportError::Fatal(self, reason.into())
    }
}

pub trait ErrorUtils {
    /// True when the result is neither success nor a benign wait.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for TransportResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(TransportError::Wait) => false,
            _ => true,
        }
    }
}

/// Which side of the connection this endpoint plays.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    #[inline]
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    #[inline]
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedWrite for io::Cursor<Vec<u8>> {
    #[inline]
    fn free_capacity(&self) -> usize {
        usize::max_value() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for manually encoded wire objects. Implementors must validate the
/// remaining free capacity in the stream upfront and only write into it if all
/// the content they wish to write can be written.
///
/// Should return `TransportError::Wait` in case there is not enough capacity
/// in the stream.
pub trait Encode {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> TransportResult<()>;
}

/// Trait for manually decoded wire objects. Running past the end of the
/// source is a `FRAME_ENCODING_ERROR`.
pub trait Decode: Sized {
    fn decode<R: SizedRead>(stream: &mut R) -> TransportResult<Self>;
}

/// Encodes the object into a fresh byte vector. Test and scratch use; the hot
/// paths write into preallocated datagram buffers.
pub fn encode_to_vec<E: Encode>(item: &E) -> Vec<u8> {
    let mut stream = io::Cursor::new(Vec::new());
    item.encode(&mut stream).expect("Vec-backed stream cannot run out of capacity");
    stream.into_inner()
}
