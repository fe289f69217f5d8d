use photon::choose;
use photon::crypto;
use std::fmt;
use std::ops::Deref;

pub const MIN_CID_SIZE: usize = 4;
pub const MAX_CID_SIZE: usize = 18;
pub const RESET_TOKEN_SIZE: usize = 16;

/// An opaque connection identifier, 4 to 18 bytes, or empty. Routes datagrams
/// to a connection independently of the peer address.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub const EMPTY: ConnectionId = ConnectionId {
        len: 0,
        bytes: [0; MAX_CID_SIZE],
    };

    pub fn new(cid: &[u8]) -> ConnectionId {
        if !cid.is_empty() && (cid.len() < MIN_CID_SIZE || cid.len() > MAX_CID_SIZE) {
            panic!(
                "Connection ID length must be 0 or {}-{}, got {}",
                MIN_CID_SIZE,
                MAX_CID_SIZE,
                cid.len()
            );
        }

        let mut bytes = [0u8; MAX_CID_SIZE];
        bytes[..cid.len()].copy_from_slice(cid);

        ConnectionId {
            len: cid.len() as u8,
            bytes,
        }
    }

    /// Generates a random connection ID of the requested length.
    pub fn random(len: usize) -> ConnectionId {
        let mut cid = ConnectionId::new(&[0u8; MAX_CID_SIZE][..len]);
        crypto::random_bytes(&mut cid.bytes[..len]);
        cid
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The 4-bit length field carried in long headers: zero for an absent
    /// connection ID, otherwise `len - 3`.
    #[inline]
    pub fn len_nibble(&self) -> u8 {
        choose!(self.len == 0 => 0, self.len - 3)
    }

    /// Inverse of `len_nibble`.
    #[inline]
    pub fn len_from_nibble(nibble: u8) -> usize {
        choose!(nibble == 0 => 0, nibble as usize + 3)
    }
}

impl Deref for ConnectionId {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:")?;
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Secret paired with an advertised connection ID; its bare appearance in a
/// datagram terminates the matching connection without a packet exchange.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    #[inline]
    pub fn new(token: [u8; RESET_TOKEN_SIZE]) -> ResetToken {
        ResetToken(token)
    }

    pub fn from_slice(token: &[u8]) -> ResetToken {
        let mut bytes = [0u8; RESET_TOKEN_SIZE];
        bytes.copy_from_slice(token);
        ResetToken(bytes)
    }

    pub fn random() -> ResetToken {
        let mut bytes = [0u8; RESET_TOKEN_SIZE];
        crypto::random_bytes(&mut bytes);
        ResetToken(bytes)
    }
}

impl Deref for ResetToken {
    type Target = [u8; RESET_TOKEN_SIZE];

    #[inline]
    fn deref(&self) -> &[u8; RESET_TOKEN_SIZE] {
        &self.0
    }
}

impl fmt::Debug for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token:")?;
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_roundtrip_storage() {
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(cid.len(), 8);
        assert_eq!(&cid[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_empty_cid() {
        let cid = ConnectionId::EMPTY;
        assert!(cid.is_empty());
        assert_eq!(cid.len_nibble(), 0);
        assert_eq!(ConnectionId::len_from_nibble(0), 0);
    }

    #[test]
    fn test_len_nibble_roundtrip() {
        for len in MIN_CID_SIZE..=MAX_CID_SIZE {
            let cid = ConnectionId::random(len);
            assert_eq!(ConnectionId::len_from_nibble(cid.len_nibble()), len);
        }
    }

    #[test]
    #[should_panic(expected = "Connection ID length must be 0 or 4-18, got 2")]
    fn test_invalid_length_panics() {
        let _ = ConnectionId::new(&[1, 2]);
    }

    #[test]
    fn test_random_cids_differ() {
        let first = ConnectionId::random(8);
        let second = ConnectionId::random(8);
        assert_ne!(first, second);
    }

    #[test]
    fn test_reset_token_equality() {
        let token = ResetToken::new([9; RESET_TOKEN_SIZE]);
        assert_eq!(token, ResetToken::from_slice(&[9; RESET_TOKEN_SIZE]));
        assert_ne!(token, ResetToken::new([8; RESET_TOKEN_SIZE]));
    }
}
