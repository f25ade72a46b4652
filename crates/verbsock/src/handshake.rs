//! Connection handshake.
//!
//! Creating an endpoint returns before the peer is ready, so each side sends one
//! small tagged message carrying a magic value and its own connection id, and
//! posts one matching receive. A channel counts as connected only once both of
//! its own operations have completed and the received magic checks out.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ChannelError, Result};
use crate::tag::{ConnectionId, MessageKind, Tag, TAG_MASK_MESSAGE_KIND};

/// Magic value exchanged by both sides.
pub const CONNECTION_MAGIC: u64 = 0xC0FF_EE00_ADD1_C7ED;

/// Handshake payload length: magic plus sender connection id.
pub const HANDSHAKE_LEN: usize = 16;

/// Tag and mask for the handshake receive. Only the kind byte is matched since
/// the peer's id is not known yet.
pub fn receive_tag() -> (Tag, u64) {
    (Tag::new(MessageKind::Handshake, ConnectionId::new(0)), TAG_MASK_MESSAGE_KIND)
}

/// Tag used when sending the local handshake.
pub fn send_tag(local: ConnectionId) -> Tag {
    Tag::new(MessageKind::Handshake, local)
}

/// Encodes the handshake payload for `local`.
pub fn encode(local: ConnectionId) -> Bytes {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
    buf.put_u64(CONNECTION_MAGIC);
    buf.put_u64(local.as_u64());
    buf.freeze()
}

/// Validates a received handshake and returns the peer's connection id.
pub fn decode(mut data: &[u8]) -> Result<ConnectionId> {
    if data.len() != HANDSHAKE_LEN {
        return Err(ChannelError::MalformedHandshake { len: data.len() });
    }
    let magic = data.get_u64();
    if magic != CONNECTION_MAGIC {
        return Err(ChannelError::HandshakeRejected {
            expected: CONNECTION_MAGIC,
            got: magic,
        });
    }
    Ok(ConnectionId::new(data.get_u64()))
}

/// Where a handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Waiting for the local send and/or the peer's message.
    Pending,
    /// Both directions confirmed.
    Complete(ConnectionId),
    /// The peer's message failed validation; the attempt is discarded.
    Rejected {
        /// Magic value the peer sent, 0 for a malformed message.
        got: u64,
    },
}

/// Tracks the two completions a handshake needs.
#[derive(Debug, Clone)]
pub struct Handshake {
    sent: bool,
    peer: Option<ConnectionId>,
    rejected: Option<u64>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    /// Starts with neither completion seen.
    pub fn new() -> Self {
        Self {
            sent: false,
            peer: None,
            rejected: None,
        }
    }

    /// Records completion of the local send.
    pub fn on_sent(&mut self) -> HandshakeStatus {
        self.sent = true;
        self.status()
    }

    /// Records the peer's message. A bad message rejects the handshake for good.
    pub fn on_received(&mut self, data: &[u8]) -> HandshakeStatus {
        if self.rejected.is_none() && self.peer.is_none() {
            match decode(data) {
                Ok(peer) => self.peer = Some(peer),
                Err(ChannelError::HandshakeRejected { got, .. }) => self.rejected = Some(got),
                Err(_) => self.rejected = Some(0),
            }
        }
        self.status()
    }

    /// Current status of the two completions.
    pub fn status(&self) -> HandshakeStatus {
        if let Some(got) = self.rejected {
            return HandshakeStatus::Rejected { got };
        }
        match (self.sent, self.peer) {
            (true, Some(peer)) => HandshakeStatus::Complete(peer),
            _ => HandshakeStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let bytes = encode(ConnectionId::new(0x1234));
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(&bytes[..8], &CONNECTION_MAGIC.to_be_bytes());
        assert_eq!(&bytes[8..], &0x1234u64.to_be_bytes());
    }

    #[test]
    fn test_decode_returns_peer_id() {
        let id = ConnectionId::new(0xbeef);
        assert_eq!(decode(&encode(id)).unwrap(), id);
    }

    #[test]
    fn test_decode_wrong_magic() {
        let mut raw = [0u8; HANDSHAKE_LEN];
        raw[..8].copy_from_slice(&0xdead_beefu64.to_be_bytes());
        match decode(&raw) {
            Err(ChannelError::HandshakeRejected { expected, got }) => {
                assert_eq!(expected, CONNECTION_MAGIC);
                assert_eq!(got, 0xdead_beef);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_wrong_length() {
        assert!(matches!(
            decode(&[0u8; 8]),
            Err(ChannelError::MalformedHandshake { len: 8 })
        ));
    }

    #[test]
    fn test_needs_both_completions() {
        let peer = ConnectionId::new(5);
        let mut hs = Handshake::new();
        assert_eq!(hs.on_received(&encode(peer)), HandshakeStatus::Pending);
        assert_eq!(hs.on_sent(), HandshakeStatus::Complete(peer));

        let mut hs = Handshake::new();
        assert_eq!(hs.on_sent(), HandshakeStatus::Pending);
        assert_eq!(hs.on_received(&encode(peer)), HandshakeStatus::Complete(peer));
    }

    #[test]
    fn test_rejection_is_sticky() {
        let mut hs = Handshake::new();
        let mut bad = encode(ConnectionId::new(1)).to_vec();
        bad[0] ^= 0xff;
        let got = u64::from_be_bytes(bad[..8].try_into().unwrap());
        assert_eq!(hs.on_received(&bad), HandshakeStatus::Rejected { got });
        assert_eq!(hs.on_sent(), HandshakeStatus::Rejected { got });
        assert_eq!(
            hs.on_received(&encode(ConnectionId::new(1))),
            HandshakeStatus::Rejected { got }
        );
    }

    #[test]
    fn test_receive_tag_matches_any_sender() {
        let (wanted, mask) = receive_tag();
        assert!(send_tag(ConnectionId::new(77)).matches(wanted, mask));
        assert!(!Tag::new(MessageKind::Data, ConnectionId::new(77)).matches(wanted, mask));
    }
}
