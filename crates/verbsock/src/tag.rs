//! 64-bit message tags and connection id generation.
//!
//! A tag carries the message kind in its high byte and the target connection id
//! in the low 56 bits. The receive side matches on the full tag for payload and
//! flush acknowledgments, and on the kind byte alone for handshakes.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, OnceLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ChannelError, Result};

/// Mask selecting every bit of a tag.
pub const TAG_MASK_FULL: u64 = u64::MAX;
/// Mask selecting the connection id bits.
pub const TAG_MASK_CONNECTION_ID: u64 = 0x00ff_ffff_ffff_ffff;
/// Mask selecting the message kind byte.
pub const TAG_MASK_MESSAGE_KIND: u64 = 0xff00_0000_0000_0000;

const KIND_SHIFT: u32 = 56;

/// Kind of a tagged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Channel payload.
    Data = 0,
    /// Zero-payload flow-control acknowledgment.
    Flush = 1,
    /// Connection magic exchange.
    Handshake = 2,
}

impl MessageKind {
    /// Raw byte stored in the tag.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ChannelError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(MessageKind::Data),
            1 => Ok(MessageKind::Flush),
            2 => Ok(MessageKind::Handshake),
            other => Err(ChannelError::UnknownMessageKind(other)),
        }
    }
}

/// Identifier of a locally created channel, at most 56 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw id, dropping any bits above the 56-bit id space.
    pub fn new(raw: u64) -> Self {
        Self(raw & TAG_MASK_CONNECTION_ID)
    }

    /// Raw id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:014x}", self.0)
    }
}

/// A 64-bit transport tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u64);

impl Tag {
    /// Builds a tag from a kind and a target connection id.
    pub fn new(kind: MessageKind, id: ConnectionId) -> Self {
        Self(((kind.as_u8() as u64) << KIND_SHIFT) | id.as_u64())
    }

    /// Wraps a raw tag as seen on the wire.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw tag value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Decodes the message kind. Fails for kinds this engine does not know.
    pub fn kind(self) -> Result<MessageKind> {
        MessageKind::try_from(((self.0 & TAG_MASK_MESSAGE_KIND) >> KIND_SHIFT) as u8)
    }

    /// Target connection id.
    pub fn connection_id(self) -> ConnectionId {
        ConnectionId(self.0 & TAG_MASK_CONNECTION_ID)
    }

    /// Returns true if `self` matches `wanted` under `mask`.
    pub fn matches(self, wanted: Tag, mask: u64) -> bool {
        (self.0 & mask) == (wanted.0 & mask)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Encodes a kind and connection id into a tag.
pub fn encode(kind: MessageKind, id: ConnectionId) -> Tag {
    Tag::new(kind, id)
}

/// Splits a tag into its kind and connection id.
pub fn decode(tag: Tag) -> Result<(MessageKind, ConnectionId)> {
    Ok((tag.kind()?, tag.connection_id()))
}

/// Source of connection ids that never repeats for its lifetime.
///
/// Ids are drawn uniformly from `1..=TAG_MASK_CONNECTION_ID`; every issued id
/// is remembered so a repeated draw is discarded rather than handed out.
pub struct IdGenerator {
    inner: Mutex<IdGeneratorInner>,
}

struct IdGeneratorInner {
    rng: StdRng,
    issued: HashSet<u64>,
}

impl IdGenerator {
    /// Creates a generator seeded from the operating system.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Creates a deterministic generator, used by tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            inner: Mutex::new(IdGeneratorInner {
                rng,
                issued: HashSet::new(),
            }),
        }
    }

    /// Draws the next unused id.
    pub fn next_id(&self) -> ConnectionId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let candidate = inner.rng.gen_range(1..=TAG_MASK_CONNECTION_ID);
            if inner.issued.insert(candidate) {
                return ConnectionId(candidate);
            }
        }
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .issued
            .len()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_IDS: OnceLock<IdGenerator> = OnceLock::new();

/// Process-wide connection id source.
pub fn next_id() -> ConnectionId {
    GLOBAL_IDS.get_or_init(IdGenerator::new).next_id()
}

static LIVE_IDS: OnceLock<Mutex<HashSet<u64>>> = OnceLock::new();

fn live_ids() -> &'static Mutex<HashSet<u64>> {
    LIVE_IDS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Claims `id` for a live channel. Two live channels sharing an id could
/// acknowledge each other's traffic, so a second claim is rejected.
pub fn claim(id: ConnectionId) -> Result<()> {
    let mut live = live_ids().lock().unwrap_or_else(|e| e.into_inner());
    if !live.insert(id.as_u64()) {
        return Err(ChannelError::DuplicateConnectionId(id.as_u64()));
    }
    Ok(())
}

/// Releases a claim taken by [`claim`].
pub fn release(id: ConnectionId) {
    live_ids()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id.as_u64());
}
