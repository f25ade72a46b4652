//! Error types for channels and transport bindings.

use thiserror::Error;

/// Faults reported by a transport binding through its completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportFault {
    /// The peer closed or reset its endpoint.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The peer can no longer be reached.
    #[error("peer unreachable")]
    PeerUnreachable,

    /// A message was larger than the posted receive.
    #[error("message truncated: {len} bytes into a {capacity} byte receive")]
    Truncated {
        /// Length of the incoming message.
        len: usize,
        /// Capacity of the receive it matched.
        capacity: usize,
    },

    /// The local endpoint or worker was already released.
    #[error("endpoint closed")]
    EndpointClosed,
}

/// Errors returned by channel, acceptor and configuration operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// `bind` on an acceptor that is already bound.
    #[error("channel is already bound")]
    AlreadyBound,

    /// `accept` before `bind`.
    #[error("channel is not yet bound")]
    NotYetBound,

    /// Another live channel holds this connection id.
    #[error("connection id 0x{0:014x} is already in use")]
    DuplicateConnectionId(u64),

    /// Channel or engine settings that cannot work together.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Which constraint was violated.
        reason: String,
    },

    /// An address that does not parse as `host:port`.
    #[error("invalid address: {addr}")]
    InvalidAddress {
        /// The address as given.
        addr: String,
    },

    /// No listener at the remote address.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// The remote address.
        addr: String,
    },

    /// The peer's handshake carried the wrong magic value.
    #[error("handshake rejected: expected magic 0x{expected:016X}, got 0x{got:016X}")]
    HandshakeRejected {
        /// Magic this side expects.
        expected: u64,
        /// Magic the peer sent.
        got: u64,
    },

    /// A handshake message of the wrong length.
    #[error("malformed handshake message of {len} bytes")]
    MalformedHandshake {
        /// Length of the received message.
        len: usize,
    },

    /// A tag whose kind byte is not DATA, FLUSH or HANDSHAKE.
    #[error("unknown message kind: 0x{0:02X}")]
    UnknownMessageKind(u8),

    /// A ring cursor was advanced past the bytes available.
    #[error("ring buffer overrun: advancing by {requested} with only {available} available")]
    RingOverrun {
        /// Bytes the caller tried to advance by.
        requested: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The channel was closed by the user.
    #[error("channel is closed")]
    ChannelClosed,

    /// Write after `shutdown_output`.
    #[error("channel output is shut down")]
    OutputShutdown,

    /// I/O on a channel with no connection attempt.
    #[error("not connected")]
    NotConnected,

    /// `connect` while a handshake is outstanding.
    #[error("connection already pending")]
    ConnectionPending,

    /// `connect` on a connected channel.
    #[error("already connected")]
    AlreadyConnected,

    /// The channel was closed by a transport fault.
    #[error("transport error: {0}")]
    Transport(#[from] TransportFault),

    /// A configuration file that fails to parse.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Reading a configuration file failed.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChannelError>;
