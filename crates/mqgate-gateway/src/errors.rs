//! Gateway error types.

use thiserror::Error;

/// Wire-level decode/encode failures. Decode failures and socket errors are
/// fatal to the connection.
#[derive(Debug, Error)]
pub enum WireError {
    /// Socket read or write failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Remaining length exceeds the configured maximum.
    #[error("packet of {size} bytes exceeds limit of {max}")]
    PacketTooLarge {
        /// Declared size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Remaining-length field longer than four bytes.
    #[error("malformed remaining length")]
    MalformedLength,

    /// Packet body does not match its type.
    #[error("malformed {packet} packet: {reason}")]
    Malformed {
        /// Packet type name.
        packet: &'static str,
        /// What was wrong.
        reason: &'static str,
    },

    /// Packet type outside the supported subset.
    #[error("unsupported packet type {0}")]
    Unsupported(u8),

    /// Only QoS 0 and 1 are handled.
    #[error("unsupported QoS level {0}")]
    UnsupportedQos(u8),
}

/// Connection and gate errors.
#[derive(Debug, Error)]
pub enum GateError {
    /// Wire protocol violation or socket failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// No CONNECT arrived within the handshake window.
    #[error("handshake not completed in time")]
    HandshakeTimeout,

    /// Peer went away before completing the handshake.
    #[error("connection closed before handshake")]
    ClosedBeforeHandshake,

    /// First packet was not CONNECT.
    #[error("expected CONNECT, got {0}")]
    ExpectedConnect(&'static str),

    /// CONNECT asked for a protocol level we do not speak.
    #[error("unsupported protocol {name} level {level}")]
    UnsupportedProtocol {
        /// Protocol name from CONNECT.
        name: String,
        /// Protocol level from CONNECT.
        level: u8,
    },

    /// A second CONNECT on an established connection.
    #[error("duplicate CONNECT")]
    DuplicateConnect,

    /// Nothing arrived within 1.5 × keep-alive.
    #[error("keep-alive expired")]
    KeepAliveTimeout,

    /// Write attempted before the handshake finished.
    #[error("connection not established")]
    NotConnected,

    /// Write attempted after the connection closed.
    #[error("connection closed")]
    Closed,

    /// The client is not draining its outbound queue.
    #[error("outbound queue full")]
    OutboundFull,

    /// The send hook rejected the outbound body.
    #[error("send hook rejected message: {0}")]
    SendHook(String),

    /// The result marshaler failed twice.
    #[error("failed to marshal result: {0}")]
    Marshal(String),

    /// No connected agent has this session id.
    #[error("no connection for session {0}")]
    NoSuchSession(String),

    /// Listener failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GateError>;
