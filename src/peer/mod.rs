//! Peer protocol engine: one [`PeerConnection`] instance per remote
//! endpoint, handshake, message framing, and per-peer choke/interest and
//! bitfield state.
use thiserror::Error;

pub mod connection;
pub mod handshake;
pub mod message;

pub use connection::PeerConnection;
pub use handshake::Handshake;
pub use message::Message;

/// Errors raised by the peer protocol engine.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("timed out waiting for peer")]
    Timeout,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
