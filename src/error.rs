use thiserror::Error;

use crate::frame::Frame;

/// Errors surfaced by connection and session operations.
#[derive(Error, Debug)]
pub enum StompError {
    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed inbound frame. Surfaced on the error stream; the
    /// connection itself stays up and resynchronizes at the next NUL.
    #[error("protocol decode error: {0}")]
    Decode(String),
    /// A command was attempted with no live transport.
    #[error("not connected")]
    NotConnected,
    /// A connection was requested while a handshake is already running.
    #[error("connection handshake already in progress")]
    HandshakeInProgress,
    /// The peer or the network closed the transport.
    #[error("transport closed: {0}")]
    TransportClosed(String),
    /// The reconnect budget ran out; the session is over.
    #[error("reconnect budget exhausted after {attempts} failed attempts")]
    ReconnectExhausted { attempts: u32 },
    /// The server answered with an ERROR frame during the handshake.
    #[error("server error: {0}")]
    Server(String),
}

/// Cloneable error-stream item, broadcast to every listener of
/// [`Connection::errors`](crate::connection::Connection::errors).
#[derive(Debug, Clone)]
pub enum ErrorEvent {
    /// An inbound frame failed to decode; the connection stays up.
    Decode(String),
    /// The server sent an ERROR frame. Non-fatal by itself.
    Server(Frame),
    /// A MESSAGE was dropped because its subscription's buffer was full.
    MessageDropped { subscription: String },
    /// The transport closed (peer, network, or heartbeat watchdog).
    TransportClosed(String),
}
