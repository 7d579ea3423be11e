use crate::packet::PacketType;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Error returned by a connection dispatcher that refused a connection.
pub type DispatchError = Box<dyn std::error::Error + Send + Sync>;

/// Failure to decode (or encode) a packet, header or variable-length integer.
///
/// A codec error is fatal to the datagram being parsed and to nothing else.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of buffer: {needed} bytes needed, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    #[error("unrecognized packet type in control byte {0:#04x}")]
    UnrecognizedPacketType(u8),

    #[error("packet type {0:?} is not implemented")]
    UnimplementedPacketType(PacketType),

    #[error("value {0} does not fit in a variable-length integer")]
    ValueTooLarge(u64),

    #[error("connection id length {0} cannot be encoded in a long header")]
    InvalidConnectionIdLength(usize),
}

/// Terminal error observed by the consumer of a connection's inbound pipe.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection reset by peer")]
    Reset(#[source] io::Error),

    #[error("connection aborted: {0}")]
    Aborted(String),

    #[error("unexpected I/O failure: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    pub(crate) fn aborted() -> Self {
        Self::Aborted("the connection was aborted locally".to_owned())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already bound")]
    AlreadyBound,

    #[error("connection already started")]
    AlreadyStarted,

    #[error("address {addr} already in use")]
    AddressInUse {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("connection dispatcher failed: {0}")]
    Dispatch(#[source] DispatchError),

    #[error("accept loop panicked: {0}")]
    Panic(String),
}
