use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
///
/// Codec failures on ingress are logged and the offending datagram dropped;
/// the protocol is loss-tolerant, so nothing here crosses the wire.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// A length field extends past the end of the buffer.
    #[error("truncated message")]
    Truncated,

    /// An unknown type or tag byte.
    #[error("unknown type code: {0:#04x}")]
    BadType(u8),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    BadUtf8,

    /// The message exceeds the 64 KiB datagram limit.
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// Errors raised by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Top-level error type for the crate.
///
/// During steady state send and receive failures are absorbed into protocol
/// state (a timed-out probe becomes a suspicion); only `join` surfaces an
/// error to the caller.
#[derive(Error, Debug)]
pub enum SwimError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("join failed: {0}")]
    JoinFailed(String),
}

pub type Result<T> = std::result::Result<T, SwimError>;

/// Coarse error classes surfaced on the membership event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Codec,
    Transport,
}
