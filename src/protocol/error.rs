//! Request building errors.
//!
//! Raised by `RequestBuilder` before any byte reaches the socket.

use crate::codec::CodecError;
use thiserror::Error;

/// Errors that can occur while serializing frontend messages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    /// A string value contains a literal NULL byte (0x00).
    #[error("Value contains NULL byte (0x00) which is invalid in PostgreSQL")]
    NullByte,

    /// Too many parameters for the protocol (limit is i16::MAX = 32767).
    #[error("Too many parameters: {0} (Limit is 32767)")]
    TooManyParameters(usize),

    /// A packet was started before the previous one reached its declared length.
    #[error("Packet builder invariant violated: previous packet declared end {expected}, cursor at {actual}")]
    Invariant { expected: usize, actual: usize },

    /// A packet body grew past what a 4-byte length can describe.
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    /// A parameter failed to encode while building Bind.
    #[error("Parameter ${}: {source}", .index + 1)]
    Param { index: usize, source: CodecError },

    /// A packet of unknown length was started and never finished.
    #[error("Packet started at offset {start} was never finished")]
    Unterminated { start: usize },
}
