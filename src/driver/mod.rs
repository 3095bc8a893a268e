//! PostgreSQL driver (Async I/O)
//!
//! Combines the pure protocol layer with tokio:
//! - `socket.rs` - packet framing over any byte stream
//! - `startup.rs` - SSL negotiation and the startup handshake
//! - `connection.rs` - the shared connection handle
//! - `query.rs` - extended query submission (fast and slow paths)
//! - `response.rs` - the single response-processing loop
//! - `decoder.rs` - per-column-signature row decoders

pub mod config;
mod connection;
mod decoder;
mod query;
mod response;
mod row;
mod socket;
mod startup;
mod stream;
mod tls;

pub use config::{ConnectOptions, ParamInference, ProtocolVersion, SslMode};
pub use connection::{CacheStats, Connection, ServerEvent};
pub use decoder::{RowDecoder, RowDecoderCache};
pub use query::{bind_param, Param, QueryOptions, QueryResult};
pub use row::{ColumnInfo, PgRow};
pub use socket::{Packet, PacketSocket, MAX_PACKET_LEN};
pub use stream::PgStream;
pub use tls::TlsConfig;

use crate::codec::CodecError;
use crate::protocol::{BuildError, ErrorFields};
use thiserror::Error;

/// PostgreSQL driver errors.
#[derive(Debug, Error)]
pub enum PgError {
    /// ErrorResponse from the server
    #[error("Server error: {0}")]
    Server(Box<ErrorFields>),

    /// Unexpected message, malformed packet, unsupported authentication
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Failure while establishing the connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Any operation after the connection was torn down
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PgError {
    /// Whether this error ends the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            PgError::Server(fields) => fields.is_fatal(),
            PgError::Codec(_) | PgError::Build(_) => false,
            PgError::Protocol(_)
            | PgError::Connection(_)
            | PgError::ConnectionClosed(_)
            | PgError::Io(_) => true,
        }
    }

    /// SQLSTATE of a server error.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server(fields) => Some(&fields.code),
            _ => None,
        }
    }

    /// Full server error fields, if any.
    pub fn server_error(&self) -> Option<&ErrorFields> {
        match self {
            PgError::Server(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<ErrorFields> for PgError {
    fn from(fields: ErrorFields) -> Self {
        PgError::Server(Box::new(fields))
    }
}

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;
