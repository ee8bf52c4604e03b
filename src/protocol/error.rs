use std::io;

use thiserror::Error;

use crate::config::ConfigError;

use super::{PoolError, RecordType};

/// Violations of the wire protocol. Every variant is fatal for the
/// connection it was observed on and for nothing else.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("request id {0} is already open on this connection")]
    DuplicateRequestId(u16),

    #[error("truncated name-value pair: {needed} bytes declared, {available} available")]
    TruncatedPair { needed: usize, available: usize },

    #[error("name-value field of {0} bytes does not fit a 31-bit length")]
    PairTooLong(usize),

    #[error("{stream} stream of request {id} reopened after its end marker")]
    StreamReopened { id: u16, stream: RecordType },

    #[error("record truncated: {expected} bytes declared, peer closed after {read}")]
    Truncated { expected: usize, read: usize },

    #[error("malformed {kind} body of {len} bytes")]
    MalformedBody { kind: RecordType, len: usize },

    #[error("failed to decode record: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Failures that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

/// Failures that prevent the server from listening.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to listen: {0}")]
    Listen(#[from] io::Error),

    #[error("failed to start workers: {0}")]
    Pool(#[from] PoolError),

    #[error("listener thread panicked")]
    Panicked,
}
