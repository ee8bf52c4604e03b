//! FastCGI responder protocol.
//!
//! This module implements the application side of FastCGI: it accepts
//! connections from a web server, decodes the records it sends, assembles
//! each request's parameters and body, runs a [`Handler`](crate::Handler)
//! and frames the response back onto the connection.
//!
//! # Overview
//!
//! The protocol layer is split along the path a byte takes through the
//! engine:
//!
//! - [`record`]: the 8-byte header, padding, and splitting of long content.
//! - [`params`]: the name-value pair encoding used by `Params` and
//!   `GetValues`.
//! - [`assembler`]: collects the `Params` and `Stdin` streams of one request.
//! - [`request`]: begin/end bodies and the per-request state machine.
//! - [`response`]: the record bursts sent back for every event.
//! - [`connection`]: routes records by request id and owns the writer.
//! - [`server`]: the listener, its worker pools and shutdown.
//!
//! # Binary Format
//!
//! - Every record starts with a fixed-size header carrying the version,
//!   record type, request id, content length and padding length.
//! - Integers on the wire are big-endian.
//! - Content is padded to a multiple of 8 bytes and never exceeds 65535
//!   bytes per record; streams end with an empty record.
//!
//! # Concurrency
//!
//! Each connection is served by one pooled thread reading records and one
//! thread writing them. Requests of a multiplexed connection run on a
//! shared request pool, so a slow handler delays only its own request.
//! Protocol violations close the offending connection and nothing else.
pub mod assembler;
pub mod connection;
pub mod params;
pub mod record;
pub mod request;
pub mod response;
pub mod server;
pub mod transport;

mod error;
mod thread;

pub use error::{ConnectionError, ProtocolError, ServerError};
pub use record::{MANAGEMENT_ID, MAX_CONTENT_LEN, Record, RecordType};
pub use server::{Server, ServerHandle};
pub use thread::{PoolError, ThreadPool};
pub use transport::Transport;
