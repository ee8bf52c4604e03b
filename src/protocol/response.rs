//! Outbound record bursts.
//!
//! Each function here produces the complete set of records one event owes
//! the peer. A burst is handed to the connection writer as a unit, so its
//! records reach the wire back to back.
use std::collections::HashSet;

use bincode::{Encode, encode_to_vec};
use log::warn;

use crate::{
    config::ServerConfig,
    handler::{HandlerError, Response},
};

use super::{
    ConnectionError, MANAGEMENT_ID, ProtocolError, Record, RecordType,
    params::{decode_pair_list, encode_pair},
    record::{stream_records, wire_config},
    request::{EndRequest, ProtocolStatus},
};

pub const MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const MAX_REQS: &str = "FCGI_MAX_REQS";
pub const MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

#[derive(Debug, Encode)]
struct UnknownTypeBody {
    kind: u8,
    reserved: [u8; 7],
}

/// Frames a handler outcome: `Stdout` stream, `Stderr` stream when there is
/// diagnostic output, then `EndRequest`.
pub fn respond(
    request_id: u16,
    outcome: Result<Response, HandlerError>,
    failure_status: u32,
) -> Result<Vec<Record>, ConnectionError> {
    let response = outcome.unwrap_or_else(|err| {
        warn!("request {request_id} failed: {err}");
        Response::new(failure_status, Vec::new()).with_stderr(err.to_string())
    });

    let mut records = stream_records(RecordType::Stdout, request_id, &response.body);
    if !response.stderr.is_empty() {
        records.extend(stream_records(
            RecordType::Stderr,
            request_id,
            &response.stderr,
        ));
    }
    records.push(
        EndRequest::new(response.status, ProtocolStatus::RequestComplete).record(request_id)?,
    );
    Ok(records)
}

pub fn end_request(
    request_id: u16,
    app_status: u32,
    protocol_status: ProtocolStatus,
) -> Result<Vec<Record>, ConnectionError> {
    Ok(vec![
        EndRequest::new(app_status, protocol_status).record(request_id)?,
    ])
}

/// Answer to a record type this engine does not handle.
pub fn unknown_type(kind: RecordType) -> Result<Vec<Record>, ConnectionError> {
    let body = UnknownTypeBody {
        kind: kind.into(),
        reserved: [0; 7],
    };
    let content = encode_to_vec(body, wire_config())?;
    Ok(vec![Record::new(
        RecordType::UnknownType,
        MANAGEMENT_ID,
        content,
    )])
}

/// Answers a `GetValues` query with the requested variables this engine
/// knows, each at most once and in the order first asked; unknown names
/// are left out.
pub fn get_values(query: &[u8], config: &ServerConfig) -> Result<Vec<Record>, ConnectionError> {
    let mut content = Vec::new();
    let mut answered = HashSet::new();
    for (name, _) in decode_pair_list(query)? {
        let (name, value) = match name.as_str() {
            MAX_CONNS => (MAX_CONNS, config.max_connections.to_string()),
            MAX_REQS => (MAX_REQS, config.max_concurrent_requests().to_string()),
            MPXS_CONNS => (MPXS_CONNS, u8::from(config.multiplex).to_string()),
            _ => continue,
        };
        if answered.insert(name) {
            encode_pair(&mut content, name.as_bytes(), value.as_bytes())?;
        }
    }
    if content.len() > super::MAX_CONTENT_LEN {
        return Err(ProtocolError::MalformedBody {
            kind: RecordType::GetValues,
            len: query.len(),
        }
        .into());
    }
    Ok(vec![Record::new(
        RecordType::GetValuesResult,
        MANAGEMENT_ID,
        content,
    )])
}
