//! Request bodies and the lifecycle of one request id.
//!
//! ```text
//! Created ──► AccumulatingStreams ──► Dispatched ──► Responding ──► Complete
//!    │                 │                  │
//!    └─────────────────┴──────────────────┴──────► Aborted
//! ```
//!
//! A request that asks for a role other than responder goes straight from
//! `Created` to `Complete` with an `UNKNOWN_ROLE` answer.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bincode::{Decode, Encode, decode_from_slice, encode_to_vec};

use crate::handler::Request;

use super::{
    ProtocolError, Record, RecordType, assembler::Assembler, record::wire_config,
};

/// Flag bit of [`BeginRequest`] asking the application to keep the
/// connection open after the request.
pub const KEEP_CONN: u8 = 1;

const BODY_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
    Other(u16),
}

impl From<u16> for Role {
    fn from(value: u16) -> Self {
        match value {
            1 => Role::Responder,
            2 => Role::Authorizer,
            3 => Role::Filter,
            other => Role::Other(other),
        }
    }
}

impl From<Role> for u16 {
    fn from(value: Role) -> Self {
        match value {
            Role::Responder => 1,
            Role::Authorizer => 2,
            Role::Filter => 3,
            Role::Other(other) => other,
        }
    }
}

#[derive(Debug, Encode, Decode)]
struct BeginRequestBody {
    role: u16,
    flags: u8,
    reserved: [u8; 5],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: Role,
    pub keep_connection: bool,
}

impl BeginRequest {
    pub fn new(role: Role, keep_connection: bool) -> Self {
        Self {
            role,
            keep_connection,
        }
    }

    pub fn decode(content: &[u8]) -> Result<Self, ProtocolError> {
        if content.len() != BODY_LEN {
            return Err(ProtocolError::MalformedBody {
                kind: RecordType::BeginRequest,
                len: content.len(),
            });
        }
        let (body, _): (BeginRequestBody, usize) = decode_from_slice(content, wire_config())?;
        Ok(Self {
            role: body.role.into(),
            keep_connection: body.flags & KEEP_CONN != 0,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let body = BeginRequestBody {
            role: self.role.into(),
            flags: if self.keep_connection { KEEP_CONN } else { 0 },
            reserved: [0; 5],
        };
        encode_to_vec(body, wire_config())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMpxConn,
    Overloaded,
    UnknownRole,
}

impl From<ProtocolStatus> for u8 {
    fn from(value: ProtocolStatus) -> Self {
        match value {
            ProtocolStatus::RequestComplete => 0,
            ProtocolStatus::CantMpxConn => 1,
            ProtocolStatus::Overloaded => 2,
            ProtocolStatus::UnknownRole => 3,
        }
    }
}

impl TryFrom<u8> for ProtocolStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProtocolStatus::RequestComplete),
            1 => Ok(ProtocolStatus::CantMpxConn),
            2 => Ok(ProtocolStatus::Overloaded),
            3 => Ok(ProtocolStatus::UnknownRole),
            other => Err(other),
        }
    }
}

#[derive(Debug, Encode, Decode)]
struct EndRequestBody {
    app_status: u32,
    protocol_status: u8,
    reserved: [u8; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    pub fn new(app_status: u32, protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status,
            protocol_status,
        }
    }

    pub fn decode(content: &[u8]) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedBody {
            kind: RecordType::EndRequest,
            len: content.len(),
        };
        if content.len() != BODY_LEN {
            return Err(malformed());
        }
        let (body, _): (EndRequestBody, usize) = decode_from_slice(content, wire_config())?;
        Ok(Self {
            app_status: body.app_status,
            protocol_status: body.protocol_status.try_into().map_err(|_| malformed())?,
        })
    }

    pub fn record(&self, request_id: u16) -> Result<Record, bincode::error::EncodeError> {
        let body = EndRequestBody {
            app_status: self.app_status,
            protocol_status: self.protocol_status.into(),
            reserved: [0; 3],
        };
        let content = encode_to_vec(body, wire_config())?;
        Ok(Record::new(RecordType::EndRequest, request_id, content))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    AccumulatingStreams,
    Dispatched,
    Responding,
    Complete,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Complete | RequestState::Aborted)
    }
}

/// Result of feeding an input record to a request.
#[derive(Debug)]
pub enum Progress {
    Pending,
    /// Both input streams are closed; the request must be dispatched now.
    /// Produced at most once per request.
    Ready(Request),
}

/// What the connection owes the peer after an `AbortRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// Nothing was dispatched; send the `EndRequest` now.
    Immediate,
    /// The handler is running; the dispatcher sends the `EndRequest` when it
    /// returns.
    Deferred,
    /// Output is already committed, or the request already finished.
    Ignored,
}

/// One open request, owned by its connection's request table.
#[derive(Debug)]
pub struct PendingRequest {
    id: u16,
    role: Role,
    keep_connection: bool,
    state: RequestState,
    assembler: Option<Assembler>,
    aborted: Arc<AtomicBool>,
}

impl PendingRequest {
    pub fn new(id: u16, begin: BeginRequest) -> Self {
        Self {
            id,
            role: begin.role,
            keep_connection: begin.keep_connection,
            state: RequestState::Created,
            assembler: Some(Assembler::new(id)),
            aborted: Arc::default(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn keep_connection(&self) -> bool {
        self.keep_connection
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Leaves `Created`. Only the responder role is served; anything else
    /// completes immediately with the returned `UNKNOWN_ROLE` answer.
    pub fn accept(&mut self) -> Result<(), EndRequest> {
        debug_assert_eq!(self.state, RequestState::Created);
        if self.role != Role::Responder {
            self.state = RequestState::Complete;
            self.assembler = None;
            return Err(EndRequest::new(0, ProtocolStatus::UnknownRole));
        }
        self.state = RequestState::AccumulatingStreams;
        Ok(())
    }

    /// Feeds a `Params` or `Stdin` record.
    pub fn on_input(&mut self, kind: RecordType, content: &[u8]) -> Result<Progress, ProtocolError> {
        let assembler = match (self.state, self.assembler.as_mut()) {
            (RequestState::AccumulatingStreams, Some(assembler)) => assembler,
            _ => {
                return Err(ProtocolError::StreamReopened {
                    id: self.id,
                    stream: kind,
                });
            }
        };

        match kind {
            RecordType::Params => assembler.on_params(content)?,
            RecordType::Stdin => assembler.on_stdin(content)?,
            _ => return Ok(Progress::Pending),
        }
        if !assembler.is_ready() {
            return Ok(Progress::Pending);
        }

        let Some((params, body)) = self.assembler.take().and_then(Assembler::finish) else {
            return Ok(Progress::Pending);
        };
        self.state = RequestState::Dispatched;
        Ok(Progress::Ready(Request::with_abort_flag(
            self.id,
            params,
            body,
            Arc::clone(&self.aborted),
        )))
    }

    pub fn abort(&mut self) -> AbortOutcome {
        match self.state {
            RequestState::Created | RequestState::AccumulatingStreams => {
                self.state = RequestState::Aborted;
                self.assembler = None;
                self.aborted.store(true, Ordering::Release);
                AbortOutcome::Immediate
            }
            RequestState::Dispatched => {
                self.state = RequestState::Aborted;
                self.aborted.store(true, Ordering::Release);
                AbortOutcome::Deferred
            }
            RequestState::Responding | RequestState::Complete | RequestState::Aborted => {
                AbortOutcome::Ignored
            }
        }
    }

    /// `Dispatched → Responding`. Returns false when the request was aborted
    /// while its handler ran, in which case the output must be dropped.
    pub fn start_responding(&mut self) -> bool {
        if self.state != RequestState::Dispatched {
            return false;
        }
        self.state = RequestState::Responding;
        true
    }

    pub fn complete(&mut self) {
        if self.state != RequestState::Aborted {
            self.state = RequestState::Complete;
        }
    }

    /// Forced cancellation when the owning connection goes away.
    pub fn cancel(&mut self) {
        self.aborted.store(true, Ordering::Release);
        self.assembler = None;
        if !self.state.is_terminal() {
            self.state = RequestState::Aborted;
        }
    }
}
