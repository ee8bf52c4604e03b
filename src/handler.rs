//! Bridge between the protocol engine and application logic.
//!
//! Once a request's `Params` and `Stdin` streams are complete the engine
//! hands a [`Request`] to a [`Handler`] and frames the returned
//! [`Response`] back to the peer: `body` as `Stdout`, `stderr` as `Stderr`
//! and `status` as the application status of the `EndRequest` record. Both
//! byte fields are opaque to the engine.
//!
//! # Example
//! ```rust
//! use fcgid::{HandlerError, Request, Response};
//!
//! fn echo(request: &Request) -> Result<Response, HandlerError> {
//!     let method = request.param("REQUEST_METHOD").unwrap_or("GET");
//!     Ok(Response::new(200, format!("method: {method}")))
//! }
//! ```
use std::{
    any::Any,
    error::Error as StdError,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;

use crate::protocol::params::Params;

/// Failure reported by application logic. The engine answers it with a
/// non-zero application status and keeps the connection open.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Source(Box<dyn StdError + Send + Sync>),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl From<Box<dyn StdError + Send + Sync>> for HandlerError {
    fn from(value: Box<dyn StdError + Send + Sync>) -> Self {
        HandlerError::Source(value)
    }
}

/// A fully assembled request.
#[derive(Debug, Clone)]
pub struct Request {
    id: u16,
    params: Params,
    body: Vec<u8>,
    aborted: Arc<AtomicBool>,
}

impl Request {
    pub fn new(id: u16, params: Params, body: Vec<u8>) -> Self {
        Self::with_abort_flag(id, params, body, Arc::default())
    }

    pub(crate) fn with_abort_flag(
        id: u16,
        params: Params,
        body: Vec<u8>,
        aborted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            params,
            body,
            aborted,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Set once the peer aborts the request or its connection goes away.
    /// Long-running handlers may poll it and return early; whatever they
    /// return afterwards is discarded.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: u32,
    pub body: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Response {
    pub fn new(status: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            stderr: Vec::new(),
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

/// Application logic invoked once per dispatched request. Handlers run on
/// worker threads when the connection multiplexes, so they must be
/// shareable.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request) -> Result<Response, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        self(request)
    }
}

/// Runs a handler, turning a panic into [`HandlerError::Panicked`].
pub(crate) fn invoke(handler: &dyn Handler, request: &Request) -> Result<Response, HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request)))
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
