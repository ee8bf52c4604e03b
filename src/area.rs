//! Point-in-area checker served by the `fcgid` binary.
//!
//! The area is the union of three shapes scaled by `r`:
//!
//! ```text
//!           y
//!           │
//!      ╱╲   ├────┐
//!     ╱  ╲  │    │  square:   0 ≤ x ≤ r, 0 ≤ y ≤ r
//!    ╱    ╲ │    │  triangle: x ≤ 0, y ≥ 0, |x| + y ≤ r
//!  ─┴──────┼┴────┴── x
//!    ╲    ╱│        circle:   x ≤ 0, y ≤ 0, x² + y² ≤ r²
//!      ──  │
//! ```
//!
//! Coordinates arrive as `x=..&y=..&r=..`, in `QUERY_STRING` for `GET` or
//! as a form-urlencoded body for `POST`. Every answer is a CGI response with
//! a JSON body.
use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use log::debug;
use serde::Serialize;
use thiserror::Error;
use url::form_urlencoded;

use crate::handler::{Handler, HandlerError, Request, Response};

pub const VALID_X: [f64; 9] = [-2.0, -1.5, -1.0, -0.5, 0.0, 0.5, 1.0, 1.5, 2.0];
pub const Y_RANGE: (f64, f64) = (-3.0, 5.0);
pub const R_RANGE: (f64, f64) = (1.0, 4.0);

/// Attempts [`AreaCheck::new`] remembers before dropping the oldest.
pub const DEFAULT_HISTORY: usize = 1024;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Error, PartialEq)]
pub enum AreaError {
    #[error("Missing query string")]
    MissingQuery,

    #[error("x, y and r must be numbers")]
    NotANumber,

    #[error("{}", .0.join("; "))]
    OutOfRange(Vec<&'static str>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub r: f64,
}

impl Point {
    /// Parses `x`, `y` and `r` out of a form-urlencoded string. Later
    /// occurrences of a name win.
    pub fn from_query(query: &[u8]) -> Result<Self, AreaError> {
        if query.is_empty() {
            return Err(AreaError::MissingQuery);
        }

        let (mut x, mut y, mut r) = (None, None, None);
        for (name, value) in form_urlencoded::parse(query) {
            let slot = match name.as_ref() {
                "x" => &mut x,
                "y" => &mut y,
                "r" => &mut r,
                _ => continue,
            };
            *slot = Some(value.trim().parse::<f64>().map_err(|_| AreaError::NotANumber)?);
        }

        match (x, y, r) {
            (Some(x), Some(y), Some(r)) => Ok(Self { x, y, r }),
            _ => Err(AreaError::NotANumber),
        }
    }

    pub fn validate(&self) -> Result<(), AreaError> {
        let mut problems = Vec::new();
        if !VALID_X.contains(&self.x) {
            problems.push("x must be one of -2, -1.5, -1, -0.5, 0, 0.5, 1, 1.5, 2");
        }
        if !(Y_RANGE.0..=Y_RANGE.1).contains(&self.y) {
            problems.push("y must be between -3 and 5");
        }
        if !(R_RANGE.0..=R_RANGE.1).contains(&self.r) {
            problems.push("r must be between 1 and 4");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AreaError::OutOfRange(problems))
        }
    }

    pub fn is_hit(&self) -> bool {
        let Point { x, y, r } = *self;

        let square = x >= 0.0 && y >= 0.0 && x <= r && y <= r;
        let triangle = x <= 0.0 && y >= 0.0 && x.abs() + y <= r;
        let circle = x <= 0.0 && y <= 0.0 && x * x + y * y <= r * r;
        square || triangle || circle
    }
}

/// Outcome of one successful check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Attempt {
    pub x: f64,
    pub y: f64,
    pub r: f64,
    /// Nanoseconds spent on the hit test.
    pub time: u64,
    /// Unix time in milliseconds.
    pub now: u64,
    pub result: bool,
}

#[derive(Debug, Serialize)]
struct Failure {
    now: u64,
    reason: String,
}

/// The bundled [`Handler`]. The most recent successful attempts are kept
/// in memory, at most `history` of them; older ones are dropped first.
#[derive(Debug)]
pub struct AreaCheck {
    attempts: Mutex<VecDeque<Attempt>>,
    history: usize,
}

impl Default for AreaCheck {
    fn default() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }
}

impl AreaCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// A checker remembering up to `history` attempts. Zero keeps none.
    pub fn with_history(history: usize) -> Self {
        Self {
            attempts: Mutex::new(VecDeque::with_capacity(history.min(DEFAULT_HISTORY))),
            history,
        }
    }

    /// Remembered attempts, oldest first.
    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn check(&self, request: &Request) -> Result<Attempt, AreaError> {
        let point = Point::from_query(&query_of(request)?)?;
        point.validate()?;

        let started = Instant::now();
        let result = point.is_hit();
        let time = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let attempt = Attempt {
            x: point.x,
            y: point.y,
            r: point.r,
            time,
            now: unix_millis(),
            result,
        };
        if self.history > 0 {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            if attempts.len() == self.history {
                attempts.pop_front();
            }
            attempts.push_back(attempt);
        }
        Ok(attempt)
    }
}

impl Handler for AreaCheck {
    fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        let (status, json) = match self.check(request) {
            Ok(attempt) => (200, serde_json::to_string(&attempt)),
            Err(e) => {
                debug!("request {} rejected: {e}", request.id());
                let failure = Failure {
                    now: unix_millis(),
                    reason: e.to_string(),
                };
                (400, serde_json::to_string(&failure))
            }
        };
        let json = json.map_err(|e| HandlerError::Source(Box::new(e)))?;

        Ok(Response::new(status, cgi_document(status, &json)))
    }
}

fn query_of(request: &Request) -> Result<Vec<u8>, AreaError> {
    let method = request.param("REQUEST_METHOD").unwrap_or("GET");
    if method.eq_ignore_ascii_case("POST") {
        let is_form = request
            .param("CONTENT_TYPE")
            .is_some_and(|kind| kind.starts_with(FORM_CONTENT_TYPE));
        if !is_form || request.body().is_empty() {
            return Err(AreaError::MissingQuery);
        }
        return Ok(request.body().to_vec());
    }

    match request.param("QUERY_STRING") {
        Some(query) if !query.is_empty() => Ok(query.as_bytes().to_vec()),
        _ => Err(AreaError::MissingQuery),
    }
}

fn cgi_document(status: u32, json: &str) -> String {
    let reason = match status {
        200 => "OK",
        _ => "Bad Request",
    };
    format!(
        "Status: {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{json}",
        json.len()
    )
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
