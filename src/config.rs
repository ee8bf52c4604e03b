//! Server configuration.
//!
//! [`ServerConfig`] is built once at startup, validated, and then shared
//! read-only by the listener and every connection.
//!
//! # Example
//! ```rust
//! use fcgid::{ListenAddress, ServerConfig};
//!
//! let address: ListenAddress = "127.0.0.1:9000".parse().unwrap();
//! let config = ServerConfig::new(address).with_multiplex(true);
//! assert!(config.validate().is_ok());
//! ```
use std::{fmt, net::SocketAddr, str::FromStr};

#[cfg(unix)]
use std::path::PathBuf;

use thiserror::Error;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:9000";
pub const DEFAULT_MAX_CONNECTIONS: usize = 15;
pub const DEFAULT_MAX_REQUESTS: usize = 64;
pub const DEFAULT_FAILURE_STATUS: u32 = 500;
pub const DEFAULT_ABORTED_STATUS: u32 = 499;

const UNIX_PREFIX: &str = "unix:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address '{0}': expected HOST:PORT or unix:/path")]
    Address(String),

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

/// Where the server accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl FromStr for ListenAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            #[cfg(unix)]
            if !path.is_empty() {
                return Ok(ListenAddress::Unix(PathBuf::from(path)));
            }
            let _ = path;
            return Err(ConfigError::Address(s.to_string()));
        }
        s.parse()
            .map(ListenAddress::Tcp)
            .map_err(|_| ConfigError::Address(s.to_string()))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            ListenAddress::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: ListenAddress,
    /// Allow more than one open request per connection.
    pub multiplex: bool,
    /// Connection worker pool size; also reported as `FCGI_MAX_CONNS`.
    pub max_connections: usize,
    /// Request worker pool size and per-connection cap on open requests
    /// when multiplexing.
    pub max_requests: usize,
    /// Application status sent when a handler fails.
    pub failure_status: u32,
    /// Application status sent for an aborted request.
    pub aborted_status: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ListenAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], 9000))),
            multiplex: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_requests: DEFAULT_MAX_REQUESTS,
            failure_status: DEFAULT_FAILURE_STATUS,
            aborted_status: DEFAULT_ABORTED_STATUS,
        }
    }
}

impl ServerConfig {
    pub fn new(address: ListenAddress) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_multiplex(mut self, multiplex: bool) -> Self {
        self.multiplex = multiplex;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_failure_status(mut self, status: u32) -> Self {
        self.failure_status = status;
        self
    }

    pub fn with_aborted_status(mut self, status: u32) -> Self {
        self.aborted_status = status;
        self
    }

    /// Requests one connection may hold open at the same time.
    pub fn requests_per_connection(&self) -> usize {
        if self.multiplex { self.max_requests } else { 1 }
    }

    /// Value reported as `FCGI_MAX_REQS`.
    pub fn max_concurrent_requests(&self) -> usize {
        if self.multiplex {
            self.max_requests
        } else {
            self.max_connections
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroLimit("max_connections"));
        }
        if self.max_requests == 0 {
            return Err(ConfigError::ZeroLimit("max_requests"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_address() {
        let address: ListenAddress = "0.0.0.0:9000".parse().unwrap();
        assert_eq!(address, ListenAddress::Tcp("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(address.to_string(), "0.0.0.0:9000");
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_address() {
        let address: ListenAddress = "unix:/run/fcgid.sock".parse().unwrap();
        assert_eq!(address, ListenAddress::Unix("/run/fcgid.sock".into()));
        assert_eq!(address.to_string(), "unix:/run/fcgid.sock");
    }

    #[test]
    fn rejects_address_without_port() {
        let err = "localhost".parse::<ListenAddress>().unwrap_err();
        assert!(matches!(err, ConfigError::Address(ref s) if s == "localhost"));
        assert_eq!(
            err.to_string(),
            "invalid listen address 'localhost': expected HOST:PORT or unix:/path"
        );
    }

    #[test]
    fn rejects_empty_socket_path() {
        assert!("unix:".parse::<ListenAddress>().is_err());
    }

    #[test]
    fn default_address_matches_constant() {
        assert_eq!(
            ServerConfig::default().address,
            DEFAULT_ADDRESS.parse().unwrap()
        );
    }

    #[test]
    fn limits_follow_multiplexing() {
        let config = ServerConfig::default()
            .with_max_connections(3)
            .with_max_requests(10);
        assert_eq!(config.requests_per_connection(), 1);
        assert_eq!(config.max_concurrent_requests(), 3);

        let config = config.with_multiplex(true);
        assert_eq!(config.requests_per_connection(), 10);
        assert_eq!(config.max_concurrent_requests(), 10);
    }

    #[test]
    fn status_codes_can_be_overridden() {
        let config = ServerConfig::default();
        assert_eq!(config.failure_status, DEFAULT_FAILURE_STATUS);
        assert_eq!(config.aborted_status, DEFAULT_ABORTED_STATUS);

        let config = config.with_failure_status(503).with_aborted_status(444);
        assert_eq!(config.failure_status, 503);
        assert_eq!(config.aborted_status, 444);
    }

    #[test]
    fn zero_limits_are_invalid() {
        let err = ServerConfig::default().with_max_requests(0).validate();
        assert!(matches!(err, Err(ConfigError::ZeroLimit("max_requests"))));
    }
}
