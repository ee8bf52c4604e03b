pub mod area;
pub mod config;
pub mod handler;
pub mod protocol;

pub use area::AreaCheck;
pub use config::{ConfigError, ListenAddress, ServerConfig};
pub use handler::{Handler, HandlerError, Request, Response};
pub use protocol::{Server, ServerError, ServerHandle};
