//! Client runtime for the Proxy Manager protocol: server objects appear as
//! local proxies whose properties, methods and events are synchronised with
//! the server over an exchange of JSON command lists.

mod config;
mod data;
mod error;
pub mod protocol;
pub mod transport;

pub use config::SessionConfig;
pub use data::*;
pub use error::Error;
pub use transport::{ThreadedTransport, Transport, TransportRequest, TransportResponse};

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test;
