//! Error types for the proxy runtime.

use thiserror::Error;

/// Every failure the runtime can surface, either raised at a blocking call
/// site or delivered to an asynchronous completion.
///
/// The enum is `Clone` because one failed request rejects every call that
/// travelled with it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The server-side method threw
    #[error("Server exception {class}: {message}")]
    Server { class: String, message: String },

    /// The server refused a property write and sent back the prior value
    #[error("Server rejected value for property {property} ({class}): {message}")]
    PropertyRejected {
        property: String,
        class: String,
        message: String,
    },

    /// Non-200 status, connection failure or anything else the transport reports
    #[error("Transport error (status {status}): {message}")]
    Transport { status: u16, message: String },

    /// A blocking call gave up waiting for its request
    #[error("Timed out waiting for request {0}")]
    Timeout(u64),

    /// A response arrived for a request index that has already been applied
    #[error("Response for request {received} arrived but request {expected} is next")]
    Sequence { received: u64, expected: u64 },

    /// A server object reference with no class data and no local instance
    #[error("Cannot resolve server object {0}: no class data and no local instance")]
    UnresolvedReference(i64),

    /// A client-minted id was looked up after it was promoted or retired
    #[error("Client id {0} is no longer valid")]
    StaleClientId(i64),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Unknown class: {0}")]
    UnknownClass(String),

    #[error("Unknown property {property} on {class}")]
    UnknownProperty { class: String, property: String },

    #[error("Unknown method {method} on {class}")]
    UnknownMethod { class: String, method: String },

    #[error("Unknown event {event} on {class}")]
    UnknownEvent { class: String, event: String },

    #[error("Property {property} on {class} is read-only")]
    ReadOnlyProperty { class: String, property: String },

    #[error("Object has been disposed")]
    Disposed,

    #[error("Session has been shut down")]
    Shutdown,

    /// The session that owned an object has been dropped
    #[error("Session is no longer available")]
    SessionGone,

    #[error("Digest mismatch on response to request {0}")]
    DigestMismatch(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cannot cast {0} to {1}")]
    BadValueCast(String, String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Fatal errors stop processing of the response that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Sequence { .. }
                | Error::UnresolvedReference(_)
                | Error::DigestMismatch(_)
                | Error::Decode(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Decode(error.to_string())
    }
}
