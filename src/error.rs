//! Error types for bitrpc.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

/// Main error type for all bitrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration and message JSON forms).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The reader ran out of bits before a value was complete.
    #[error("truncated input: needed {needed} bits, {available} available")]
    TruncatedInput {
        /// Bits required by the read.
        needed: usize,
        /// Bits left in the buffer.
        available: usize,
    },

    /// A decoded string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Frame prefix did not match any known frame kind.
    #[error("unknown frame prefix: {0:02x?}")]
    UnknownPrefix([u8; 16]),

    /// A known frame kind arrived where it is not accepted.
    #[error("unrecognized frame: {0}")]
    UnrecognizedFrame(String),

    /// No service registered under this ID.
    #[error("service with id {0} not found")]
    ServiceNotFound(u64),

    /// The service exists but has no such method.
    #[error("method {method_id} not found on service {service_id}")]
    MethodNotFound {
        /// Service ID of the request.
        service_id: u64,
        /// Method ID of the request.
        method_id: u64,
    },

    /// No stream handler registered under (service, method).
    #[error("stream handler for service {service_id} method {method_id} not found")]
    StreamHandlerNotFound {
        /// Service ID of the stream open.
        service_id: u64,
        /// Method ID of the stream open.
        method_id: u64,
    },

    /// A stream frame addressed a stream that does not exist.
    #[error("stream with id {0} not found")]
    StreamNotFound(u64),

    /// Duplicate service or stream handler registration.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// Message exceeds the transport byte-size limit.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the offending message.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A middleware short-circuited the chain.
    #[error("{0}")]
    MiddlewareRejected(String),

    /// The peer answered with an error response.
    #[error("{0}")]
    Remote(String),

    /// Connection closed (orderly shutdown or peer went away).
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream was closed by either peer.
    #[error("stream closed")]
    StreamClosed,

    /// The caller cancelled the context.
    #[error("context cancelled")]
    ContextCancelled,

    /// The caller's deadline passed before the response arrived.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The server refused the request because its handler capacity is exhausted.
    #[error("server busy")]
    ServerBusy,

    /// Protocol violation (bad discriminator, id collision, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// Whether this is the expected end-of-connection condition rather than a fault.
    #[inline]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Operator callback for errors that have no caller to return to.
pub type ErrorHandler = Arc<dyn Fn(&RpcError) + Send + Sync>;

/// Route an error to the operator hook. `ConnectionClosed` is an expected
/// lifecycle event and never reaches the hook.
pub(crate) fn report(handler: Option<&ErrorHandler>, err: &RpcError) {
    if err.is_connection_closed() {
        debug!("connection closed");
        return;
    }
    match handler {
        Some(handler) => {
            debug!(error = %err, "reporting error to handler");
            handler(err);
        }
        None => warn!(error = %err, "unhandled rpc error"),
    }
}
