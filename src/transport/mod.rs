//! Transport abstraction.
//!
//! The RPC sessions only need a duplex channel of whole messages:
//!
//! - [`Connection`]: send one message, receive one, close
//! - [`ServerTransport`]: listen, accept connections, close
//! - [`ClientTransport`]: dial a connection
//! - [`ServiceAware`]: optional capability for transports that route by
//!   service (topic-based buses), discovered via
//!   [`ServerTransport::as_service_aware`]
//!
//! Two transports are bundled: an in-process [`memory`] transport and a
//! length-delimited [`unix`] domain socket transport.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::middleware::BoxFuture;

pub mod framing;
pub mod memory;
#[cfg(unix)]
pub mod unix;
#[cfg(unix)]
mod writer;

pub use memory::{
    memory_transport, memory_transport_with_limit, MemoryConnection, MemoryDialer, MemoryListener,
};
#[cfg(unix)]
pub use unix::{generate_socket_path, UnixClientTransport, UnixConnection, UnixServerTransport};

/// Default per-message size limit of the bundled transports (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A duplex, message-oriented connection.
///
/// `send` may be called from many tasks at once; `receive` is driven by a
/// single reader task. After an orderly close both fail with
/// [`RpcError::ConnectionClosed`](crate::RpcError::ConnectionClosed).
pub trait Connection: Send + Sync + 'static {
    /// Send one complete message.
    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Wait for the next complete message.
    fn receive(&self) -> BoxFuture<'_, Result<Bytes>>;

    /// Close both directions. Idempotent.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Server side of a transport.
pub trait ServerTransport: Send + Sync + 'static {
    /// Start listening.
    fn listen(&self) -> BoxFuture<'_, Result<()>>;

    /// Wait for the next inbound connection.
    ///
    /// Fails with `ConnectionClosed` once the transport has been closed.
    fn accept(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>>;

    /// Stop accepting. Unblocks a pending `accept`.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// The service-routing capability, if this transport has one.
    fn as_service_aware(&self) -> Option<&dyn ServiceAware> {
        None
    }
}

/// Client side of a transport.
pub trait ClientTransport: Send + Sync + 'static {
    /// Establish a new connection.
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>>;
}

/// Transports that must learn about each registered service.
pub trait ServiceAware: Send + Sync {
    fn register_service(&self, service_id: u64, name: &str) -> Result<()>;
}
