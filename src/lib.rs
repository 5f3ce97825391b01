//! # bitrpc
//!
//! RPC framework over a bit-packed binary wire format.
//!
//! ## Architecture
//!
//! - **Value codec** ([`serialize`]): primitives and containers packed at
//!   bit granularity, with variable-length and zigzag integer encodings
//! - **Session protocol** ([`client`], [`server`]): 16-byte-prefixed frames
//!   over any duplex [`Connection`](transport::Connection), concurrent
//!   calls correlated by request id, middleware on both ends
//! - **Streams** ([`stream`]): bidirectional sub-channels multiplexed on one
//!   connection after an open handshake
//!
//! ## Example
//!
//! ```ignore
//! use bitrpc::transport::memory_transport;
//! use bitrpc::{impl_message, Client, Context, Server, Service};
//!
//! #[derive(Debug)]
//! struct Counter { count: u32 }
//! impl_message!(Counter { count });
//!
//! #[tokio::main]
//! async fn main() -> bitrpc::Result<()> {
//!     let (listener, dialer) = memory_transport();
//!
//!     let server = Server::new(listener);
//!     server.register_service(1, "counter", Service::new().method(1, |_ctx, req: Counter| async move {
//!         Ok(Counter { count: req.count + 1 })
//!     }))?;
//!     tokio::spawn({
//!         let server = server.clone();
//!         async move { server.listen_and_serve().await }
//!     });
//!
//!     let client = Client::new(dialer);
//!     let reply: Counter = client.call(&Context::new(), 1, 1, Counter { count: 5 }).await?;
//!     assert_eq!(reply.count, 6);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod metadata;
pub mod middleware;
pub mod protocol;
pub mod serialize;
pub mod server;
pub mod stream;
pub mod transport;

mod pending;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use context::{CancelHandle, Context};
pub use error::{ErrorHandler, Result, RpcError};
pub use metadata::Metadata;
pub use serialize::{Empty, Message};
pub use server::{Server, Service, ServiceHandler};
pub use stream::{processor_fn, MessageProcessor, Stream, StreamRouter};
