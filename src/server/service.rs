//! Typed service handlers.
//!
//! A [`ServiceHandler`] receives a request still encoded in its reader and
//! the middleware stack inherited from its group. [`Service`] is the
//! standard implementation: one typed async handler per method id.
//!
//! # Example
//!
//! ```ignore
//! let counter = Service::new().method(INCREMENT, |_ctx, req: Counter| async move {
//!     Ok(Counter { count: req.count + 1 })
//! });
//! server.register_service(COUNTER_SERVICE, "counter", counter)?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::middleware::{build_chain, handler_fn, BoxFuture, Handler, Middleware};
use crate::serialize::{downcast, BitReader, BoxMessage, Message};

/// Decodes a typed message from a reader positioned at the payload.
pub(crate) type Decode = fn(&mut BitReader) -> Result<BoxMessage>;

pub(crate) fn decode<M: Message>(reader: &mut BitReader) -> Result<BoxMessage> {
    Ok(Box::new(M::deserialize(reader)?))
}

/// Dispatches the methods of one registered service.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Decode the request for `method_id`, run it through `middleware`
    /// and produce the response.
    fn call(
        &self,
        ctx: Context,
        service_id: u64,
        method_id: u64,
        reader: BitReader,
        middleware: &[Middleware],
    ) -> BoxFuture<'static, Result<BoxMessage>>;
}

struct MethodEntry {
    decode: Decode,
    handler: Handler,
}

/// A [`ServiceHandler`] built from typed per-method closures.
#[derive(Default)]
pub struct Service {
    methods: HashMap<u64, MethodEntry>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `method_id`, replacing any previous one.
    pub fn method<Req, Resp, F, Fut>(mut self, method_id: u64, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let handler = handler_fn(move |ctx: Context, request: BoxMessage| {
            let response = downcast::<Req>(request).map(|req| handler(ctx, req));
            async move { Ok(Box::new(response?.await?) as BoxMessage) }
        });
        self.methods.insert(
            method_id,
            MethodEntry {
                decode: decode::<Req>,
                handler,
            },
        );
        self
    }

    pub fn has_method(&self, method_id: u64) -> bool {
        self.methods.contains_key(&method_id)
    }
}

impl ServiceHandler for Service {
    fn call(
        &self,
        ctx: Context,
        service_id: u64,
        method_id: u64,
        mut reader: BitReader,
        middleware: &[Middleware],
    ) -> BoxFuture<'static, Result<BoxMessage>> {
        let Some(entry) = self.methods.get(&method_id) else {
            return Box::pin(async move {
                Err(RpcError::MethodNotFound {
                    service_id,
                    method_id,
                })
            });
        };
        let request = match (entry.decode)(&mut reader) {
            Ok(request) => request,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        build_chain(middleware, Arc::clone(&entry.handler))(ctx, request)
    }
}
