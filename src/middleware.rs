//! Middleware chaining.
//!
//! A [`Handler`] turns a request into a response. A [`Middleware`] receives
//! the request together with the `next` handler and decides whether, and
//! how, to call it. [`build_chain`] folds a list of middleware around a
//! final handler so that index 0 runs first on the way in and last on the
//! way out.
//!
//! # Example
//!
//! ```
//! use bitrpc::middleware::{build_chain, handler_fn, middleware_fn};
//! use bitrpc::serialize::{BoxMessage, Empty};
//! use bitrpc::{Context, RpcError};
//!
//! let auth = middleware_fn(|ctx: Context, req: BoxMessage, next| async move {
//!     if ctx.metadata().get_str("token") != Some("1234") {
//!         return Err(RpcError::MiddlewareRejected("unauthorized".into()));
//!     }
//!     next(ctx, req).await
//! });
//! let handler = handler_fn(|_ctx, _req| async { Ok(Box::new(Empty) as BoxMessage) });
//! let _chain = build_chain(&[auth], handler);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;
use crate::serialize::BoxMessage;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased request handler.
pub type Handler =
    Arc<dyn Fn(Context, BoxMessage) -> BoxFuture<'static, Result<BoxMessage>> + Send + Sync>;

/// Type-erased middleware: request, context and the continuation.
pub type Middleware = Arc<
    dyn Fn(Context, BoxMessage, Handler) -> BoxFuture<'static, Result<BoxMessage>> + Send + Sync,
>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Context, BoxMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxMessage>> + Send + 'static,
{
    Arc::new(
        move |ctx: Context, msg: BoxMessage| -> BoxFuture<'static, Result<BoxMessage>> {
            Box::pin(f(ctx, msg))
        },
    )
}

/// Wrap an async closure as a [`Middleware`].
pub fn middleware_fn<F, Fut>(f: F) -> Middleware
where
    F: Fn(Context, BoxMessage, Handler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxMessage>> + Send + 'static,
{
    Arc::new(
        move |ctx: Context, msg: BoxMessage, next: Handler| -> BoxFuture<'static, Result<BoxMessage>> {
            Box::pin(f(ctx, msg, next))
        },
    )
}

/// Compose `middleware` around `handler`.
///
/// Folds from the last middleware inward, so `middleware[0]` is the
/// outermost layer. An empty list returns `handler` itself.
pub fn build_chain(middleware: &[Middleware], handler: Handler) -> Handler {
    middleware.iter().rev().fold(handler, |next, mw| {
        let mw = Arc::clone(mw);
        Arc::new(
            move |ctx: Context, msg: BoxMessage| -> BoxFuture<'static, Result<BoxMessage>> {
                mw(ctx, msg, Arc::clone(&next))
            },
        )
    })
}

/// Build the chain and invoke it once.
pub fn apply_chain(
    middleware: &[Middleware],
    ctx: Context,
    msg: BoxMessage,
    handler: Handler,
) -> BoxFuture<'static, Result<BoxMessage>> {
    build_chain(middleware, handler)(ctx, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::serialize::Empty;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn recorder(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Middleware {
        middleware_fn(move |ctx, msg, next: Handler| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{name}-pre"));
                let resp = next(ctx, msg).await;
                log.lock().unwrap().push(format!("{name}-post"));
                resp
            }
        })
    }

    #[tokio::test]
    async fn test_chain_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            recorder(Arc::clone(&log), "A"),
            recorder(Arc::clone(&log), "B"),
            recorder(Arc::clone(&log), "C"),
        ];
        let inner_log = Arc::clone(&log);
        let handler = handler_fn(move |_ctx, msg| {
            let log = Arc::clone(&inner_log);
            async move {
                log.lock().unwrap().push("handler".into());
                Ok(msg)
            }
        });

        apply_chain(&chain, Context::new(), Box::new(Empty), handler)
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["A-pre", "B-pre", "C-pre", "handler", "C-post", "B-post", "A-post"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reject = middleware_fn(|_ctx, _msg, _next| async {
            Err(RpcError::MiddlewareRejected("unauthorized".into()))
        });
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_ctx, msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(msg) }
        });

        let err = apply_chain(&[reject], Context::new(), Box::new(Empty), handler)
            .await
            .err().unwrap();
        assert_eq!(err.to_string(), "unauthorized");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_is_handler() {
        let handler = handler_fn(|_ctx, msg| async move { Ok(msg) });
        let resp = apply_chain(&[], Context::new(), Box::new(Empty), handler)
            .await
            .unwrap();
        assert!(resp.as_any().is::<Empty>());
    }
}
