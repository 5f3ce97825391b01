//! Client session.
//!
//! The [`Client`] owns at most one connection at a time and establishes it
//! lazily on the first call. A background reader task demultiplexes
//! inbound frames: responses complete the caller waiting on that request
//! id, stream frames go to the addressed [`Stream`].
//!
//! When the reader hits an I/O or protocol error the session is dropped,
//! every pending call fails with `ConnectionClosed`, and the next call
//! reconnects.
//!
//! # Example
//!
//! ```ignore
//! use bitrpc::{Client, Context};
//!
//! let client = Client::new(dialer);
//! let ctx = Context::new().with_timeout(Duration::from_secs(1));
//! let reply: Counter = client.call(&ctx, COUNTER_SERVICE, INCREMENT, Counter { count: 5 }).await?;
//! ```

use std::sync::{Arc, PoisonError, RwLock, Weak};

use bytes::Bytes;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::config::{check_size, ClientConfig};
use crate::context::Context;
use crate::error::{report, ErrorHandler, Result, RpcError};
use crate::middleware::{build_chain, handler_fn, Middleware};
use crate::pending::{IdSequence, PendingTable};
use crate::protocol::{
    encode_request, encode_stream_open, read_response_body, read_response_id, FrameKind,
};
use crate::serialize::{downcast, BitReader, BoxMessage, Empty, Message};
use crate::stream::{MessageProcessor, Stream, StreamLink, StreamTable};
use crate::transport::{ClientTransport, Connection};

/// One established connection and everything correlated on it.
struct Session {
    link: StreamLink,
    pending: PendingTable,
    request_ids: IdSequence,
    stream_ids: IdSequence,
    /// Flipped when the owning client goes away; stops the reader task.
    abandoned: watch::Sender<bool>,
}

impl Session {
    fn new(conn: Arc<dyn Connection>, on_error: Option<ErrorHandler>, max_message_size: usize) -> Self {
        Self {
            link: StreamLink {
                conn,
                table: Arc::new(StreamTable::new()),
                on_error,
                max_message_size,
            },
            pending: PendingTable::new(|| RpcError::ConnectionClosed),
            request_ids: IdSequence::new(),
            stream_ids: IdSequence::starting_at(1),
            abandoned: watch::channel(false).0,
        }
    }

    #[inline]
    fn conn(&self) -> &Arc<dyn Connection> {
        &self.link.conn
    }

    /// Route one inbound frame.
    ///
    /// An error means the frame stream itself is corrupt and the session
    /// must be dropped. Failures confined to one stream frame are reported
    /// and swallowed.
    fn dispatch(&self, frame: Bytes) -> Result<()> {
        let mut reader = BitReader::new(frame);
        let kind = FrameKind::read(&mut reader)?;
        match kind {
            FrameKind::Response => {
                let request_id = read_response_id(&mut reader)?;
                if !self.pending.complete(request_id, reader) {
                    debug!(request_id, "dropping response with no waiter");
                }
                Ok(())
            }
            FrameKind::StreamMessage | FrameKind::StreamResponse | FrameKind::StreamClose => {
                if let Err(err) = self.link.route(kind, reader) {
                    debug!(error = %err, "stream frame dropped");
                    report(self.link.on_error.as_ref(), &err);
                }
                Ok(())
            }
            other => Err(RpcError::UnrecognizedFrame(format!(
                "client received {other} frame"
            ))),
        }
    }

    /// Fail every pending call and stream, then close the connection.
    async fn teardown(&self) {
        let failed = self.pending.close_all();
        self.link.table.close_all();
        let _ = self.conn().close().await;
        debug!(failed, "client session torn down");
    }
}

struct ClientInner {
    transport: Arc<dyn ClientTransport>,
    config: ClientConfig,
    session: RwLock<Option<Arc<Session>>>,
    connecting: AsyncMutex<()>,
    middleware: RwLock<Vec<Middleware>>,
    on_error: RwLock<Option<ErrorHandler>>,
}

impl ClientInner {
    fn current(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn error_handler(&self) -> Option<ErrorHandler> {
        self.on_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget `session` if it is still the current one.
    fn clear_session(&self, session: &Arc<Session>) {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *slot = None;
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.abandoned.send_replace(true);
        }
    }
}

/// An RPC client. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client with default settings. Nothing connects until the first call.
    pub fn new(transport: impl ClientTransport) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    /// Client with explicit settings.
    pub fn with_config(transport: impl ClientTransport, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport: Arc::new(transport),
                config,
                session: RwLock::new(None),
                connecting: AsyncMutex::new(()),
                middleware: RwLock::new(Vec::new()),
                on_error: RwLock::new(None),
            }),
        }
    }

    /// Settings this client was built with.
    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Install a hook for background errors (reader failures, undeliverable
    /// stream responses). `ConnectionClosed` is never reported.
    ///
    /// Stream error reporting picks up the hook for sessions established
    /// after this call.
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        *self.inner.on_error.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Append middleware applied to every [`Client::call`]. Index 0 runs first.
    pub fn add_middleware(&self, middleware: Middleware) {
        self.inner
            .middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
    }

    /// Establish the connection now instead of on the first call.
    pub async fn connect(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    /// Close the current connection, failing everything in flight with
    /// `ConnectionClosed`. The next call reconnects.
    pub async fn disconnect(&self) -> Result<()> {
        let session = self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.teardown().await;
        }
        Ok(())
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.inner.current().is_some()
    }

    /// Calls awaiting a response on the current connection.
    pub fn pending_requests(&self) -> usize {
        self.inner.current().map_or(0, |s| s.pending.len())
    }

    async fn session(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.inner.current() {
            return Ok(session);
        }
        let _connecting = self.inner.connecting.lock().await;
        if let Some(session) = self.inner.current() {
            return Ok(session);
        }

        let conn = self.inner.transport.connect().await?;
        let session = Arc::new(Session::new(
            conn,
            self.inner.error_handler(),
            self.inner.config.max_message_size,
        ));
        *self.inner.session.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(&session));
        tokio::spawn(read_loop(Arc::downgrade(&self.inner), Arc::clone(&session)));
        debug!("client connected");
        Ok(session)
    }

    fn call_context(&self, ctx: &Context) -> Context {
        match (ctx.deadline(), self.inner.config.default_timeout()) {
            (None, Some(timeout)) => ctx.clone().with_timeout(timeout),
            _ => ctx.clone(),
        }
    }

    /// Call `method_id` on `service_id` and wait for the typed response.
    ///
    /// The request passes through the client middleware first. The whole
    /// call, including connecting, is bounded by `ctx` (or the configured
    /// default timeout when `ctx` has no deadline). An error response from
    /// the server surfaces as [`RpcError::Remote`].
    pub async fn call<Req: Message, Resp: Message>(
        &self,
        ctx: &Context,
        service_id: u64,
        method_id: u64,
        request: Req,
    ) -> Result<Resp> {
        let ctx = self.call_context(ctx);
        let client = self.clone();
        let send = handler_fn(move |ctx: Context, request: BoxMessage| {
            let client = client.clone();
            async move {
                client
                    .round_trip::<Resp>(ctx, service_id, method_id, request)
                    .await
            }
        });
        let middleware = self
            .inner
            .middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let chain = build_chain(&middleware, send);

        let response = tokio::select! {
            response = chain(ctx.clone(), Box::new(request)) => response?,
            err = ctx.done() => return Err(err),
        };
        downcast(response)
    }

    async fn round_trip<Resp: Message>(
        &self,
        ctx: Context,
        service_id: u64,
        method_id: u64,
        request: BoxMessage,
    ) -> Result<BoxMessage> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let session = self.session().await?;
        let request_id = session.request_ids.next();
        let pending = session.pending.register(request_id)?;

        let frame = encode_request(ctx.metadata(), request_id, service_id, method_id, &*request);
        check_size(frame.len(), self.inner.config.max_message_size)?;
        session.conn().send(frame).await?;
        trace!(request_id, service_id, method_id, "request sent");

        let mut reader = tokio::select! {
            response = pending.wait() => response?,
            err = ctx.done() => return Err(err),
        };
        let response: Resp = read_response_body(&mut reader)?;
        Ok(Box::new(response))
    }

    /// Open a stream to the handler registered for `(service_id, method_id)`.
    ///
    /// Resolves once the server has acknowledged the open. Messages the
    /// server sends on this stream are answered with an error until a
    /// processor is installed; use [`Client::open_stream_with_processor`]
    /// when the server handler talks first.
    pub async fn open_stream<Req: Message>(
        &self,
        ctx: &Context,
        service_id: u64,
        method_id: u64,
        request: &Req,
    ) -> Result<Arc<Stream>> {
        self.open(ctx, service_id, method_id, request, None).await
    }

    /// Open a stream with `processor` installed before the open is sent.
    pub async fn open_stream_with_processor<Req: Message>(
        &self,
        ctx: &Context,
        service_id: u64,
        method_id: u64,
        request: &Req,
        processor: impl MessageProcessor,
    ) -> Result<Arc<Stream>> {
        self.open(ctx, service_id, method_id, request, Some(Arc::new(processor)))
            .await
    }

    async fn open<Req: Message>(
        &self,
        ctx: &Context,
        service_id: u64,
        method_id: u64,
        request: &Req,
        processor: Option<Arc<dyn MessageProcessor>>,
    ) -> Result<Arc<Stream>> {
        let ctx = self.call_context(ctx);
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let session = self.session().await?;
        let stream_id = session.stream_ids.next();
        let stream = Stream::new(
            stream_id,
            service_id,
            method_id,
            ctx.metadata().clone(),
            &session.link,
        );
        if let Some(processor) = processor {
            stream.set_shared_processor(processor);
        }
        // Registered before the open goes out so the server may message us
        // as soon as it acknowledges.
        session.link.table.insert(Arc::clone(&stream))?;

        match self.handshake(&session, &ctx, stream_id, service_id, method_id, request).await {
            Ok(()) => {
                debug!(stream_id, service_id, method_id, "stream opened");
                Ok(stream)
            }
            Err(err) => {
                stream.handle_close();
                Err(err)
            }
        }
    }

    async fn handshake<Req: Message>(
        &self,
        session: &Session,
        ctx: &Context,
        stream_id: u64,
        service_id: u64,
        method_id: u64,
        request: &Req,
    ) -> Result<()> {
        let request_id = session.request_ids.next();
        let pending = session.pending.register(request_id)?;
        let frame = encode_stream_open(
            ctx.metadata(),
            request_id,
            stream_id,
            service_id,
            method_id,
            request,
        );
        check_size(frame.len(), self.inner.config.max_message_size)?;
        session.conn().send(frame).await?;

        let mut reader = tokio::select! {
            response = pending.wait() => response?,
            err = ctx.done() => return Err(err),
        };
        read_response_body::<Empty>(&mut reader)?;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn read_loop(client: Weak<ClientInner>, session: Arc<Session>) {
    let mut abandoned = session.abandoned.subscribe();
    let err = loop {
        let frame = tokio::select! {
            frame = session.conn().receive() => frame,
            _ = abandoned.wait_for(|a| *a) => Err(RpcError::ConnectionClosed),
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => break err,
        };
        if let Err(err) = session.dispatch(frame) {
            debug!(error = %err, "client session invalidated");
            break err;
        }
    };

    // Clear first so no new call lands on a session being torn down.
    if let Some(inner) = client.upgrade() {
        inner.clear_session(&session);
    }
    session.teardown().await;
    if let Some(inner) = client.upgrade() {
        report(inner.error_handler().as_ref(), &err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_response, RequestHeader, ResponseBody};
    use crate::transport::{memory_transport, ServerTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Echo {
        text: String,
    }

    crate::impl_message!(Echo { text });

    /// A hand-rolled server that echoes every request payload.
    async fn echo_peer(conn: Arc<dyn Connection>) {
        while let Ok(frame) = conn.receive().await {
            let mut reader = BitReader::new(frame);
            assert_eq!(FrameKind::read(&mut reader).unwrap(), FrameKind::Request);
            let header = RequestHeader::read(&mut reader).unwrap();
            let echo = <Echo as Message>::deserialize(&mut reader).unwrap();
            let reply = encode_response(header.request_id, ResponseBody::Message(&echo));
            if conn.send(reply).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_lazy_connect_and_call() {
        let (listener, dialer) = memory_transport();
        let client = Client::new(dialer);
        assert!(!client.is_connected());

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, Echo>(&Context::new(), 1, 1, Echo { text: "hi".into() })
                    .await
            })
        };
        let conn = listener.accept().await.unwrap();
        tokio::spawn(echo_peer(conn));

        assert_eq!(call.await.unwrap().unwrap(), Echo { text: "hi".into() });
        assert!(client.is_connected());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_error_response_surfaces_remote() {
        let (listener, dialer) = memory_transport();
        let client = Client::new(dialer);
        tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let frame = conn.receive().await.unwrap();
            let mut reader = BitReader::new(frame);
            FrameKind::read(&mut reader).unwrap();
            let header = RequestHeader::read(&mut reader).unwrap();
            let reply = encode_response(header.request_id, ResponseBody::Error("nope"));
            conn.send(reply).await.unwrap();
            std::future::pending::<()>().await;
        });

        let err = client
            .call::<_, Echo>(&Context::new(), 1, 1, Echo { text: String::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref msg) if msg == "nope"));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_and_reconnects() {
        let (listener, dialer) = memory_transport();
        let client = Client::new(dialer);
        let reported = Arc::new(AtomicUsize::new(0));
        {
            let reported = Arc::clone(&reported);
            client.on_error(move |_err: &RpcError| {
                reported.fetch_add(1, Ordering::SeqCst);
            });
        }

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, Echo>(&Context::new(), 1, 1, Echo { text: "x".into() })
                    .await
            })
        };
        let conn = listener.accept().await.unwrap();
        conn.receive().await.unwrap();
        conn.close().await.unwrap();

        assert!(matches!(call.await.unwrap(), Err(RpcError::ConnectionClosed)));
        // closed connections are not reported
        assert_eq!(reported.load(Ordering::SeqCst), 0);
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, Echo>(&Context::new(), 1, 1, Echo { text: "again".into() })
                    .await
            })
        };
        tokio::spawn(echo_peer(listener.accept().await.unwrap()));
        assert_eq!(call.await.unwrap().unwrap().text, "again");
    }

    #[tokio::test]
    async fn test_default_timeout_applies() {
        let (listener, dialer) = memory_transport();
        let config = ClientConfig::new().with_default_timeout(Duration::from_millis(10));
        let client = Client::with_config(dialer, config);
        tokio::spawn(async move {
            let _conn = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let err = client
            .call::<_, Echo>(&Context::new(), 1, 1, Echo { text: String::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::DeadlineExceeded));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_locally() {
        let (listener, dialer) = memory_transport();
        let client = Client::with_config(dialer, ClientConfig::new().with_max_message_size(64));
        tokio::spawn(async move {
            let _conn = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let err = client
            .call::<_, Echo>(&Context::new(), 1, 1, Echo { text: "x".repeat(100) })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MessageTooLarge { limit: 64, .. }));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (listener, dialer) = memory_transport();
        let client = Client::new(dialer);
        let (connected, _conn) = tokio::join!(client.connect(), listener.accept());
        connected.unwrap();
        assert!(client.is_connected());
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_unknown_prefix_invalidates_session() {
        let (listener, dialer) = memory_transport();
        let client = Client::new(dialer);
        let reported = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let reported = Arc::clone(&reported);
            client.on_error(move |err: &RpcError| {
                reported.lock().unwrap().push(err.to_string());
            });
        }

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, Echo>(&Context::new(), 1, 1, Echo { text: "x".into() })
                    .await
            })
        };
        let conn = listener.accept().await.unwrap();
        conn.receive().await.unwrap();
        conn.send(Bytes::from(vec![0xAA; 24])).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));
        assert!(!client.is_connected());
        assert_eq!(client.pending_requests(), 0);
        // the peer sees the connection go away
        assert!(conn.receive().await.is_err());
        tokio::time::timeout(Duration::from_secs(1), async {
            while reported.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(reported.lock().unwrap()[0].contains("prefix"));
    }

    #[tokio::test]
    async fn test_late_response_is_not_fatal() {
        let (listener, dialer) = memory_transport();
        let client = Client::new(dialer);
        let peer = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            conn.send(encode_response(99, ResponseBody::Message(&Empty)))
                .await
                .unwrap();
            echo_peer(conn).await;
        });

        let reply: Echo = client
            .call(&Context::new(), 1, 1, Echo { text: "still up".into() })
            .await
            .unwrap();
        assert_eq!(reply.text, "still up");
        assert!(client.is_connected());
        client.disconnect().await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_client_closes_connection() {
        let (listener, dialer) = memory_transport();
        let client = Client::new(dialer);
        let (connected, conn) = tokio::join!(client.connect(), listener.accept());
        connected.unwrap();
        let conn = conn.unwrap();

        drop(client);
        let received = tokio::time::timeout(Duration::from_secs(1), conn.receive())
            .await
            .unwrap();
        assert!(matches!(received, Err(RpcError::ConnectionClosed)));
    }
}
