//! Server session.
//!
//! The [`Server`] accepts connections from its transport and runs one
//! receive loop per connection. Frames are dispatched by prefix:
//!
//! - Request: handled on its own task, bounded by a semaphore
//! - StreamOpen: handled inline, so the stream is registered before any
//!   later frame on the connection is read
//! - StreamMessage / StreamResponse / StreamClose: routed by stream id
//!
//! # Example
//!
//! ```ignore
//! let server = Server::new(listener);
//! server.add_middleware(logging);
//! server.group(|s| {
//!     s.add_middleware(auth);
//!     s.register_service(COUNTER_SERVICE, "counter", counter).unwrap();
//! });
//! server.listen_and_serve().await?;
//! ```

mod registry;
mod service;

pub use service::{Service, ServiceHandler};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::{report, ErrorHandler, Result, RpcError};
use crate::metadata::Metadata;
use crate::middleware::{apply_chain, handler_fn, BoxFuture, Middleware};
use crate::protocol::{encode_response, FrameKind, RequestHeader, ResponseBody, StreamOpenHeader};
use crate::serialize::{downcast, BitReader, BoxMessage, Empty, Message};
use crate::stream::{Stream, StreamLink, StreamTable};
use crate::transport::{Connection, ServerTransport};

use registry::{Registry, ResolvedStream, StreamHandler};

struct ServerInner {
    transport: Arc<dyn ServerTransport>,
    config: ServerConfig,
    registry: RwLock<Registry>,
    on_error: RwLock<Option<ErrorHandler>>,
    running: AtomicBool,
    connections: Mutex<HashMap<u64, Arc<dyn Connection>>>,
    next_connection: AtomicU64,
    permits: Arc<Semaphore>,
}

/// An RPC server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Server with default settings over `transport`.
    pub fn new(transport: impl ServerTransport) -> Self {
        Self::with_config(transport, ServerConfig::default())
    }

    /// Server with explicit settings.
    pub fn with_config(transport: impl ServerTransport, config: ServerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Self {
            inner: Arc::new(ServerInner {
                transport: Arc::new(transport),
                config,
                registry: RwLock::new(Registry::new()),
                on_error: RwLock::new(None),
                running: AtomicBool::new(false),
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                permits,
            }),
        }
    }

    /// Settings this server was built with.
    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Install a hook for connection and dispatch errors.
    /// `ConnectionClosed` is never reported.
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        *self.inner.on_error.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Add middleware to the active group.
    pub fn add_middleware(&self, middleware: Middleware) {
        self.inner.registry_mut().add_middleware(middleware);
    }

    /// Run `scope` with a fresh child group active.
    ///
    /// Middleware added and services registered inside `scope` belong to
    /// the child group and inherit every enclosing group's middleware. The
    /// parent group is active again once `scope` returns.
    pub fn group(&self, scope: impl FnOnce(&Server)) {
        let previous = self.inner.registry_mut().enter_group();
        scope(self);
        self.inner.registry_mut().exit_group(previous);
    }

    /// Register `handler` as service `service_id` in the active group.
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` if the id is taken. Service-aware
    /// transports are told about the new service.
    pub fn register_service(
        &self,
        service_id: u64,
        name: &str,
        handler: impl ServiceHandler,
    ) -> Result<()> {
        self.inner
            .registry_mut()
            .insert_service(service_id, name, Arc::new(handler))?;
        if let Some(aware) = self.inner.transport.as_service_aware() {
            aware.register_service(service_id, name)?;
        }
        debug!(service_id, name, "service registered");
        Ok(())
    }

    /// Register the handler for streams opened on `(service_id, method_id)`.
    ///
    /// The handler runs on its own task after the open is acknowledged. The
    /// stream stays open after it returns `Ok`; an `Err` is reported and
    /// closes the stream. Messages from the client that arrive before the
    /// handler installs a processor wait until it does, or until it returns.
    pub fn register_stream<Req, F, Fut>(
        &self,
        service_id: u64,
        method_id: u64,
        handler: F,
    ) -> Result<()>
    where
        Req: Message,
        F: Fn(Arc<Stream>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: StreamHandler = Arc::new(
            move |stream: Arc<Stream>, open: BoxMessage| -> BoxFuture<'static, Result<()>> {
                match downcast::<Req>(open) {
                    Ok(open) => Box::pin(handler(stream, open)),
                    Err(e) => Box::pin(async move { Err(e) }),
                }
            },
        );
        self.inner.registry_mut().insert_stream(
            service_id,
            method_id,
            service::decode::<Req>,
            handler,
        )?;
        debug!(service_id, method_id, "stream handler registered");
        Ok(())
    }

    /// Listen and accept connections until [`Server::shutdown`].
    ///
    /// Returns `Ok` once the transport reports it is closed.
    pub async fn listen_and_serve(&self) -> Result<()> {
        self.inner.transport.listen().await?;
        self.inner.running.store(true, Ordering::Release);
        debug!("server listening");

        loop {
            let conn = match self.inner.transport.accept().await {
                Ok(conn) => conn,
                Err(err) if err.is_connection_closed() || !self.is_running() => {
                    self.inner.running.store(false, Ordering::Release);
                    debug!("server accept loop stopped");
                    return Ok(());
                }
                Err(err) => {
                    self.inner.running.store(false, Ordering::Release);
                    return Err(err);
                }
            };
            if !self.is_running() {
                let _ = conn.close().await;
                return Ok(());
            }
            let id = self.inner.track(Arc::clone(&conn));
            debug!(connection = id, "connection accepted");
            tokio::spawn(serve_connection(Arc::clone(&self.inner), id, conn));
        }
    }

    /// Stop accepting and close every open connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::Release);
        self.inner.transport.close().await?;
        let connections: Vec<_> = self
            .inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let _ = conn.close().await;
        }
        debug!("server shut down");
        Ok(())
    }

    /// Whether [`Server::listen_and_serve`] is accepting connections.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ServerInner {
    fn registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn error_handler(&self) -> Option<ErrorHandler> {
        self.on_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn track(&self, conn: Arc<dyn Connection>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, conn);
        id
    }

    fn untrack(&self, id: u64) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    async fn handle_frame(self: &Arc<Self>, link: &StreamLink, frame: Bytes) -> Result<()> {
        let mut reader = BitReader::new(frame);
        match FrameKind::read(&mut reader)? {
            FrameKind::Request => self.handle_request(link, reader),
            FrameKind::StreamOpen => self.handle_stream_open(link, reader).await,
            kind @ (FrameKind::StreamMessage | FrameKind::StreamResponse | FrameKind::StreamClose) => {
                link.route(kind, reader)
            }
            FrameKind::Response => Err(RpcError::UnrecognizedFrame(
                "server received response frame".into(),
            )),
        }
    }

    fn handle_request(self: &Arc<Self>, link: &StreamLink, mut reader: BitReader) -> Result<()> {
        let header = RequestHeader::read(&mut reader)?;
        let conn = Arc::clone(&link.conn);

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            warn!(
                request_id = header.request_id,
                service_id = header.service_id,
                "request rejected, server busy"
            );
            let message = RpcError::ServerBusy.to_string();
            let frame = encode_response(header.request_id, ResponseBody::Error(&message));
            tokio::spawn(async move {
                let _ = conn.send(frame).await;
            });
            return Ok(());
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let result = inner
                .dispatch(header.metadata, header.service_id, header.method_id, reader)
                .await;
            if let Err(err) = &result {
                debug!(
                    request_id = header.request_id,
                    service_id = header.service_id,
                    method_id = header.method_id,
                    error = %err,
                    "request failed"
                );
            }
            let frame = response_frame(header.request_id, &result, inner.config.max_message_size);
            if let Err(err) = conn.send(frame).await {
                report(inner.error_handler().as_ref(), &err);
            }
        });
        Ok(())
    }

    async fn dispatch(
        &self,
        metadata: Metadata,
        service_id: u64,
        method_id: u64,
        reader: BitReader,
    ) -> Result<BoxMessage> {
        let resolved = self
            .registry()
            .resolve_service(service_id)
            .ok_or(RpcError::ServiceNotFound(service_id))?;
        let ctx = Context::new().with_metadata(metadata);
        resolved
            .handler
            .call(ctx, service_id, method_id, reader, &resolved.middleware)
            .await
    }

    /// Answers the open with an error Response instead of failing the loop.
    async fn handle_stream_open(self: &Arc<Self>, link: &StreamLink, mut reader: BitReader) -> Result<()> {
        let header = StreamOpenHeader::read(&mut reader)?;
        if let Err(err) = self.open_stream(link, &header, reader).await {
            debug!(
                stream_id = header.stream_id,
                service_id = header.service_id,
                method_id = header.method_id,
                error = %err,
                "stream open rejected"
            );
            let message = err.to_string();
            link.conn
                .send(encode_response(header.request_id, ResponseBody::Error(&message)))
                .await?;
        }
        Ok(())
    }

    async fn open_stream(
        &self,
        link: &StreamLink,
        header: &StreamOpenHeader,
        mut reader: BitReader,
    ) -> Result<()> {
        let resolved = self
            .registry()
            .resolve_stream(header.service_id, header.method_id);
        let ResolvedStream {
            decode,
            handler,
            middleware,
        } = resolved.ok_or(RpcError::StreamHandlerNotFound {
            service_id: header.service_id,
            method_id: header.method_id,
        })?;

        let open = decode(&mut reader)?;
        let ctx = Context::new().with_metadata(header.metadata.clone());
        let accept = handler_fn(|_ctx: Context, open: BoxMessage| async move { Ok(open) });
        let open = apply_chain(&middleware, ctx, open, accept).await?;

        let stream = Stream::new(
            header.stream_id,
            header.service_id,
            header.method_id,
            header.metadata.clone(),
            link,
        );
        stream.begin_setup();
        link.table.insert(Arc::clone(&stream))?;
        let ack = encode_response(header.request_id, ResponseBody::Message(&Empty));
        if let Err(err) = link.conn.send(ack).await {
            stream.handle_close();
            return Err(err);
        }
        debug!(stream_id = header.stream_id, "stream opened");

        let on_error = self.error_handler();
        tokio::spawn(async move {
            let outcome = handler(Arc::clone(&stream), open).await;
            stream.finish_setup();
            if let Err(err) = outcome {
                report(on_error.as_ref(), &err);
                let _ = stream.close().await;
            }
        });
        Ok(())
    }
}

/// Encode the Response for `result`, substituting a size error if the
/// encoded response exceeds `limit`.
fn response_frame(request_id: u64, result: &Result<BoxMessage>, limit: usize) -> Bytes {
    let frame = match result {
        Ok(message) => encode_response(request_id, ResponseBody::Message(message.as_ref())),
        Err(err) => {
            let message = err.to_string();
            encode_response(request_id, ResponseBody::Error(&message))
        }
    };
    if frame.len() <= limit {
        return frame;
    }
    let message = RpcError::MessageTooLarge {
        size: frame.len(),
        limit,
    }
    .to_string();
    encode_response(request_id, ResponseBody::Error(&message))
}

async fn serve_connection(inner: Arc<ServerInner>, id: u64, conn: Arc<dyn Connection>) {
    let link = StreamLink {
        conn: Arc::clone(&conn),
        table: Arc::new(StreamTable::new()),
        on_error: inner.error_handler(),
        max_message_size: inner.config.max_message_size,
    };

    let err = loop {
        let frame = match conn.receive().await {
            Ok(frame) => frame,
            Err(err) => break err,
        };
        if let Err(err) = inner.handle_frame(&link, frame).await {
            debug!(connection = id, error = %err, "server frame dropped");
            report(inner.error_handler().as_ref(), &err);
        }
    };

    let streams = link.table.len();
    link.table.close_all();
    inner.untrack(id);
    let _ = conn.close().await;
    debug!(connection = id, streams, "connection closed");
    report(inner.error_handler().as_ref(), &err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::transport::memory_transport;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Counter {
        count: u32,
    }

    crate::impl_message!(Counter { count });

    fn counter_service() -> Service {
        Service::new().method(1, |_ctx, req: Counter| async move {
            Ok(Counter { count: req.count + 1 })
        })
    }

    /// Accepts nothing; records service registrations.
    #[derive(Default)]
    struct RecordingTransport {
        services: Arc<Mutex<Vec<(u64, String)>>>,
    }

    impl ServerTransport for RecordingTransport {
        fn listen(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn accept(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
            Box::pin(async { Err(RpcError::ConnectionClosed) })
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn as_service_aware(&self) -> Option<&dyn crate::transport::ServiceAware> {
            Some(self)
        }
    }

    impl crate::transport::ServiceAware for RecordingTransport {
        fn register_service(&self, service_id: u64, name: &str) -> Result<()> {
            self.services.lock().unwrap().push((service_id, name.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_service_aware_transport_notified() {
        let transport = RecordingTransport::default();
        let services = Arc::clone(&transport.services);
        let server = Server::new(transport);
        server.register_service(3, "counter", counter_service()).unwrap();
        assert!(matches!(
            server.register_service(3, "again", counter_service()),
            Err(RpcError::DuplicateRegistration(_))
        ));
        assert_eq!(*services.lock().unwrap(), vec![(3, "counter".to_string())]);

        // accept reporting closed ends the loop cleanly
        server.listen_and_serve().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_service_is_error_response() {
        let (listener, dialer) = memory_transport();
        let server = Server::new(listener);
        tokio::spawn({
            let server = server.clone();
            async move { server.listen_and_serve().await }
        });

        let client = Client::new(dialer);
        let err = client
            .call::<_, Counter>(&Context::new(), 42, 1, Counter { count: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref msg) if msg.contains("42")));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (listener, dialer) = memory_transport();
        let server = Server::new(listener);
        server.register_service(1, "counter", counter_service()).unwrap();
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.listen_and_serve().await }
        });

        let client = Client::new(dialer);
        let reply: Counter = client
            .call(&Context::new(), 1, 1, Counter { count: 1 })
            .await
            .unwrap();
        assert_eq!(reply.count, 2);
        assert!(server.is_running());
        assert_eq!(server.connection_count(), 1);

        server.shutdown().await.unwrap();
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while client.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_response_frame_size_fallback() {
        let ok: Result<BoxMessage> = Ok(Box::new(Counter { count: 1 }));
        let small = response_frame(9, &ok, 20);
        let mut reader = BitReader::new(small);
        FrameKind::read(&mut reader).unwrap();
        crate::protocol::read_response_id(&mut reader).unwrap();
        let err = crate::protocol::read_response_body::<Counter>(&mut reader).unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref msg) if msg.contains("exceeds")));
    }
}
