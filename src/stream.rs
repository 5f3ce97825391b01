//! Bidirectional streams multiplexed over one connection.
//!
//! A stream is opened by the client with a StreamOpen frame and
//! acknowledged by the server. From then on both peers hold a [`Stream`]
//! with the same id and either may call [`Stream::send_message`]; inbound
//! messages are answered by the receiving side's [`MessageProcessor`].
//!
//! Each side keeps its own pending table and request-id sequence, because
//! a StreamResponse always returns to the peer that sent the matching
//! StreamMessage.
//!
//! Closing is idempotent from either side: [`Stream::close`] tears down
//! locally and sends StreamClose, [`Stream::handle_close`] (peer closed or
//! connection lost) only tears down. Tear-down cancels the stream context
//! and fails every pending `send_message` with `StreamClosed`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;
use tracing::debug;

use crate::config::check_size;
use crate::context::{CancelHandle, Context};
use crate::error::{report, ErrorHandler, Result, RpcError};
use crate::metadata::Metadata;
use crate::middleware::BoxFuture;
use crate::pending::{IdSequence, PendingTable};
use crate::protocol::{
    encode_stream_close, encode_stream_message, encode_stream_response, read_response_body,
    read_stream_close, read_stream_response_ids, FrameKind, ResponseBody, StreamMessageHeader,
};
use crate::serialize::{BitReader, BoxMessage, Message};
use crate::transport::Connection;

/// Answers inbound stream messages.
///
/// The reader is positioned at the message payload; the processor decodes
/// it according to `method_id`.
pub trait MessageProcessor: Send + Sync + 'static {
    fn process(
        &self,
        ctx: Context,
        method_id: u64,
        reader: BitReader,
    ) -> BoxFuture<'static, Result<BoxMessage>>;
}

struct FnProcessor<F>(F);

impl<F, Fut> MessageProcessor for FnProcessor<F>
where
    F: Fn(Context, u64, BitReader) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxMessage>> + Send + 'static,
{
    fn process(
        &self,
        ctx: Context,
        method_id: u64,
        reader: BitReader,
    ) -> BoxFuture<'static, Result<BoxMessage>> {
        Box::pin((self.0)(ctx, method_id, reader))
    }
}

/// Wrap an async closure as a [`MessageProcessor`].
pub fn processor_fn<F, Fut>(f: F) -> impl MessageProcessor
where
    F: Fn(Context, u64, BitReader) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxMessage>> + Send + 'static,
{
    FnProcessor(f)
}

type Route = Box<dyn Fn(Context, BitReader) -> BoxFuture<'static, Result<BoxMessage>> + Send + Sync>;

/// A [`MessageProcessor`] with one typed route per method id.
///
/// # Example
///
/// ```ignore
/// let router = StreamRouter::new()
///     .route(1, |_ctx, req: Ping| async move { Ok(Pong { seq: req.seq }) });
/// stream.set_processor(router);
/// ```
#[derive(Default)]
pub struct StreamRouter {
    routes: HashMap<u64, Route>,
}

impl StreamRouter {
    /// A router with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `method_id`, replacing any previous one.
    pub fn route<Req, Resp, F, Fut>(mut self, method_id: u64, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let route: Route = Box::new(
            move |ctx: Context, mut reader: BitReader| -> BoxFuture<'static, Result<BoxMessage>> {
                match Req::deserialize(&mut reader) {
                    Ok(req) => {
                        let fut = handler(ctx, req);
                        Box::pin(async move { Ok(Box::new(fut.await?) as BoxMessage) })
                    }
                    Err(e) => Box::pin(async move { Err(e) }),
                }
            },
        );
        self.routes.insert(method_id, route);
        self
    }
}

impl MessageProcessor for StreamRouter {
    fn process(
        &self,
        ctx: Context,
        method_id: u64,
        reader: BitReader,
    ) -> BoxFuture<'static, Result<BoxMessage>> {
        match self.routes.get(&method_id) {
            Some(route) => route(ctx, reader),
            None => Box::pin(async move {
                Err(RpcError::Protocol(format!(
                    "no stream route for method {method_id}"
                )))
            }),
        }
    }
}

/// The streams open on one connection.
#[derive(Default)]
pub(crate) struct StreamTable {
    streams: Mutex<HashMap<u64, Arc<Stream>>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<Stream>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, stream: Arc<Stream>) -> Result<()> {
        let mut streams = self.lock();
        if streams.contains_key(&stream.id) {
            return Err(RpcError::Protocol(format!(
                "stream id {} already open",
                stream.id
            )));
        }
        streams.insert(stream.id, stream);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<Arc<Stream>> {
        self.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Tear down every stream without notifying the peer.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, s)| s).collect();
        for stream in drained {
            stream.handle_close();
        }
    }
}

/// What a stream needs from the connection that carries it.
#[derive(Clone)]
pub(crate) struct StreamLink {
    pub conn: Arc<dyn Connection>,
    pub table: Arc<StreamTable>,
    pub on_error: Option<ErrorHandler>,
    pub max_message_size: usize,
}

impl StreamLink {
    /// Route a StreamMessage, StreamResponse or StreamClose frame.
    ///
    /// Inbound messages are processed on their own task; responses and
    /// closes are handled before returning.
    pub fn route(&self, kind: FrameKind, mut reader: BitReader) -> Result<()> {
        match kind {
            FrameKind::StreamMessage => {
                let header = StreamMessageHeader::read(&mut reader)?;
                match self.table.get(header.stream_id) {
                    Some(stream) => {
                        tokio::spawn(stream.handle_message(header, reader));
                        Ok(())
                    }
                    None => {
                        let err = RpcError::StreamNotFound(header.stream_id);
                        let message = err.to_string();
                        let frame = encode_stream_response(
                            header.stream_id,
                            header.request_id,
                            ResponseBody::Error(&message),
                        );
                        let conn = Arc::clone(&self.conn);
                        tokio::spawn(async move {
                            let _ = conn.send(frame).await;
                        });
                        Err(err)
                    }
                }
            }
            FrameKind::StreamResponse => {
                let (stream_id, request_id) = read_stream_response_ids(&mut reader)?;
                let stream = self
                    .table
                    .get(stream_id)
                    .ok_or(RpcError::StreamNotFound(stream_id))?;
                stream.handle_response(request_id, reader);
                Ok(())
            }
            FrameKind::StreamClose => {
                let stream_id = read_stream_close(&mut reader)?;
                match self.table.get(stream_id) {
                    Some(stream) => stream.handle_close(),
                    None => debug!(stream_id, "close for unknown stream"),
                }
                Ok(())
            }
            other => Err(RpcError::UnrecognizedFrame(format!(
                "{other} frame routed as stream frame"
            ))),
        }
    }
}

#[derive(Clone, Default)]
struct ProcessorSlot {
    processor: Option<Arc<dyn MessageProcessor>>,
    /// Inbound messages wait for a processor while the open handler sets up.
    settling: bool,
}

/// One end of a bidirectional stream.
pub struct Stream {
    id: u64,
    service_id: u64,
    method_id: u64,
    conn: Arc<dyn Connection>,
    table: Weak<StreamTable>,
    pending: PendingTable,
    request_ids: IdSequence,
    processor: watch::Sender<ProcessorSlot>,
    closed: AtomicBool,
    context: Context,
    cancel: CancelHandle,
    on_error: Option<ErrorHandler>,
    max_message_size: usize,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        service_id: u64,
        method_id: u64,
        metadata: Metadata,
        link: &StreamLink,
    ) -> Arc<Self> {
        let (context, cancel) = Context::new().with_metadata(metadata).with_cancel();
        Arc::new(Self {
            id,
            service_id,
            method_id,
            conn: Arc::clone(&link.conn),
            table: Arc::downgrade(&link.table),
            pending: PendingTable::new(|| RpcError::StreamClosed),
            request_ids: IdSequence::starting_at(1),
            processor: watch::channel(ProcessorSlot::default()).0,
            closed: AtomicBool::new(false),
            context,
            cancel,
            on_error: link.on_error.clone(),
            max_message_size: link.max_message_size,
        })
    }

    /// Stream id, unique per connection and chosen by the opening client.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Service the stream was opened on.
    #[inline]
    pub fn service_id(&self) -> u64 {
        self.service_id
    }

    /// Method the stream was opened on.
    #[inline]
    pub fn method_id(&self) -> u64 {
        self.method_id
    }

    /// Stream-scoped context: the open metadata, cancelled when the stream closes.
    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Install the processor for inbound messages, replacing any previous one.
    pub fn set_processor(&self, processor: impl MessageProcessor) {
        self.set_shared_processor(Arc::new(processor));
    }

    pub(crate) fn set_shared_processor(&self, processor: Arc<dyn MessageProcessor>) {
        self.processor
            .send_modify(|slot| slot.processor = Some(processor));
    }

    /// Hold inbound messages until a processor is installed or
    /// [`Stream::finish_setup`] is called.
    pub(crate) fn begin_setup(&self) {
        self.processor.send_modify(|slot| slot.settling = true);
    }

    pub(crate) fn finish_setup(&self) {
        self.processor.send_modify(|slot| slot.settling = false);
    }

    async fn ready_processor(&self) -> Result<Arc<dyn MessageProcessor>> {
        let mut slot = self.processor.subscribe();
        let installed = tokio::select! {
            ready = slot.wait_for(|s| s.processor.is_some() || !s.settling) => {
                ready.ok().and_then(|s| s.processor.clone())
            }
            _ = self.context.done() => return Err(RpcError::StreamClosed),
        };
        installed.ok_or_else(|| {
            RpcError::Protocol(format!("stream {} has no message processor", self.id))
        })
    }

    /// Send a message to the peer's processor and wait for its response.
    ///
    /// Resolves with the response, the peer's error string as
    /// [`RpcError::Remote`], `StreamClosed` if the stream closes first, or
    /// the context's error if `ctx` expires first.
    pub async fn send_message<Req: Message, Resp: Message>(
        &self,
        ctx: &Context,
        method_id: u64,
        message: &Req,
    ) -> Result<Resp> {
        if self.is_closed() {
            return Err(RpcError::StreamClosed);
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let request_id = self.request_ids.next();
        let pending = self.pending.register(request_id)?;
        let frame = encode_stream_message(ctx.metadata(), self.id, request_id, method_id, message);
        check_size(frame.len(), self.max_message_size)?;
        self.conn.send(frame).await?;

        let mut reader = tokio::select! {
            response = pending.wait() => response?,
            err = ctx.done() => return Err(err),
            _ = self.context.done() => return Err(RpcError::StreamClosed),
        };
        read_response_body(&mut reader)
    }

    /// Close locally and tell the peer. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if !self.shutdown() {
            return Ok(());
        }
        match self.conn.send(encode_stream_close(self.id)).await {
            Err(e) if e.is_connection_closed() => Ok(()),
            other => other,
        }
    }

    /// Tear down after the peer closed the stream or the connection went away.
    ///
    /// Idempotent, and converges with [`Stream::close`].
    pub fn handle_close(&self) {
        self.shutdown();
    }

    /// Returns `false` if the stream was already closed.
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        let failed = self.pending.close_all();
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
        debug!(stream_id = self.id, failed, "stream closed");
        true
    }

    /// Whether either side has closed the stream.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the stream is closed by either side.
    pub async fn wait(&self) {
        if self.is_closed() {
            return;
        }
        self.context.done().await;
    }

    /// Answer one inbound message with the installed processor.
    pub(crate) async fn handle_message(
        self: Arc<Self>,
        header: StreamMessageHeader,
        reader: BitReader,
    ) {
        let result = match self.ready_processor().await {
            Ok(processor) => {
                let ctx = self.context.clone().append_metadata(&header.metadata);
                processor.process(ctx, header.method_id, reader).await
            }
            Err(err) => Err(err),
        };

        let mut frame = match &result {
            Ok(message) => encode_stream_response(
                self.id,
                header.request_id,
                ResponseBody::Message(message.as_ref()),
            ),
            Err(err) => {
                let message = err.to_string();
                encode_stream_response(self.id, header.request_id, ResponseBody::Error(&message))
            }
        };
        if let Err(err) = check_size(frame.len(), self.max_message_size) {
            let message = err.to_string();
            frame = encode_stream_response(self.id, header.request_id, ResponseBody::Error(&message));
        }
        if let Err(err) = self.conn.send(frame).await {
            report(self.on_error.as_ref(), &err);
        }
    }

    pub(crate) fn handle_response(&self, request_id: u64, reader: BitReader) {
        if !self.pending.complete(request_id, reader) {
            debug!(
                stream_id = self.id,
                request_id, "dropping stream response with no waiter"
            );
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("service_id", &self.service_id)
            .field("method_id", &self.method_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
