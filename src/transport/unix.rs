//! Unix domain socket transport.
//!
//! Messages are length-delimited (see [`framing`](super::framing)). Each
//! connection spawns a writer task so concurrent senders never contend on
//! the socket; the read half is owned by whichever task calls `receive`.
//!
//! # Example
//!
//! ```ignore
//! use bitrpc::transport::{generate_socket_path, UnixClientTransport, UnixServerTransport};
//!
//! let path = generate_socket_path();
//! let server_transport = UnixServerTransport::new(&path);
//! let client_transport = UnixClientTransport::new(&path);
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::debug;

use super::framing::LengthDelimited;
use super::writer::{spawn_writer_task, WriterHandle};
use super::{ClientTransport, Connection, ServerTransport, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::{Result, RpcError};
use crate::middleware::BoxFuture;

const READ_CHUNK: usize = 64 * 1024;

/// Generate a unique socket path for this process.
///
/// Format: `/tmp/bitrpc-{pid}-{random}.sock`
pub fn generate_socket_path() -> String {
    format!("/tmp/bitrpc-{}-{:x}.sock", std::process::id(), rand_u64())
}

/// Clock nanos mixed with the pid and a process-local counter.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = u64::from(std::process::id());
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos.wrapping_mul(0x517c_c1b7_2722_0a95) ^ pid ^ seq.rotate_left(32)
}

async fn closed_signal(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

struct ReadState {
    half: OwnedReadHalf,
    framer: LengthDelimited,
    ready: std::collections::VecDeque<Bytes>,
    /// Scratch space for socket reads, reused across calls.
    chunk: Box<[u8]>,
}

/// A connected Unix socket speaking length-delimited messages.
pub struct UnixConnection {
    reader: AsyncMutex<ReadState>,
    writer: Mutex<Option<WriterHandle>>,
    closed: watch::Sender<bool>,
    max_message_size: usize,
}

impl UnixConnection {
    /// Wrap a connected stream. Must be called inside a tokio runtime.
    pub fn new(stream: UnixStream, max_message_size: usize) -> Self {
        let (read, write) = stream.into_split();
        let (writer, _task) = spawn_writer_task(write);
        let (closed, _) = watch::channel(false);
        Self {
            reader: AsyncMutex::new(ReadState {
                half: read,
                framer: LengthDelimited::new(max_message_size),
                ready: Default::default(),
                chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
            }),
            writer: Mutex::new(Some(writer)),
            closed,
            max_message_size,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Connection for UnixConnection {
    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(RpcError::ConnectionClosed);
            }
            if message.len() > self.max_message_size {
                return Err(RpcError::MessageTooLarge {
                    size: message.len(),
                    limit: self.max_message_size,
                });
            }
            let writer = self
                .writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or(RpcError::ConnectionClosed)?;
            writer.send(message).await
        })
    }

    fn receive(&self) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            let mut guard = self.reader.lock().await;
            let ReadState {
                half,
                framer,
                ready,
                chunk,
            } = &mut *guard;
            loop {
                if let Some(message) = ready.pop_front() {
                    return Ok(message);
                }
                if self.is_closed() {
                    return Err(RpcError::ConnectionClosed);
                }
                let n = tokio::select! {
                    read = half.read(&mut chunk[..]) => read?,
                    _ = closed_signal(self.closed.subscribe()) => return Err(RpcError::ConnectionClosed),
                };
                if n == 0 {
                    return Err(RpcError::ConnectionClosed);
                }
                let messages = framer.push(&chunk[..n])?;
                ready.extend(messages);
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.send_replace(true);
            // Dropping the last handle stops the writer task, which shuts
            // down the write half so the peer sees end-of-stream.
            self.writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            Ok(())
        })
    }
}

/// Listening side of the Unix socket transport.
pub struct UnixServerTransport {
    path: PathBuf,
    listener: AsyncMutex<Option<UnixListener>>,
    closed: watch::Sender<bool>,
    max_message_size: usize,
}

impl UnixServerTransport {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            path: path.as_ref().to_path_buf(),
            listener: AsyncMutex::new(None),
            closed,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ServerTransport for UnixServerTransport {
    /// Bind the socket, removing a stale socket file first.
    fn listen(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            let listener = UnixListener::bind(&self.path)?;
            *self.listener.lock().await = Some(listener);
            debug!(path = %self.path.display(), "unix transport listening");
            Ok(())
        })
    }

    fn accept(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            let guard = self.listener.lock().await;
            let listener = guard
                .as_ref()
                .ok_or_else(|| RpcError::Protocol("accept called before listen".into()))?;
            tokio::select! {
                biased;
                _ = closed_signal(self.closed.subscribe()) => Err(RpcError::ConnectionClosed),
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    Ok(Arc::new(UnixConnection::new(stream, self.max_message_size)) as Arc<dyn Connection>)
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.send_replace(true);
            let _ = std::fs::remove_file(&self.path);
            Ok(())
        })
    }
}

impl Drop for UnixServerTransport {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Dialing side of the Unix socket transport.
#[derive(Debug, Clone)]
pub struct UnixClientTransport {
    path: PathBuf,
    max_message_size: usize,
}

impl UnixClientTransport {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

impl ClientTransport for UnixClientTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            let stream = UnixStream::connect(&self.path).await?;
            Ok(Arc::new(UnixConnection::new(stream, self.max_message_size)) as Arc<dyn Connection>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_socket_path_format() {
        let path = generate_socket_path();
        assert!(path.starts_with("/tmp/bitrpc-"));
        assert!(path.ends_with(".sock"));
        assert!(path.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_generate_socket_path_uniqueness() {
        let paths: std::collections::HashSet<String> =
            (0..10).map(|_| generate_socket_path()).collect();
        assert_eq!(paths.len(), 10);
    }

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let path = generate_socket_path();
        let server = UnixServerTransport::new(&path);
        server.listen().await.unwrap();
        let client = UnixClientTransport::new(&path);

        let (dialed, accepted) = tokio::join!(client.connect(), server.accept());
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();

        dialed.send(Bytes::from_static(b"ping")).await.unwrap();
        dialed.send(Bytes::from_static(b"")).await.unwrap();
        assert_eq!(&accepted.receive().await.unwrap()[..], b"ping");
        assert!(accepted.receive().await.unwrap().is_empty());

        accepted.send(Bytes::from(vec![7u8; 200_000])).await.unwrap();
        assert_eq!(dialed.receive().await.unwrap().len(), 200_000);

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_successive_receives_share_read_buffer() {
        let path = generate_socket_path();
        let server = UnixServerTransport::new(&path);
        server.listen().await.unwrap();
        let client = UnixClientTransport::new(&path);

        let (dialed, accepted) = tokio::join!(client.connect(), server.accept());
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();

        // each message spans several reads; stale bytes must not leak between them
        for fill in 1..=4u8 {
            let len = READ_CHUNK * 2 + usize::from(fill);
            dialed.send(Bytes::from(vec![fill; len])).await.unwrap();
            dialed.send(Bytes::from(vec![fill; 3])).await.unwrap();
        }
        for fill in 1..=4u8 {
            let large = accepted.receive().await.unwrap();
            assert_eq!(large.len(), READ_CHUNK * 2 + usize::from(fill));
            assert!(large.iter().all(|&b| b == fill));
            assert_eq!(&accepted.receive().await.unwrap()[..], &[fill; 3]);
        }

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_limit_enforced() {
        let path = generate_socket_path();
        let server = UnixServerTransport::new(&path);
        server.listen().await.unwrap();
        let client = UnixClientTransport::new(&path).with_max_message_size(8);

        let (dialed, _accepted) = tokio::join!(client.connect(), server.accept());
        let err = dialed
            .unwrap()
            .send(Bytes::from_static(b"123456789"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MessageTooLarge { size: 9, limit: 8 }));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let path = generate_socket_path();
        let server = Arc::new(UnixServerTransport::new(&path));
        server.listen().await.unwrap();
        let acceptor = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.accept().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        server.close().await.unwrap();
        assert!(matches!(acceptor.await.unwrap(), Err(RpcError::ConnectionClosed)));
    }
}
