//! In-process transport.
//!
//! [`memory_transport`] returns a listener/dialer pair. Each dial creates
//! two [`MemoryConnection`] halves joined by bounded channels; closing
//! either half closes both.
//!
//! # Example
//!
//! ```
//! use bitrpc::transport::{memory_transport, ClientTransport, Connection, ServerTransport};
//!
//! # #[tokio::main]
//! # async fn main() -> bitrpc::Result<()> {
//! let (listener, dialer) = memory_transport();
//! listener.listen().await?;
//! let client = dialer.connect().await?;
//! let server = listener.accept().await?;
//! client.send(bytes::Bytes::from_static(b"ping")).await?;
//! assert_eq!(&server.receive().await?[..], b"ping");
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use super::{ClientTransport, Connection, ServerTransport, ServiceAware, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::{Result, RpcError};
use crate::middleware::BoxFuture;

const CHANNEL_CAPACITY: usize = 1024;

/// Resolves once `closed` flips to true. A dropped sender counts as closed.
async fn closed_signal(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

/// One half of an in-process duplex connection.
pub struct MemoryConnection {
    tx: mpsc::Sender<Bytes>,
    rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    closed: Arc<watch::Sender<bool>>,
    max_message_size: usize,
}

impl MemoryConnection {
    /// Create a connected pair.
    pub fn pair(max_message_size: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let a = Self {
            tx: b_tx,
            rx: AsyncMutex::new(a_rx),
            closed: Arc::clone(&closed),
            max_message_size,
        };
        let b = Self {
            tx: a_tx,
            rx: AsyncMutex::new(b_rx),
            closed,
            max_message_size,
        };
        (a, b)
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.max_message_size {
            return Err(RpcError::MessageTooLarge {
                size: len,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Connection for MemoryConnection {
    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(RpcError::ConnectionClosed);
            }
            self.check_size(message.len())?;
            tokio::select! {
                sent = self.tx.send(message) => sent.map_err(|_| RpcError::ConnectionClosed),
                _ = closed_signal(self.closed.subscribe()) => Err(RpcError::ConnectionClosed),
            }
        })
    }

    fn receive(&self) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            let message = tokio::select! {
                biased;
                next = rx.recv() => next.ok_or(RpcError::ConnectionClosed)?,
                _ = closed_signal(self.closed.subscribe()) => return Err(RpcError::ConnectionClosed),
            };
            self.check_size(message.len())?;
            Ok(message)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.send_replace(true);
            Ok(())
        })
    }
}

struct ListenerShared {
    closed: watch::Sender<bool>,
    max_message_size: usize,
}

/// Accepting side of the in-process transport.
pub struct MemoryListener {
    incoming: AsyncMutex<mpsc::Receiver<MemoryConnection>>,
    shared: Arc<ListenerShared>,
    service_aware: bool,
    services: Mutex<Vec<(u64, String)>>,
}

/// Dialing side of the in-process transport. Cheap to clone.
#[derive(Clone)]
pub struct MemoryDialer {
    tx: mpsc::Sender<MemoryConnection>,
    shared: Arc<ListenerShared>,
}

/// Create a listener/dialer pair with the default message size limit.
pub fn memory_transport() -> (MemoryListener, MemoryDialer) {
    memory_transport_with_limit(DEFAULT_MAX_MESSAGE_SIZE)
}

/// Create a listener/dialer pair with a custom message size limit.
pub fn memory_transport_with_limit(max_message_size: usize) -> (MemoryListener, MemoryDialer) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (closed, _) = watch::channel(false);
    let shared = Arc::new(ListenerShared {
        closed,
        max_message_size,
    });
    let listener = MemoryListener {
        incoming: AsyncMutex::new(rx),
        shared: Arc::clone(&shared),
        service_aware: false,
        services: Mutex::new(Vec::new()),
    };
    (listener, MemoryDialer { tx, shared })
}

impl MemoryListener {
    /// Advertise the service-routing capability and record registrations.
    pub fn with_service_registry(mut self) -> Self {
        self.service_aware = true;
        self
    }

    /// Services registered through [`ServiceAware`], in registration order.
    pub fn registered_services(&self) -> Vec<(u64, String)> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ServerTransport for MemoryListener {
    fn listen(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if *self.shared.closed.borrow() {
                return Err(RpcError::ConnectionClosed);
            }
            Ok(())
        })
    }

    fn accept(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            let mut incoming = self.incoming.lock().await;
            tokio::select! {
                biased;
                _ = closed_signal(self.shared.closed.subscribe()) => Err(RpcError::ConnectionClosed),
                conn = incoming.recv() => match conn {
                    Some(conn) => Ok(Arc::new(conn) as Arc<dyn Connection>),
                    None => Err(RpcError::ConnectionClosed),
                },
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shared.closed.send_replace(true);
            Ok(())
        })
    }

    fn as_service_aware(&self) -> Option<&dyn ServiceAware> {
        if self.service_aware {
            Some(self)
        } else {
            None
        }
    }
}

impl ServiceAware for MemoryListener {
    fn register_service(&self, service_id: u64, name: &str) -> Result<()> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((service_id, name.to_string()));
        Ok(())
    }
}

impl ClientTransport for MemoryDialer {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            if *self.shared.closed.borrow() {
                return Err(RpcError::ConnectionClosed);
            }
            let (client, server) = MemoryConnection::pair(self.shared.max_message_size);
            self.tx
                .send(server)
                .await
                .map_err(|_| RpcError::ConnectionClosed)?;
            Ok(Arc::new(client) as Arc<dyn Connection>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_send_receive_both_ways() {
        let (a, b) = MemoryConnection::pair(1024);
        a.send(Bytes::from_static(b"one")).await.unwrap();
        b.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(&b.receive().await.unwrap()[..], b"one");
        assert_eq!(&a.receive().await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_close_unblocks_peer_receive() {
        let (a, b) = MemoryConnection::pair(1024);
        let b = Arc::new(b);
        let reader = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.receive().await })
        };
        tokio::task::yield_now().await;
        a.close().await.unwrap();
        assert!(matches!(reader.await.unwrap(), Err(RpcError::ConnectionClosed)));
        assert!(matches!(
            b.send(Bytes::from_static(b"x")).await,
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_peer_is_closed() {
        let (a, b) = MemoryConnection::pair(1024);
        drop(a);
        assert!(matches!(b.receive().await, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let (a, _b) = MemoryConnection::pair(4);
        match a.send(Bytes::from_static(b"12345")).await {
            Err(RpcError::MessageTooLarge { size, limit }) => {
                assert_eq!((size, limit), (5, 4));
            }
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_listener_close_unblocks_accept() {
        let (listener, dialer) = memory_transport();
        listener.listen().await.unwrap();
        let listener = Arc::new(listener);
        let acceptor = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        listener.close().await.unwrap();
        assert!(matches!(acceptor.await.unwrap(), Err(RpcError::ConnectionClosed)));
        assert!(matches!(dialer.connect().await, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_service_registry_capability() {
        let (plain, _) = memory_transport();
        assert!(plain.as_service_aware().is_none());

        let (aware, _) = memory_transport();
        let aware = aware.with_service_registry();
        aware
            .as_service_aware()
            .unwrap()
            .register_service(7, "calc.Calculator")
            .unwrap();
        assert_eq!(aware.registered_services(), vec![(7, "calc.Calculator".to_string())]);
    }
}
