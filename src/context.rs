//! Call context: metadata, deadline, cancellation.
//!
//! A [`Context`] is cheap to clone and is passed by value through the
//! middleware chain. Deriving a context with [`Context::with_timeout`] or
//! [`Context::with_cancel`] never loosens the parent: an earlier deadline
//! is kept, and cancelling the parent cancels every child.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bitrpc::{Context, Metadata};
//!
//! let ctx = Context::new()
//!     .with_metadata(Metadata::new().with_str("token", "1234"))
//!     .with_timeout(Duration::from_secs(5));
//! let (child, cancel) = ctx.with_cancel();
//! cancel.cancel();
//! assert!(child.is_cancelled());
//! assert!(!ctx.is_cancelled());
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::RpcError;
use crate::metadata::Metadata;
use crate::middleware::BoxFuture;

#[derive(Clone)]
struct CancelSignal {
    rx: watch::Receiver<bool>,
    parent: Option<Arc<CancelSignal>>,
}

impl CancelSignal {
    fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    fn cancelled(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut rx = self.rx.clone();
            let own = async move {
                // A handle dropped without cancelling never fires.
                if rx.wait_for(|c| *c).await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            match &self.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        })
    }
}

/// Cancels the context it was created with, and every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Cancel. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Metadata plus an optional deadline and cancellation signal.
#[derive(Clone, Default)]
pub struct Context {
    metadata: Metadata,
    deadline: Option<Instant>,
    cancel: Option<Arc<CancelSignal>>,
}

impl Context {
    /// A context with no metadata, deadline or cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Merge additional metadata into the existing set.
    pub fn append_metadata(mut self, metadata: &Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    #[inline]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[inline]
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Derive a context that expires `timeout` from now (or earlier, if the
    /// current deadline is sooner).
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Derive a context that expires at `deadline` (or earlier).
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a cancellable context.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let signal = CancelSignal {
            rx,
            parent: self.cancel.clone(),
        };
        let ctx = Self {
            metadata: self.metadata.clone(),
            deadline: self.deadline,
            cancel: Some(Arc::new(signal)),
        };
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether this context or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// The error this context has already failed with, if any.
    pub fn err(&self) -> Option<RpcError> {
        if self.is_cancelled() {
            Some(RpcError::ContextCancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(RpcError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a context with neither.
    pub async fn done(&self) -> RpcError {
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &self.cancel {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => RpcError::ContextCancelled,
            _ = deadline => RpcError::DeadlineExceeded,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("metadata", &self.metadata)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_fires() {
        let ctx = Context::new().with_timeout(Duration::from_millis(5));
        let err = ctx.done().await;
        assert!(matches!(err, RpcError::DeadlineExceeded));
        assert!(matches!(ctx.err(), Some(RpcError::DeadlineExceeded)));
    }

    #[test]
    fn test_earlier_deadline_kept() {
        let ctx = Context::new().with_timeout(Duration::from_millis(10));
        let first = ctx.deadline().unwrap();
        let ctx = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(first));
    }

    #[tokio::test]
    async fn test_cancel_wakes_done() {
        let (ctx, handle) = Context::new().with_cancel();
        let waiter = tokio::spawn(async move { ctx.done().await });
        tokio::task::yield_now().await;
        handle.cancel();
        let err = waiter.await.unwrap();
        assert!(matches!(err, RpcError::ContextCancelled));
    }

    #[tokio::test]
    async fn test_parent_cancel_propagates() {
        let (parent, handle) = Context::new().with_cancel();
        let (child, _child_handle) = parent.with_cancel();
        handle.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.done().await, RpcError::ContextCancelled));
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_reach_parent() {
        let (parent, _handle) = Context::new().with_cancel();
        let (child, child_handle) = parent.with_cancel();
        child_handle.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(parent.err().is_none());
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let (ctx, handle) = Context::new().with_cancel();
        drop(handle);
        let timed_out = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(timed_out.is_err());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_metadata_accessors() {
        let mut ctx = Context::new().with_metadata(Metadata::new().with_str("a", "1"));
        ctx.metadata_mut().put_str("b", "2");
        let ctx = ctx.append_metadata(&Metadata::new().with_str("a", "9"));
        assert_eq!(ctx.metadata().get_str("a"), Some("9"));
        assert_eq!(ctx.metadata().get_str("b"), Some("2"));
    }
}
