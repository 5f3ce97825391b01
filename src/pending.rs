//! Pending-request table.
//!
//! Maps a request id to the one-shot slot its response will be delivered
//! through. Each client connection and each stream owns its own table, so
//! tearing one down never touches another's in-flight requests.
//!
//! The lock is held only for insert/remove, never across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::serialize::BitReader;

struct Slots {
    slots: HashMap<u64, oneshot::Sender<BitReader>>,
    closed: bool,
}

/// Request id → response rendezvous.
pub(crate) struct PendingTable {
    inner: Mutex<Slots>,
    closed_error: fn() -> RpcError,
}

impl PendingTable {
    /// `closed_error` builds the error callers see once the table is closed.
    pub fn new(closed_error: fn() -> RpcError) -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: HashMap::new(),
                closed: false,
            }),
            closed_error,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the slot for `id`. Must be called before the request is sent.
    pub fn register(&self, id: u64) -> Result<Pending<'_>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if inner.closed {
            return Err((self.closed_error)());
        }
        if inner.slots.contains_key(&id) {
            return Err(RpcError::Protocol(format!("request id {id} already in flight")));
        }
        inner.slots.insert(id, tx);
        Ok(Pending {
            table: self,
            id,
            rx: Some(rx),
        })
    }

    /// Deliver a response. Returns `false` if nobody is waiting for `id`.
    pub fn complete(&self, id: u64, reader: BitReader) -> bool {
        let slot = self.lock().slots.remove(&id);
        match slot {
            Some(tx) => tx.send(reader).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, id: u64) -> bool {
        self.lock().slots.remove(&id).is_some()
    }

    /// Fail every waiter at once and refuse new registrations.
    ///
    /// Returns how many waiters were failed.
    pub fn close_all(&self) -> usize {
        let drained = {
            let mut inner = self.lock();
            inner.closed = true;
            std::mem::take(&mut inner.slots)
        };
        // Senders drop outside the lock; each waiter wakes with the closed error.
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn closed_error(&self) -> RpcError {
        (self.closed_error)()
    }
}

/// A reserved slot. Dropping it before the response arrives frees the slot,
/// so a late response is treated as unknown.
pub(crate) struct Pending<'a> {
    table: &'a PendingTable,
    id: u64,
    rx: Option<oneshot::Receiver<BitReader>>,
}

impl Pending<'_> {
    /// Wait for the response, or the table's closed error.
    pub async fn wait(mut self) -> Result<BitReader> {
        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => return Err(self.table.closed_error()),
        };
        rx.await.map_err(|_| self.table.closed_error())
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// Monotonic request-id source starting at a per-process pseudo-random offset.
pub(crate) struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(seed_u64()),
        }
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    #[inline]
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Seed from the clock and the process id.
fn seed_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = u64::from(std::process::id());
    // Keep the top bit clear so the sequence has room before wrapping.
    (nanos.wrapping_mul(0x517c_c1b7_2722_0a95) ^ pid) >> 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PendingTable {
        PendingTable::new(|| RpcError::ConnectionClosed)
    }

    #[tokio::test]
    async fn test_complete_delivers_to_waiter() {
        let t = table();
        let pending = t.register(1).unwrap();
        assert!(t.complete(1, BitReader::new(vec![0x2A])));
        let mut reader = pending.wait().await.unwrap();
        assert_eq!(reader.read_byte().unwrap(), 0x2A);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let t = table();
        let _first = t.register(5).unwrap();
        assert!(matches!(t.register(5), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_drop_frees_slot() {
        let t = table();
        let pending = t.register(3).unwrap();
        drop(pending);
        assert_eq!(t.len(), 0);
        // late arrival finds nothing
        assert!(!t.complete(3, BitReader::default()));
    }

    #[tokio::test]
    async fn test_close_all_fails_every_waiter() {
        let t = table();
        let a = t.register(1).unwrap();
        let b = t.register(2).unwrap();
        assert_eq!(t.close_all(), 2);
        assert!(matches!(a.wait().await, Err(RpcError::ConnectionClosed)));
        assert!(matches!(b.wait().await, Err(RpcError::ConnectionClosed)));
        assert!(t.is_closed());
        assert!(matches!(t.register(9), Err(RpcError::ConnectionClosed)));
    }

    #[test]
    fn test_id_sequence_is_monotonic() {
        let ids = IdSequence::new();
        let a = ids.next();
        let b = ids.next();
        assert_eq!(b, a.wrapping_add(1));
        let from_one = IdSequence::starting_at(1);
        assert_eq!(from_one.next(), 1);
        assert_eq!(from_one.next(), 2);
    }
}
