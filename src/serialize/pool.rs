//! Bounded pool of reusable writers.
//!
//! Outbound frames are built in pooled [`BitWriter`]s to amortize
//! allocation. A writer returns to the pool when its guard drops, unless
//! its buffer grew past [`MAX_POOLED_CAPACITY`] or the pool already holds
//! [`MAX_POOLED_WRITERS`] idle writers.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use super::BitWriter;

/// Starting capacity of a freshly allocated writer.
pub const INITIAL_CAPACITY: usize = 256;

/// Writers larger than this are dropped instead of pooled.
pub const MAX_POOLED_CAPACITY: usize = 262_144;

/// Maximum number of idle writers kept.
pub const MAX_POOLED_WRITERS: usize = 64;

static POOL: Mutex<Vec<BitWriter>> = Mutex::new(Vec::new());

/// A writer on loan from the pool.
#[derive(Debug)]
pub struct PooledWriter {
    writer: Option<BitWriter>,
}

/// Take a writer with room for at least `size` bytes.
///
/// The writer starts zeroed with its cursor at bit 0.
pub fn acquire(size: usize) -> PooledWriter {
    let pooled = POOL.lock().unwrap_or_else(PoisonError::into_inner).pop();
    let writer = match pooled {
        Some(mut w) => {
            w.grow(size);
            w
        }
        None => BitWriter::with_capacity(size.max(INITIAL_CAPACITY)),
    };
    PooledWriter {
        writer: Some(writer),
    }
}

/// Number of idle writers currently pooled.
pub fn idle_count() -> usize {
    POOL.lock().unwrap_or_else(PoisonError::into_inner).len()
}

fn release(mut writer: BitWriter) {
    if writer.capacity() > MAX_POOLED_CAPACITY {
        return;
    }
    writer.reset();
    let mut pool = POOL.lock().unwrap_or_else(PoisonError::into_inner);
    if pool.len() < MAX_POOLED_WRITERS {
        pool.push(writer);
    }
}

impl Deref for PooledWriter {
    type Target = BitWriter;

    fn deref(&self) -> &BitWriter {
        // Only `Drop` takes the writer out.
        self.writer.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledWriter {
    fn deref_mut(&mut self) -> &mut BitWriter {
        self.writer.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            release(writer);
        }
    }
}
