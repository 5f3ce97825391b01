//! Cursor-based bit reader over a byte buffer.
//!
//! The reader is the inverse of [`BitWriter`](super::BitWriter). It wraps
//! `bytes::Bytes` so a partially consumed frame can be handed to another
//! task (a waiting caller, a stream processor) without copying.

use bytes::Bytes;

use crate::error::{Result, RpcError};

/// Bit reader with a monotonically advancing cursor.
#[derive(Debug, Clone, Default)]
pub struct BitReader {
    data: Bytes,
    bits_read: usize,
}

impl BitReader {
    /// Create a reader positioned at the first bit of `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            bits_read: 0,
        }
    }

    #[inline]
    fn total_bits(&self) -> usize {
        self.data.len() * 8
    }

    /// Bits not yet consumed.
    #[inline]
    pub fn remaining_bits(&self) -> usize {
        self.total_bits() - self.bits_read
    }

    /// Bits consumed so far.
    #[inline]
    pub fn bits_read(&self) -> usize {
        self.bits_read
    }

    #[inline]
    fn check(&self, needed: usize) -> Result<()> {
        let available = self.remaining_bits();
        if needed > available {
            return Err(RpcError::TruncatedInput { needed, available });
        }
        Ok(())
    }

    /// Read `n` bits (`n <= 8`) into the low bits of a byte.
    pub fn read_bits(&mut self, n: u32) -> Result<u8> {
        debug_assert!(n <= 8);
        if n == 0 {
            return Ok(0);
        }
        self.check(n as usize)?;

        let index = self.bits_read >> 3;
        let offset = (self.bits_read & 7) as u32;

        let mut value = self.data[index] >> offset;
        let room = 8 - offset;
        if n > room {
            value |= self.data[index + 1] << room;
        }
        if n < 8 {
            value &= (1u8 << n) - 1;
        }

        self.bits_read += n as usize;
        Ok(value)
    }

    /// Read a full byte.
    #[inline]
    pub fn read_byte(&mut self) -> Result<u8> {
        if self.bits_read & 7 == 0 {
            self.check(8)?;
            let value = self.data[self.bits_read >> 3];
            self.bits_read += 8;
            Ok(value)
        } else {
            self.read_bits(8)
        }
    }

    /// Fill `out` with the next `out.len()` bytes.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.check(out.len() * 8)?;

        let index = self.bits_read >> 3;
        let shift = (self.bits_read & 7) as u32;
        if shift == 0 {
            out.copy_from_slice(&self.data[index..index + out.len()]);
        } else {
            let inv = 8 - shift;
            for (i, slot) in out.iter_mut().enumerate() {
                let lo = self.data[index + i] >> shift;
                let hi = self.data[index + i + 1] << inv;
                *slot = lo | hi;
            }
        }
        self.bits_read += out.len() * 8;
        Ok(())
    }

    /// Read `len` bytes into a fresh vector.
    ///
    /// Aligned reads slice the shared buffer before copying out.
    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        self.check(len * 8)?;
        if self.bits_read & 7 == 0 {
            let start = self.bits_read >> 3;
            self.bits_read += len * 8;
            return Ok(self.data[start..start + len].to_vec());
        }
        let mut out = vec![0u8; len];
        self.read_bytes(&mut out)?;
        Ok(out)
    }
}
