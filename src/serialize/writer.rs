//! Bit-addressable output buffer.
//!
//! The writer owns a zeroed byte array that is sized up front from the
//! exact bit size of everything that will be written. Bits are filled
//! least-significant first within each byte, and every write ORs into the
//! destination so a value may straddle a byte boundary.
//!
//! # Example
//!
//! ```
//! use bitrpc::serialize::BitWriter;
//!
//! let mut writer = BitWriter::with_capacity(2);
//! writer.write_bits(0b1, 1);
//! writer.write_byte(0xFF);
//! assert_eq!(writer.bits_written(), 9);
//! assert_eq!(writer.bytes(), &[0xFF, 0x01]);
//! ```

use super::bits_to_bytes;

/// Append-only bit writer over a pre-allocated buffer.
///
/// Running out of capacity is a programming error (sizes are computed
/// before allocation) and panics.
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bits_written: usize,
}

#[cold]
#[inline(never)]
fn insufficient_capacity(needed: usize, have: usize) -> ! {
    panic!("insufficient writer capacity: need {needed} bytes, have {have}");
}

impl BitWriter {
    /// Create a zeroed writer holding exactly `size` bytes.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
            bits_written: 0,
        }
    }

    #[inline]
    fn ensure(&self, additional_bits: usize) {
        let needed = bits_to_bytes(self.bits_written + additional_bits);
        if needed > self.bytes.len() {
            insufficient_capacity(needed, self.bytes.len());
        }
    }

    /// Write the low `n` bits of `value` (`n <= 8`).
    ///
    /// # Panics
    ///
    /// Panics if `n > 8` or the buffer lacks room for `n` more bits.
    pub fn write_bits(&mut self, value: u8, n: u32) {
        assert!(n <= 8, "write_bits supports at most 8 bits, got {n}");
        if n == 0 {
            return;
        }
        self.ensure(n as usize);

        let value = if n == 8 { value } else { value & ((1u8 << n) - 1) };
        let index = self.bits_written >> 3;
        let offset = (self.bits_written & 7) as u32;

        self.bytes[index] |= value << offset;
        let room = 8 - offset;
        if n > room {
            self.bytes[index + 1] |= value >> room;
        }

        self.bits_written += n as usize;
    }

    /// Write a full byte at the current bit position.
    #[inline]
    pub fn write_byte(&mut self, value: u8) {
        if self.bits_written & 7 == 0 {
            self.ensure(8);
            self.bytes[self.bits_written >> 3] = value;
            self.bits_written += 8;
        } else {
            self.write_bits(value, 8);
        }
    }

    /// Write raw bytes verbatim at the current bit position.
    pub fn write_bytes(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.ensure(data.len() * 8);

        let index = self.bits_written >> 3;
        let shift = (self.bits_written & 7) as u32;
        if shift == 0 {
            self.bytes[index..index + data.len()].copy_from_slice(data);
        } else {
            let inv = 8 - shift;
            let mut i = index;
            for &b in data {
                self.bytes[i] |= b << shift;
                i += 1;
                // The final spill lands in a byte that `ensure` already covered.
                self.bytes[i] |= b >> inv;
            }
        }
        self.bits_written += data.len() * 8;
    }

    /// Bytes written so far, truncated to `ceil(bits_written / 8)`.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..bits_to_bytes(self.bits_written)]
    }

    /// Consume the writer, returning the written bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.bytes.truncate(bits_to_bytes(self.bits_written));
        self.bytes
    }

    /// Zero the buffer and rewind the cursor, keeping the allocation.
    ///
    /// Only the written prefix can be non-zero, so only that prefix is cleared.
    pub fn reset(&mut self) {
        let used = bits_to_bytes(self.bits_written);
        self.bytes[..used].fill(0);
        self.bits_written = 0;
    }

    /// Ensure at least `size` bytes of capacity for a fresh write sequence.
    ///
    /// Reallocates (and rewinds) only when the current buffer is smaller.
    pub fn grow(&mut self, size: usize) {
        if self.bytes.len() < size {
            self.bytes = vec![0u8; size];
            self.bits_written = 0;
        }
    }

    /// Capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Number of bits written so far.
    #[inline]
    pub fn bits_written(&self) -> usize {
        self.bits_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_single_bits() {
        let mut w = BitWriter::with_capacity(1);
        w.write_bits(1, 1);
        w.write_bits(0, 1);
        w.write_bits(1, 1);
        assert_eq!(w.bytes(), &[0b0000_0101]);
        assert_eq!(w.bits_written(), 3);
    }

    #[test]
    fn test_write_bits_masks_high_bits() {
        let mut w = BitWriter::with_capacity(1);
        w.write_bits(0xFF, 3);
        assert_eq!(w.bytes(), &[0b0000_0111]);
    }

    #[test]
    fn test_straddling_write() {
        let mut w = BitWriter::with_capacity(2);
        w.write_bits(0b11111, 5);
        w.write_bits(0b1010_1010, 8);
        assert_eq!(w.bits_written(), 13);
        // low 3 bits of 0xAA go into byte 0 at offset 5, remaining 5 into byte 1
        assert_eq!(w.bytes(), &[0b0101_1111, 0b0001_0101]);
    }

    #[test]
    fn test_write_bytes_aligned_and_unaligned() {
        let mut aligned = BitWriter::with_capacity(3);
        aligned.write_bytes(&[1, 2, 3]);
        assert_eq!(aligned.bytes(), &[1, 2, 3]);

        let mut unaligned = BitWriter::with_capacity(4);
        unaligned.write_bits(1, 1);
        unaligned.write_bytes(&[0x80, 0x01]);
        assert_eq!(unaligned.bits_written(), 17);
        assert_eq!(unaligned.bytes(), &[0x01, 0x03, 0x00]);
    }

    #[test]
    fn test_bytes_truncates_to_written() {
        let mut w = BitWriter::with_capacity(16);
        w.write_byte(7);
        assert_eq!(w.bytes().len(), 1);
        assert_eq!(w.capacity(), 16);
        assert_eq!(w.into_bytes(), vec![7]);
    }

    #[test]
    #[should_panic(expected = "insufficient writer capacity")]
    fn test_overflow_panics() {
        let mut w = BitWriter::with_capacity(1);
        w.write_byte(1);
        w.write_bits(1, 1);
    }

    #[test]
    fn test_reset_reuse_is_identical() {
        let mut reused = BitWriter::with_capacity(4);
        reused.write_bytes(&[0xFF, 0xFF, 0xFF, 0xFF]);
        reused.reset();
        reused.write_bits(1, 1);
        reused.write_byte(0x42);

        let mut fresh = BitWriter::with_capacity(4);
        fresh.write_bits(1, 1);
        fresh.write_byte(0x42);

        assert_eq!(reused.bytes(), fresh.bytes());
    }

    #[test]
    fn test_grow_only_when_smaller() {
        let mut w = BitWriter::with_capacity(8);
        w.grow(4);
        assert_eq!(w.capacity(), 8);
        w.grow(32);
        assert_eq!(w.capacity(), 32);
        assert_eq!(w.bits_written(), 0);
    }
}
