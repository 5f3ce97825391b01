//! Bit-packed value serialization.
//!
//! - [`BitWriter`] / [`BitReader`]: sub-byte buffer and cursor
//! - [`codec`]: per-primitive size/encode/decode functions and [`Field`]
//! - [`Message`]: the contract every payload type implements
//! - [`pool`]: bounded reuse of writer buffers

pub mod codec;
mod message;
pub mod pool;
mod reader;
mod writer;

pub use codec::Field;
pub use message::{downcast, from_json, to_json, BoxMessage, DynMessage, Empty, Message};
pub use reader::BitReader;
pub use writer::BitWriter;

/// Number of bytes needed to hold `bits` bits.
#[inline]
pub const fn bits_to_bytes(bits: usize) -> usize {
    (bits + 7) / 8
}

/// Number of bits in `bytes` bytes.
#[inline]
pub const fn bytes_to_bits(bytes: usize) -> usize {
    bytes * 8
}
