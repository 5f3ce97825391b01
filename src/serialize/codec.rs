//! Primitive value codec.
//!
//! Every primitive has three stateless functions: an exact bit-size
//! calculation, a serializer into a [`BitWriter`], and a deserializer from
//! a [`BitReader`]. The [`Field`] trait collects them so compound values
//! (sequences, maps, message fields) can be composed generically.
//!
//! # Integer encodings
//!
//! `u8`/`i8` are 8 fixed bits. Wider integers are variable length: each
//! payload byte (least significant first) is preceded by a `1` flag bit,
//! and a `0` flag bit ends the value once the remaining high bytes are
//! zero. When every byte of the type's width was emitted no terminator
//! follows. Zero therefore costs one bit, and a full `u64` costs 72.
//!
//! Signed integers add a leading sign bit. Non-negative values are stored
//! as-is; negative values are stored zigzag-mapped. Zero is always written
//! with a `0` sign bit.
//!
//! Frame header fields use the fixed-width big-endian forms
//! ([`write_u64_fixed`], [`write_u32_fixed`]) instead.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use super::{BitReader, BitWriter};
use crate::error::{Result, RpcError};

// ============================================================================
// bool / u8 / i8
// ============================================================================

#[inline]
pub const fn bit_size_bool(_value: bool) -> usize {
    1
}

#[inline]
pub fn write_bool(writer: &mut BitWriter, value: bool) {
    writer.write_bits(value as u8, 1);
}

#[inline]
pub fn read_bool(reader: &mut BitReader) -> Result<bool> {
    Ok(reader.read_bits(1)? == 1)
}

#[inline]
pub const fn bit_size_u8(_value: u8) -> usize {
    8
}

#[inline]
pub fn write_u8(writer: &mut BitWriter, value: u8) {
    writer.write_byte(value);
}

#[inline]
pub fn read_u8(reader: &mut BitReader) -> Result<u8> {
    reader.read_byte()
}

#[inline]
pub const fn bit_size_i8(_value: i8) -> usize {
    8
}

#[inline]
pub fn write_i8(writer: &mut BitWriter, value: i8) {
    writer.write_byte(value as u8);
}

#[inline]
pub fn read_i8(reader: &mut BitReader) -> Result<i8> {
    Ok(reader.read_byte()? as i8)
}

// ============================================================================
// Variable-length unsigned
// ============================================================================

/// Bit size of `value` as a varuint of at most `max_bytes` payload bytes.
pub fn bit_size_varuint(mut value: u64, max_bytes: usize) -> usize {
    let mut bits = 0;
    for _ in 0..max_bytes {
        if value == 0 {
            return bits + 1;
        }
        bits += 9;
        value >>= 8;
    }
    bits
}

/// Write `value` as a varuint of at most `max_bytes` payload bytes.
pub fn write_varuint(writer: &mut BitWriter, mut value: u64, max_bytes: usize) {
    for _ in 0..max_bytes {
        if value == 0 {
            writer.write_bits(0, 1);
            return;
        }
        writer.write_bits(1, 1);
        writer.write_byte(value as u8);
        value >>= 8;
    }
}

/// Read a varuint of at most `max_bytes` payload bytes.
pub fn read_varuint(reader: &mut BitReader, max_bytes: usize) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..max_bytes {
        if reader.read_bits(1)? == 0 {
            break;
        }
        value |= u64::from(reader.read_byte()?) << (8 * i);
    }
    Ok(value)
}

#[inline]
pub fn bit_size_u16(value: u16) -> usize {
    bit_size_varuint(u64::from(value), 2)
}

#[inline]
pub fn write_u16(writer: &mut BitWriter, value: u16) {
    write_varuint(writer, u64::from(value), 2);
}

#[inline]
pub fn read_u16(reader: &mut BitReader) -> Result<u16> {
    Ok(read_varuint(reader, 2)? as u16)
}

#[inline]
pub fn bit_size_u32(value: u32) -> usize {
    bit_size_varuint(u64::from(value), 4)
}

#[inline]
pub fn write_u32(writer: &mut BitWriter, value: u32) {
    write_varuint(writer, u64::from(value), 4);
}

#[inline]
pub fn read_u32(reader: &mut BitReader) -> Result<u32> {
    Ok(read_varuint(reader, 4)? as u32)
}

#[inline]
pub fn bit_size_u64(value: u64) -> usize {
    bit_size_varuint(value, 8)
}

#[inline]
pub fn write_u64(writer: &mut BitWriter, value: u64) {
    write_varuint(writer, value, 8);
}

#[inline]
pub fn read_u64(reader: &mut BitReader) -> Result<u64> {
    read_varuint(reader, 8)
}

// ============================================================================
// Variable-length signed
// ============================================================================

#[inline]
pub const fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub const fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[inline]
fn signed_parts(value: i64) -> (u8, u64) {
    if value < 0 {
        (1, zigzag(value))
    } else {
        (0, value as u64)
    }
}

/// Bit size of `value` as a signed varint of at most `max_bytes` payload bytes.
pub fn bit_size_varint(value: i64, max_bytes: usize) -> usize {
    let (_, magnitude) = signed_parts(value);
    1 + bit_size_varuint(magnitude, max_bytes)
}

/// Write `value` as a sign bit followed by its (zigzag-mapped if negative) magnitude.
pub fn write_varint(writer: &mut BitWriter, value: i64, max_bytes: usize) {
    let (sign, magnitude) = signed_parts(value);
    writer.write_bits(sign, 1);
    write_varuint(writer, magnitude, max_bytes);
}

/// Read a signed varint of at most `max_bytes` payload bytes.
pub fn read_varint(reader: &mut BitReader, max_bytes: usize) -> Result<i64> {
    let sign = reader.read_bits(1)?;
    let magnitude = read_varuint(reader, max_bytes)?;
    if sign == 1 {
        Ok(unzigzag(magnitude))
    } else {
        Ok(magnitude as i64)
    }
}

fn out_of_range(value: i64, ty: &str) -> RpcError {
    RpcError::Protocol(format!("decoded value {value} out of range for {ty}"))
}

#[inline]
pub fn bit_size_i16(value: i16) -> usize {
    bit_size_varint(i64::from(value), 2)
}

#[inline]
pub fn write_i16(writer: &mut BitWriter, value: i16) {
    write_varint(writer, i64::from(value), 2);
}

pub fn read_i16(reader: &mut BitReader) -> Result<i16> {
    let v = read_varint(reader, 2)?;
    i16::try_from(v).map_err(|_| out_of_range(v, "i16"))
}

#[inline]
pub fn bit_size_i32(value: i32) -> usize {
    bit_size_varint(i64::from(value), 4)
}

#[inline]
pub fn write_i32(writer: &mut BitWriter, value: i32) {
    write_varint(writer, i64::from(value), 4);
}

pub fn read_i32(reader: &mut BitReader) -> Result<i32> {
    let v = read_varint(reader, 4)?;
    i32::try_from(v).map_err(|_| out_of_range(v, "i32"))
}

#[inline]
pub fn bit_size_i64(value: i64) -> usize {
    bit_size_varint(value, 8)
}

#[inline]
pub fn write_i64(writer: &mut BitWriter, value: i64) {
    write_varint(writer, value, 8);
}

#[inline]
pub fn read_i64(reader: &mut BitReader) -> Result<i64> {
    read_varint(reader, 8)
}

// ============================================================================
// Fixed-width big-endian
// ============================================================================

#[inline]
pub const fn bit_size_u32_fixed() -> usize {
    32
}

#[inline]
pub fn write_u32_fixed(writer: &mut BitWriter, value: u32) {
    writer.write_bytes(&value.to_be_bytes());
}

#[inline]
pub fn read_u32_fixed(reader: &mut BitReader) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_bytes(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

#[inline]
pub const fn bit_size_u64_fixed() -> usize {
    64
}

#[inline]
pub fn write_u64_fixed(writer: &mut BitWriter, value: u64) {
    writer.write_bytes(&value.to_be_bytes());
}

#[inline]
pub fn read_u64_fixed(reader: &mut BitReader) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_bytes(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

// ============================================================================
// Floats (IEEE-754 bit patterns)
// ============================================================================

#[inline]
pub const fn bit_size_f32(_value: f32) -> usize {
    32
}

#[inline]
pub fn write_f32(writer: &mut BitWriter, value: f32) {
    writer.write_bytes(&value.to_bits().to_be_bytes());
}

#[inline]
pub fn read_f32(reader: &mut BitReader) -> Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_bytes(&mut buf)?;
    Ok(f32::from_bits(u32::from_be_bytes(buf)))
}

#[inline]
pub const fn bit_size_f64(_value: f64) -> usize {
    64
}

#[inline]
pub fn write_f64(writer: &mut BitWriter, value: f64) {
    writer.write_bytes(&value.to_bits().to_be_bytes());
}

#[inline]
pub fn read_f64(reader: &mut BitReader) -> Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_bytes(&mut buf)?;
    Ok(f64::from_bits(u64::from_be_bytes(buf)))
}

// ============================================================================
// Strings and blobs
// ============================================================================

#[inline]
pub fn bit_size_bytes(value: &[u8]) -> usize {
    bit_size_u32_fixed() + value.len() * 8
}

/// Write a fixed u32 length prefix followed by the raw bytes.
///
/// # Panics
///
/// Panics if `value` is longer than `u32::MAX` bytes.
pub fn write_blob(writer: &mut BitWriter, value: &[u8]) {
    assert!(value.len() <= u32::MAX as usize, "blob longer than u32::MAX bytes");
    write_u32_fixed(writer, value.len() as u32);
    writer.write_bytes(value);
}

pub fn read_blob(reader: &mut BitReader) -> Result<Vec<u8>> {
    let len = read_u32_fixed(reader)? as usize;
    reader.read_vec(len)
}

#[inline]
pub fn bit_size_str(value: &str) -> usize {
    bit_size_bytes(value.as_bytes())
}

#[inline]
pub fn write_str(writer: &mut BitWriter, value: &str) {
    write_blob(writer, value.as_bytes());
}

pub fn read_string(reader: &mut BitReader) -> Result<String> {
    Ok(String::from_utf8(read_blob(reader)?)?)
}

// ============================================================================
// Field trait
// ============================================================================

/// A value with an exact bit-level encoding.
///
/// Implemented for every primitive plus sequences, maps, `SystemTime` and `Uuid`.
/// Compound containers encode a fixed u32 element count followed by each
/// element's own encoding.
pub trait Field: Sized {
    /// Exact number of bits [`Field::write`] will emit.
    fn bit_size(&self) -> usize;
    /// Serialize into `writer`.
    fn write(&self, writer: &mut BitWriter);
    /// Deserialize from `reader`.
    fn read(reader: &mut BitReader) -> Result<Self>;
}

macro_rules! impl_field {
    ($ty:ty, $size:ident, $write:ident, $read:ident) => {
        impl Field for $ty {
            #[inline]
            fn bit_size(&self) -> usize {
                $size(*self)
            }
            #[inline]
            fn write(&self, writer: &mut BitWriter) {
                $write(writer, *self)
            }
            #[inline]
            fn read(reader: &mut BitReader) -> Result<Self> {
                $read(reader)
            }
        }
    };
}

impl_field!(bool, bit_size_bool, write_bool, read_bool);
impl_field!(u8, bit_size_u8, write_u8, read_u8);
impl_field!(i8, bit_size_i8, write_i8, read_i8);
impl_field!(u16, bit_size_u16, write_u16, read_u16);
impl_field!(u32, bit_size_u32, write_u32, read_u32);
impl_field!(u64, bit_size_u64, write_u64, read_u64);
impl_field!(i16, bit_size_i16, write_i16, read_i16);
impl_field!(i32, bit_size_i32, write_i32, read_i32);
impl_field!(i64, bit_size_i64, write_i64, read_i64);
impl_field!(f32, bit_size_f32, write_f32, read_f32);
impl_field!(f64, bit_size_f64, write_f64, read_f64);

impl Field for String {
    fn bit_size(&self) -> usize {
        bit_size_str(self)
    }
    fn write(&self, writer: &mut BitWriter) {
        write_str(writer, self)
    }
    fn read(reader: &mut BitReader) -> Result<Self> {
        read_string(reader)
    }
}

fn write_count(writer: &mut BitWriter, len: usize) {
    assert!(len <= u32::MAX as usize, "collection longer than u32::MAX elements");
    write_u32_fixed(writer, len as u32);
}

impl<T: Field> Field for Vec<T> {
    fn bit_size(&self) -> usize {
        bit_size_u32_fixed() + self.iter().map(Field::bit_size).sum::<usize>()
    }

    fn write(&self, writer: &mut BitWriter) {
        write_count(writer, self.len());
        for item in self {
            item.write(writer);
        }
    }

    fn read(reader: &mut BitReader) -> Result<Self> {
        let count = read_u32_fixed(reader)? as usize;
        // Cap the pre-allocation by what the remaining input could hold.
        let mut out = Vec::with_capacity(count.min(reader.remaining_bits()));
        for _ in 0..count {
            out.push(T::read(reader)?);
        }
        Ok(out)
    }
}

impl<K: Field + Ord, V: Field> Field for BTreeMap<K, V> {
    fn bit_size(&self) -> usize {
        bit_size_u32_fixed()
            + self
                .iter()
                .map(|(k, v)| k.bit_size() + v.bit_size())
                .sum::<usize>()
    }

    fn write(&self, writer: &mut BitWriter) {
        write_count(writer, self.len());
        for (k, v) in self {
            k.write(writer);
            v.write(writer);
        }
    }

    fn read(reader: &mut BitReader) -> Result<Self> {
        let count = read_u32_fixed(reader)? as usize;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let k = K::read(reader)?;
            let v = V::read(reader)?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

/// Pairs are written in the map's iteration order, so two encodings of the
/// same logical map may differ byte-for-byte. Use `BTreeMap` when the bytes
/// must be reproducible.
impl<K: Field + Eq + Hash, V: Field> Field for HashMap<K, V> {
    fn bit_size(&self) -> usize {
        bit_size_u32_fixed()
            + self
                .iter()
                .map(|(k, v)| k.bit_size() + v.bit_size())
                .sum::<usize>()
    }

    fn write(&self, writer: &mut BitWriter) {
        write_count(writer, self.len());
        for (k, v) in self {
            k.write(writer);
            v.write(writer);
        }
    }

    fn read(reader: &mut BitReader) -> Result<Self> {
        let count = read_u32_fixed(reader)? as usize;
        let mut out = HashMap::with_capacity(count.min(reader.remaining_bits()));
        for _ in 0..count {
            let k = K::read(reader)?;
            let v = V::read(reader)?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

/// Seconds relative to the Unix epoch (floored) plus subsecond nanoseconds.
fn time_parts(value: &SystemTime) -> (i64, u32) {
    match value.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            if d.subsec_nanos() == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
            }
        }
    }
}

impl Field for SystemTime {
    fn bit_size(&self) -> usize {
        let (secs, nanos) = time_parts(self);
        bit_size_i64(secs) + bit_size_u32(nanos)
    }

    fn write(&self, writer: &mut BitWriter) {
        let (secs, nanos) = time_parts(self);
        write_i64(writer, secs);
        write_u32(writer, nanos);
    }

    fn read(reader: &mut BitReader) -> Result<Self> {
        let secs = read_i64(reader)?;
        let nanos = read_u32(reader)?;
        if nanos >= 1_000_000_000 {
            return Err(RpcError::Protocol(format!("invalid subsecond nanos {nanos}")));
        }
        let base = if secs >= 0 {
            UNIX_EPOCH.checked_add(Duration::from_secs(secs as u64))
        } else {
            UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))
        };
        base.and_then(|t| t.checked_add(Duration::from_nanos(u64::from(nanos))))
            .ok_or_else(|| RpcError::Protocol(format!("timestamp {secs}s out of range")))
    }
}

// ============================================================================
// uuid
// ============================================================================

/// 16 raw bytes, in RFC 4122 byte order.
#[inline]
pub const fn bit_size_uuid(_value: &Uuid) -> usize {
    128
}

#[inline]
pub fn write_uuid(writer: &mut BitWriter, value: &Uuid) {
    writer.write_bytes(value.as_bytes());
}

#[inline]
pub fn read_uuid(reader: &mut BitReader) -> Result<Uuid> {
    let mut bytes = [0u8; 16];
    reader.read_bytes(&mut bytes)?;
    Ok(Uuid::from_bytes(bytes))
}

impl Field for Uuid {
    #[inline]
    fn bit_size(&self) -> usize {
        bit_size_uuid(self)
    }
    #[inline]
    fn write(&self, writer: &mut BitWriter) {
        write_uuid(writer, self)
    }
    #[inline]
    fn read(reader: &mut BitReader) -> Result<Self> {
        read_uuid(reader)
    }
}
