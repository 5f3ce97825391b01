//! Per-call metadata carrier.
//!
//! Metadata is a string-keyed map of raw byte blobs that travels with a
//! request (auth tokens, trace ids and the like). It is held explicitly by
//! [`Context`](crate::Context) rather than looked up ambiently.
//!
//! Entries are kept in key order, so the wire encoding of a given set of
//! entries is always the same bytes.
//!
//! # Wire format
//!
//! ```text
//! count: u32 big-endian
//! count × { key: u32 len + UTF-8 bytes, value: u32 len + raw bytes }
//! ```

use std::collections::BTreeMap;

use crate::error::Result;
use crate::serialize::codec::{
    bit_size_bytes, bit_size_str, bit_size_u32_fixed, read_blob, read_string, read_u32_fixed,
    write_blob, write_str, write_u32_fixed,
};
use crate::serialize::{BitReader, BitWriter, Field};

/// String-keyed blob map attached to a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Metadata::put_str`].
    pub fn with_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put_str(key, value);
        self
    }

    /// Store a string value.
    pub fn put_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into().into_bytes());
    }

    /// Store a raw byte value.
    pub fn put_bytes(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Look up a value as UTF-8. `None` if absent or not valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Look up a raw value.
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Whether `key` is present.
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    /// Merge `other` into `self`; values from `other` win on key collision.
    pub fn extend(&mut self, other: &Metadata) {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl Field for Metadata {
    fn bit_size(&self) -> usize {
        bit_size_u32_fixed()
            + self
                .entries
                .iter()
                .map(|(k, v)| bit_size_str(k) + bit_size_bytes(v))
                .sum::<usize>()
    }

    fn write(&self, writer: &mut BitWriter) {
        write_u32_fixed(writer, self.entries.len() as u32);
        for (k, v) in &self.entries {
            write_str(writer, k);
            write_blob(writer, v);
        }
    }

    fn read(reader: &mut BitReader) -> Result<Self> {
        let count = read_u32_fixed(reader)?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = read_string(reader)?;
            let value = read_blob(reader)?;
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::bits_to_bytes;

    fn encode(md: &Metadata) -> Vec<u8> {
        let mut w = BitWriter::with_capacity(bits_to_bytes(md.bit_size()));
        md.write(&mut w);
        w.into_bytes()
    }

    #[test]
    fn test_absent_vs_empty() {
        let mut md = Metadata::new();
        md.put_str("empty", "");
        assert_eq!(md.get_str("empty"), Some(""));
        assert_eq!(md.get_bytes("empty"), Some(&[][..]));
        assert_eq!(md.get_str("missing"), None);
        assert!(md.contains("empty"));
        assert!(!md.contains("missing"));
    }

    #[test]
    fn test_put_get_remove() {
        let mut md = Metadata::new().with_str("token", "1234");
        md.put_bytes("raw", vec![0xFF, 0x00]);
        assert_eq!(md.get_str("token"), Some("1234"));
        assert_eq!(md.get_bytes("raw"), Some(&[0xFF, 0x00][..]));
        // not UTF-8
        assert_eq!(md.get_str("raw"), None);
        assert_eq!(md.len(), 2);
        assert_eq!(md.remove("token"), Some(b"1234".to_vec()));
        assert_eq!(md.len(), 1);
    }

    #[test]
    fn test_extend_overrides() {
        let mut base = Metadata::new().with_str("a", "1").with_str("b", "2");
        let extra = Metadata::new().with_str("b", "3").with_str("c", "4");
        base.extend(&extra);
        let pairs: Vec<_> = base.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), b"3".to_vec()),
                ("c".to_string(), b"4".to_vec()),
            ]
        );
    }

    #[test]
    fn test_wire_layout() {
        let md = Metadata::new().with_str("k", "v");
        assert_eq!(
            encode(&md),
            vec![0, 0, 0, 1, 0, 0, 0, 1, b'k', 0, 0, 0, 1, b'v']
        );
        assert_eq!(encode(&Metadata::new()), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_encoding_independent_of_insertion_order() {
        let a = Metadata::new().with_str("x", "1").with_str("y", "2");
        let b = Metadata::new().with_str("y", "2").with_str("x", "1");
        assert_eq!(encode(&a), encode(&b));
    }

    #[test]
    fn test_decode_round_trip() {
        let mut md = Metadata::new().with_str("trace", "abc");
        md.put_bytes("empty", Vec::new());
        let mut r = BitReader::new(encode(&md));
        assert_eq!(Metadata::read(&mut r).unwrap(), md);
    }
}
