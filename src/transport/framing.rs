//! Length-delimited framing for byte-stream transports.
//!
//! Each message is preceded by its length as a 4-byte big-endian integer.
//! [`LengthDelimited`] accumulates partial socket reads in a `BytesMut` and
//! yields whole messages, using a two-state machine:
//! - `WaitingForLength`: need at least 4 bytes
//! - `WaitingForBody`: length parsed, need N more bytes
//!
//! # Example
//!
//! ```
//! use bitrpc::transport::framing::{encode_length, LengthDelimited};
//!
//! let mut framer = LengthDelimited::new(1024);
//! let mut wire = encode_length(5).to_vec();
//! wire.extend_from_slice(b"hello");
//!
//! assert!(framer.push(&wire[..3]).unwrap().is_empty());
//! let messages = framer.push(&wire[3..]).unwrap();
//! assert_eq!(&messages[0][..], b"hello");
//! ```

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message length prefix.
///
/// # Panics
///
/// Panics if `len` does not fit in a `u32`; transports check their size
/// limit before framing.
#[inline]
pub fn encode_length(len: usize) -> [u8; LENGTH_PREFIX_SIZE] {
    assert!(len <= u32::MAX as usize, "message length {len} exceeds u32");
    (len as u32).to_be_bytes()
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForBody { remaining: usize },
}

/// Accumulates bytes and extracts complete length-delimited messages.
#[derive(Debug)]
pub struct LengthDelimited {
    buffer: BytesMut,
    state: State,
    max_message_size: usize,
}

impl LengthDelimited {
    /// Create a framer that rejects messages over `max_message_size` bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_message_size,
        }
    }

    /// Append `data` and return every message it completed.
    ///
    /// # Errors
    ///
    /// `MessageTooLarge` if a length prefix exceeds the limit. The stream is
    /// unusable after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }
                    let len = self.buffer.get_u32() as usize;
                    if len > self.max_message_size {
                        return Err(RpcError::MessageTooLarge {
                            size: len,
                            limit: self.max_message_size,
                        });
                    }
                    self.state = State::WaitingForBody { remaining: len };
                }
                State::WaitingForBody { remaining } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForLength;
                    return Ok(Some(body));
                }
            }
        }
    }

    /// Buffered bytes not yet returned as messages.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut out = encode_length(body.len()).to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_multiple_messages_in_one_push() {
        let mut framer = LengthDelimited::new(1024);
        let mut wire = framed(b"first");
        wire.extend(framed(b"second"));
        wire.extend(framed(b""));

        let messages = framer.push(&wire).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(&messages[0][..], b"first");
        assert_eq!(&messages[1][..], b"second");
        assert!(messages[2].is_empty());
        assert!(framer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut framer = LengthDelimited::new(1024);
        let wire = framed(b"fragmented body");
        let mut got = Vec::new();
        for b in &wire {
            got.extend(framer.push(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0][..], b"fragmented body");
    }

    #[test]
    fn test_partial_second_message_is_kept() {
        let mut framer = LengthDelimited::new(1024);
        let second = framed(b"later");
        let mut wire = framed(b"now");
        wire.extend_from_slice(&second[..6]);

        assert_eq!(framer.push(&wire).unwrap().len(), 1);
        assert_eq!(framer.len(), 2);
        let rest = framer.push(&second[6..]).unwrap();
        assert_eq!(&rest[0][..], b"later");
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut framer = LengthDelimited::new(8);
        let err = framer.push(&encode_length(9)).unwrap_err();
        assert!(matches!(err, RpcError::MessageTooLarge { size: 9, limit: 8 }));
    }
}
