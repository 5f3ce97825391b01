//! Frame prefixes.
//!
//! Every frame begins with a 16-byte constant naming its kind: an ASCII tag
//! right-aligned and zero-padded on the left.

use crate::error::{Result, RpcError};
use crate::serialize::BitReader;

/// Size of the frame prefix in bytes.
pub const PREFIX_SIZE: usize = 16;

pub const REQUEST_PREFIX: [u8; PREFIX_SIZE] = *b"\0\0\0\0\0rpc-request";
pub const RESPONSE_PREFIX: [u8; PREFIX_SIZE] = *b"\0\0\0\0rpc-response";
pub const STREAM_OPEN_PREFIX: [u8; PREFIX_SIZE] = *b"\0rpc-stream-open";
pub const STREAM_MESSAGE_PREFIX: [u8; PREFIX_SIZE] = *b"\0\0rpc-stream-msg";
pub const STREAM_RESPONSE_PREFIX: [u8; PREFIX_SIZE] = *b"\0rpc-stream-resp";
pub const STREAM_CLOSE_PREFIX: [u8; PREFIX_SIZE] = *b"rpc-stream-close";

/// Kind of frame, selected by its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Request,
    Response,
    StreamOpen,
    StreamMessage,
    StreamResponse,
    StreamClose,
}

impl FrameKind {
    /// The 16-byte prefix for this kind.
    pub const fn prefix(self) -> &'static [u8; PREFIX_SIZE] {
        match self {
            FrameKind::Request => &REQUEST_PREFIX,
            FrameKind::Response => &RESPONSE_PREFIX,
            FrameKind::StreamOpen => &STREAM_OPEN_PREFIX,
            FrameKind::StreamMessage => &STREAM_MESSAGE_PREFIX,
            FrameKind::StreamResponse => &STREAM_RESPONSE_PREFIX,
            FrameKind::StreamClose => &STREAM_CLOSE_PREFIX,
        }
    }

    pub fn from_prefix(prefix: &[u8; PREFIX_SIZE]) -> Option<Self> {
        match *prefix {
            REQUEST_PREFIX => Some(FrameKind::Request),
            RESPONSE_PREFIX => Some(FrameKind::Response),
            STREAM_OPEN_PREFIX => Some(FrameKind::StreamOpen),
            STREAM_MESSAGE_PREFIX => Some(FrameKind::StreamMessage),
            STREAM_RESPONSE_PREFIX => Some(FrameKind::StreamResponse),
            STREAM_CLOSE_PREFIX => Some(FrameKind::StreamClose),
            _ => None,
        }
    }

    /// Consume the prefix from `reader` and classify it.
    pub fn read(reader: &mut BitReader) -> Result<Self> {
        let mut prefix = [0u8; PREFIX_SIZE];
        reader.read_bytes(&mut prefix)?;
        Self::from_prefix(&prefix).ok_or(RpcError::UnknownPrefix(prefix))
    }

    pub const fn name(self) -> &'static str {
        match self {
            FrameKind::Request => "request",
            FrameKind::Response => "response",
            FrameKind::StreamOpen => "stream-open",
            FrameKind::StreamMessage => "stream-message",
            FrameKind::StreamResponse => "stream-response",
            FrameKind::StreamClose => "stream-close",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
