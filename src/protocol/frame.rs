//! Frame encoding and header decoding.
//!
//! Encoders compute the exact frame size, build it in a pooled writer and
//! return an owned `Bytes` ready for [`Connection::send`]. Decoders read the
//! kind-specific header after the prefix and leave the reader positioned at
//! the payload, so the payload can be decoded later by whoever knows its
//! type.
//!
//! [`Connection::send`]: crate::transport::Connection::send

use bytes::Bytes;

use super::prefix::{FrameKind, PREFIX_SIZE};
use crate::error::{Result, RpcError};
use crate::metadata::Metadata;
use crate::serialize::codec::{
    bit_size_str, bit_size_u64_fixed, read_string, read_u64_fixed, read_u8, write_str,
    write_u64_fixed, write_u8,
};
use crate::serialize::{bits_to_bytes, bytes_to_bits, pool, BitReader, BitWriter, DynMessage, Field, Message};

/// Response discriminator: an error string follows.
pub const RESPONSE_ERROR: u8 = 0x01;
/// Response discriminator: a message payload follows.
pub const RESPONSE_MESSAGE: u8 = 0x02;

const PREFIX_BITS: usize = bytes_to_bits(PREFIX_SIZE);
const ID_BITS: usize = bit_size_u64_fixed();

/// Body of a response or stream response.
#[derive(Clone, Copy)]
pub enum ResponseBody<'a> {
    Message(&'a dyn DynMessage),
    Error(&'a str),
}

impl ResponseBody<'_> {
    fn bit_size(&self) -> usize {
        8 + match self {
            ResponseBody::Message(m) => m.dyn_bit_size(),
            ResponseBody::Error(e) => bit_size_str(e),
        }
    }

    fn write(&self, writer: &mut BitWriter) {
        match self {
            ResponseBody::Message(m) => {
                write_u8(writer, RESPONSE_MESSAGE);
                m.dyn_serialize(writer);
            }
            ResponseBody::Error(e) => {
                write_u8(writer, RESPONSE_ERROR);
                write_str(writer, e);
            }
        }
    }
}

fn encode(bits: usize, kind: FrameKind, body: impl FnOnce(&mut BitWriter)) -> Bytes {
    let total = PREFIX_BITS + bits;
    let mut writer = pool::acquire(bits_to_bytes(total));
    writer.write_bytes(kind.prefix());
    body(&mut writer);
    debug_assert_eq!(writer.bits_written(), total, "{kind} frame size mismatch");
    Bytes::copy_from_slice(writer.bytes())
}

/// Encode a Request frame.
pub fn encode_request(
    metadata: &Metadata,
    request_id: u64,
    service_id: u64,
    method_id: u64,
    payload: &dyn DynMessage,
) -> Bytes {
    let bits = metadata.bit_size() + 3 * ID_BITS + payload.dyn_bit_size();
    encode(bits, FrameKind::Request, |w| {
        metadata.write(w);
        write_u64_fixed(w, request_id);
        write_u64_fixed(w, service_id);
        write_u64_fixed(w, method_id);
        payload.dyn_serialize(w);
    })
}

/// Encode a Response frame.
pub fn encode_response(request_id: u64, body: ResponseBody<'_>) -> Bytes {
    encode(ID_BITS + body.bit_size(), FrameKind::Response, |w| {
        write_u64_fixed(w, request_id);
        body.write(w);
    })
}

/// Encode a StreamOpen frame.
pub fn encode_stream_open(
    metadata: &Metadata,
    request_id: u64,
    stream_id: u64,
    service_id: u64,
    method_id: u64,
    payload: &dyn DynMessage,
) -> Bytes {
    let bits = metadata.bit_size() + 4 * ID_BITS + payload.dyn_bit_size();
    encode(bits, FrameKind::StreamOpen, |w| {
        metadata.write(w);
        write_u64_fixed(w, request_id);
        write_u64_fixed(w, stream_id);
        write_u64_fixed(w, service_id);
        write_u64_fixed(w, method_id);
        payload.dyn_serialize(w);
    })
}

/// Encode a StreamMessage frame.
pub fn encode_stream_message(
    metadata: &Metadata,
    stream_id: u64,
    request_id: u64,
    method_id: u64,
    payload: &dyn DynMessage,
) -> Bytes {
    let bits = metadata.bit_size() + 3 * ID_BITS + payload.dyn_bit_size();
    encode(bits, FrameKind::StreamMessage, |w| {
        metadata.write(w);
        write_u64_fixed(w, stream_id);
        write_u64_fixed(w, request_id);
        write_u64_fixed(w, method_id);
        payload.dyn_serialize(w);
    })
}

/// Encode a StreamResponse frame.
pub fn encode_stream_response(stream_id: u64, request_id: u64, body: ResponseBody<'_>) -> Bytes {
    encode(2 * ID_BITS + body.bit_size(), FrameKind::StreamResponse, |w| {
        write_u64_fixed(w, stream_id);
        write_u64_fixed(w, request_id);
        body.write(w);
    })
}

/// Encode a StreamClose frame.
pub fn encode_stream_close(stream_id: u64) -> Bytes {
    encode(ID_BITS, FrameKind::StreamClose, |w| {
        write_u64_fixed(w, stream_id);
    })
}

/// Header of a Request frame.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub metadata: Metadata,
    pub request_id: u64,
    pub service_id: u64,
    pub method_id: u64,
}

impl RequestHeader {
    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            metadata: Metadata::read(reader)?,
            request_id: read_u64_fixed(reader)?,
            service_id: read_u64_fixed(reader)?,
            method_id: read_u64_fixed(reader)?,
        })
    }
}

/// Header of a StreamOpen frame.
#[derive(Debug, Clone)]
pub struct StreamOpenHeader {
    pub metadata: Metadata,
    pub request_id: u64,
    pub stream_id: u64,
    pub service_id: u64,
    pub method_id: u64,
}

impl StreamOpenHeader {
    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            metadata: Metadata::read(reader)?,
            request_id: read_u64_fixed(reader)?,
            stream_id: read_u64_fixed(reader)?,
            service_id: read_u64_fixed(reader)?,
            method_id: read_u64_fixed(reader)?,
        })
    }
}

/// Header of a StreamMessage frame.
#[derive(Debug, Clone)]
pub struct StreamMessageHeader {
    pub metadata: Metadata,
    pub stream_id: u64,
    pub request_id: u64,
    pub method_id: u64,
}

impl StreamMessageHeader {
    pub fn read(reader: &mut BitReader) -> Result<Self> {
        Ok(Self {
            metadata: Metadata::read(reader)?,
            stream_id: read_u64_fixed(reader)?,
            request_id: read_u64_fixed(reader)?,
            method_id: read_u64_fixed(reader)?,
        })
    }
}

/// Request id of a Response frame. The reader is left at the discriminator.
pub fn read_response_id(reader: &mut BitReader) -> Result<u64> {
    read_u64_fixed(reader)
}

/// `(stream_id, request_id)` of a StreamResponse frame.
pub fn read_stream_response_ids(reader: &mut BitReader) -> Result<(u64, u64)> {
    Ok((read_u64_fixed(reader)?, read_u64_fixed(reader)?))
}

/// Stream id of a StreamClose frame.
pub fn read_stream_close(reader: &mut BitReader) -> Result<u64> {
    read_u64_fixed(reader)
}

/// Read a response discriminator and body.
///
/// An error response surfaces as [`RpcError::Remote`] carrying the peer's
/// error string unchanged.
pub fn read_response_body<M: Message>(reader: &mut BitReader) -> Result<M> {
    match read_u8(reader)? {
        RESPONSE_MESSAGE => M::deserialize(reader),
        RESPONSE_ERROR => Err(RpcError::Remote(read_string(reader)?)),
        other => Err(RpcError::Protocol(format!(
            "invalid response type 0x{other:02x}"
        ))),
    }
}
