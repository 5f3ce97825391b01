//! Protocol module - frame prefixes, frame encoders and header decoders.
//!
//! Every frame is a 16-byte prefix selecting the frame kind, followed by
//! kind-specific header fields (fixed-width big-endian ids, metadata) and a
//! bit-packed payload:
//!
//! ```text
//! Request        metadata | request_id | service_id | method_id | payload
//! Response       request_id | type | payload or error string
//! StreamOpen     metadata | request_id | stream_id | service_id | method_id | payload
//! StreamMessage  metadata | stream_id | request_id | method_id | payload
//! StreamResponse stream_id | request_id | type | payload or error string
//! StreamClose    stream_id
//! ```

mod frame;
mod prefix;

pub use frame::{
    encode_request, encode_response, encode_stream_close, encode_stream_message,
    encode_stream_open, encode_stream_response, read_response_body, read_response_id,
    read_stream_close, read_stream_response_ids, RequestHeader, ResponseBody, StreamMessageHeader,
    StreamOpenHeader, RESPONSE_ERROR, RESPONSE_MESSAGE,
};
pub use prefix::{
    FrameKind, PREFIX_SIZE, REQUEST_PREFIX, RESPONSE_PREFIX, STREAM_CLOSE_PREFIX,
    STREAM_MESSAGE_PREFIX, STREAM_OPEN_PREFIX, STREAM_RESPONSE_PREFIX,
};
