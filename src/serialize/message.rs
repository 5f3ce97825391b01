//! The message contract.
//!
//! A [`Message`] knows its exact encoded bit size and how to write and read
//! itself. The RPC layer moves messages around type-erased as
//! [`BoxMessage`] so middleware can sit between a typed caller and a typed
//! handler without knowing either type.
//!
//! # Example
//!
//! ```
//! use bitrpc::impl_message;
//! use bitrpc::serialize::Message;
//!
//! #[derive(Debug, PartialEq)]
//! struct Point {
//!     x: i32,
//!     y: i32,
//!     label: String,
//! }
//!
//! impl_message!(Point { x, y, label });
//!
//! let p = Point { x: -3, y: 7, label: "a".into() };
//! let bytes = p.to_bytes();
//! assert_eq!(Point::from_bytes(bytes).unwrap(), p);
//! ```

use std::any::Any;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{bits_to_bytes, BitReader, BitWriter};
use crate::error::{Result, RpcError};

/// A payload type with an exact bit-level encoding.
pub trait Message: Send + Sync + Sized + 'static {
    /// Exact number of bits [`Message::serialize`] will emit.
    fn bit_size(&self) -> usize;

    /// Write every field into `writer`.
    fn serialize(&self, writer: &mut BitWriter);

    /// Read every field from `reader`.
    fn deserialize(reader: &mut BitReader) -> Result<Self>;

    /// Encode into a precisely sized byte vector.
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BitWriter::with_capacity(bits_to_bytes(self.bit_size()));
        self.serialize(&mut writer);
        writer.into_bytes()
    }

    /// Decode from a self-contained byte buffer.
    fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        let mut reader = BitReader::new(data);
        Self::deserialize(&mut reader)
    }
}

/// Object-safe view of a [`Message`].
///
/// Implemented for every `Message`; there is no reason to implement it by hand.
pub trait DynMessage: Send + Sync + 'static {
    /// See [`Message::bit_size`].
    fn dyn_bit_size(&self) -> usize;
    /// See [`Message::serialize`].
    fn dyn_serialize(&self, writer: &mut BitWriter);
    /// Borrow as `Any` for inspection by middleware.
    fn as_any(&self) -> &dyn Any;
    /// Convert into `Any` for downcasting back to the concrete type.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<M: Message> DynMessage for M {
    #[inline]
    fn dyn_bit_size(&self) -> usize {
        self.bit_size()
    }

    #[inline]
    fn dyn_serialize(&self, writer: &mut BitWriter) {
        self.serialize(writer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A type-erased message.
pub type BoxMessage = Box<dyn DynMessage>;

/// Recover the concrete message type from a [`BoxMessage`].
pub fn downcast<M: Message>(message: BoxMessage) -> Result<M> {
    message
        .into_any()
        .downcast::<M>()
        .map(|m| *m)
        .map_err(|_| {
            RpcError::Protocol(format!(
                "message is not a {}",
                std::any::type_name::<M>()
            ))
        })
}

/// Message with no fields. Used as the stream-open acknowledgement payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Empty;

impl Message for Empty {
    fn bit_size(&self) -> usize {
        0
    }

    fn serialize(&self, _writer: &mut BitWriter) {}

    fn deserialize(_reader: &mut BitReader) -> Result<Self> {
        Ok(Empty)
    }
}

/// JSON form of a message that also implements `serde::Serialize`.
pub fn to_json<M: Message + Serialize>(message: &M) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse the JSON form of a message.
pub fn from_json<M: Message + DeserializeOwned>(json: &str) -> Result<M> {
    Ok(serde_json::from_str(json)?)
}

/// Implement [`Message`] and [`Field`](crate::serialize::Field) for a
/// struct by encoding the listed fields in order.
///
/// Every listed field type must implement `Field`. Implementing `Field`
/// as well lets the struct nest inside other messages.
#[macro_export]
macro_rules! impl_message {
    ($ty:ident { $($field:ident),* $(,)? }) => {
        impl $crate::serialize::Message for $ty {
            fn bit_size(&self) -> usize {
                0 $(+ $crate::serialize::Field::bit_size(&self.$field))*
            }

            #[allow(unused_variables)]
            fn serialize(&self, writer: &mut $crate::serialize::BitWriter) {
                $($crate::serialize::Field::write(&self.$field, writer);)*
            }

            #[allow(unused_variables)]
            fn deserialize(
                reader: &mut $crate::serialize::BitReader,
            ) -> $crate::error::Result<Self> {
                Ok(Self {
                    $($field: $crate::serialize::Field::read(reader)?,)*
                })
            }
        }

        impl $crate::serialize::Field for $ty {
            fn bit_size(&self) -> usize {
                $crate::serialize::Message::bit_size(self)
            }

            fn write(&self, writer: &mut $crate::serialize::BitWriter) {
                $crate::serialize::Message::serialize(self, writer)
            }

            fn read(reader: &mut $crate::serialize::BitReader) -> $crate::error::Result<Self> {
                <Self as $crate::serialize::Message>::deserialize(reader)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Inner {
        flag: bool,
        tags: Vec<String>,
    }

    crate::impl_message!(Inner { flag, tags });

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Outer {
        id: u64,
        delta: i16,
        inner: Inner,
        ratio: f32,
    }

    crate::impl_message!(Outer { id, delta, inner, ratio });

    fn sample() -> Outer {
        Outer {
            id: 42,
            delta: -2,
            inner: Inner {
                flag: true,
                tags: vec!["x".into(), "yz".into()],
            },
            ratio: 0.5,
        }
    }

    #[test]
    fn test_to_bytes_is_exactly_sized() {
        let msg = sample();
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), bits_to_bytes(msg.bit_size()));
        assert_eq!(Outer::from_bytes(bytes).unwrap(), msg);
    }

    #[test]
    fn test_truncated_message_fails() {
        let mut bytes = sample().to_bytes();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            Outer::from_bytes(bytes),
            Err(RpcError::TruncatedInput { .. })
        ));
    }

    #[test]
    fn test_empty_message() {
        assert_eq!(Empty.bit_size(), 0);
        assert!(Empty.to_bytes().is_empty());
        assert_eq!(Empty::from_bytes(Vec::new()).unwrap(), Empty);
    }

    #[derive(Debug, PartialEq)]
    struct Marker {}

    crate::impl_message!(Marker {});

    #[test]
    fn test_fieldless_macro_message() {
        assert_eq!(Marker {}.bit_size(), 0);
        assert!(Marker {}.to_bytes().is_empty());
        assert_eq!(Marker::from_bytes(Vec::new()).unwrap(), Marker {});
    }

    #[test]
    fn test_downcast() {
        let boxed: BoxMessage = Box::new(sample());
        assert_eq!(boxed.dyn_bit_size(), sample().bit_size());
        assert!(boxed.as_any().is::<Outer>());
        assert_eq!(downcast::<Outer>(boxed).unwrap(), sample());

        let wrong: BoxMessage = Box::new(Empty);
        assert!(matches!(downcast::<Outer>(wrong), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_json_forms() {
        let json = to_json(&sample()).unwrap();
        assert!(json.contains("\"delta\":-2"));
        let back: Outer = from_json(&json).unwrap();
        assert_eq!(back, sample());
        assert!(from_json::<Outer>("{\"id\":").is_err());
    }
}
