//! Message encoding for minnow.
//!
//! Two layers live here:
//!
//! - The [`MessageCodec`] trait for typed messages (serde). [`MsgPackCodec`] is
//!   the runtime's wire and snapshot format, [`JsonCodec`] is used by the
//!   transport handshake and for registry values stored at the proxy.
//! - Schema-less maps through [`rmpv::Value`]. Protocol frames are built and
//!   inspected as values because most commands carry optional or opaque
//!   sub-trees (tokens, actor state) that are passed through untouched.
//!
//! # Example
//!
//! ```rust
//! use minnow_core::{decode_value, encode_value, map_of, ValueExt};
//! use rmpv::Value;
//!
//! let frame = map_of([("cmd", Value::from("REPLY")), ("status", Value::from(200u32))]);
//! let bytes = encode_value(&frame).unwrap();
//!
//! let decoded = decode_value(&bytes).unwrap();
//! assert_eq!(decoded.get_str("cmd").unwrap(), "REPLY");
//! assert_eq!(decoded.get_uint("status").unwrap(), 200);
//! ```

use std::fmt;

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for codec operations.
#[derive(Debug)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    Decode(Box<dyn std::error::Error + Send + Sync>),
    /// A map lacks a key, or the value under it has the wrong type.
    Field {
        /// Key that was looked up.
        key: String,
        /// Expected value type.
        expected: &'static str,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode error: {}", e),
            CodecError::Decode(e) => write!(f, "decode error: {}", e),
            CodecError::Field { key, expected } => {
                write!(f, "missing or invalid '{}' (expected {})", key, expected)
            }
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) => Some(e.as_ref()),
            CodecError::Decode(e) => Some(e.as_ref()),
            CodecError::Field { .. } => None,
        }
    }
}

impl CodecError {
    fn field(key: &str, expected: &'static str) -> Self {
        CodecError::Field {
            key: key.to_string(),
            expected,
        }
    }
}

/// Pluggable typed message serialization.
///
/// Requires `Clone + 'static` so codec instances can be held by the
/// transport and the state store.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// Used for the join handshake and for the attribute documents kept in the
/// proxy registry (`node-*`, `actor-*`, `port-*` keys).
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

/// MessagePack codec using rmp-serde.
///
/// Structs are encoded as maps (field names kept) so that the output stays
/// self-describing and readable by peers that only speak [`rmpv::Value`].
#[derive(Clone, Default, Debug, Copy)]
pub struct MsgPackCodec;

impl MessageCodec for MsgPackCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        rmp_serde::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

/// Encode a dynamic value as MessagePack.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| CodecError::Encode(e.to_string().into()))?;
    Ok(buf)
}

/// Decode one MessagePack value from the start of `buf`.
pub fn decode_value(buf: &[u8]) -> Result<Value, CodecError> {
    let mut cursor = buf;
    rmpv::decode::read_value(&mut cursor).map_err(|e| CodecError::Decode(e.to_string().into()))
}

/// Build a map value from string keys.
pub fn map_of<'a, I>(entries: I) -> Value
where
    I: IntoIterator<Item = (&'a str, Value)>,
{
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect(),
    )
}

/// `Some(s)` as a string value, `None` as nil.
pub fn str_or_nil(s: Option<&str>) -> Value {
    s.map(Value::from).unwrap_or(Value::Nil)
}

/// Keyed access into map values.
///
/// Lookups scan the map linearly; frames are small and keys are unique.
pub trait ValueExt {
    /// Value stored under `key`, if `self` is a map holding it.
    fn get(&self, key: &str) -> Option<&Value>;

    /// Whether `key` is present (even when its value is nil).
    fn has_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// String under `key`.
    fn get_str(&self, key: &str) -> Result<&str, CodecError> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::field(key, "string"))
    }

    /// String under `key`, `None` when absent or nil.
    fn opt_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer under `key`.
    fn get_uint(&self, key: &str) -> Result<u64, CodecError> {
        self.get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| CodecError::field(key, "unsigned integer"))
    }

    /// Unsigned 32-bit integer under `key`.
    fn get_u32(&self, key: &str) -> Result<u32, CodecError> {
        self.get_uint(key)
            .and_then(|v| u32::try_from(v).map_err(|_| CodecError::field(key, "u32")))
    }

    /// Boolean under `key`.
    fn get_bool(&self, key: &str) -> Result<bool, CodecError> {
        self.get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| CodecError::field(key, "bool"))
    }

    /// Map entries under `key`.
    fn get_map(&self, key: &str) -> Result<&[(Value, Value)], CodecError> {
        self.get(key)
            .and_then(Value::as_map)
            .map(Vec::as_slice)
            .ok_or_else(|| CodecError::field(key, "map"))
    }

    /// Array under `key`.
    fn get_array(&self, key: &str) -> Result<&[Value], CodecError> {
        self.get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .ok_or_else(|| CodecError::field(key, "array"))
    }

    /// Map or array value under `key`, as the value itself.
    fn get_value(&self, key: &str) -> Result<&Value, CodecError> {
        self.get(key).ok_or_else(|| CodecError::field(key, "value"))
    }
}

impl ValueExt for Value {
    fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}
