//! Tokens: the immutable unit of data moving between ports.

use bytes::Bytes;
use rmpv::Value;

use crate::codec::{decode_value, encode_value, CodecError};

/// Largest encoded token accepted by the runtime.
pub const MAX_TOKEN_SIZE: usize = 4096;

/// Errors raised when building a token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Encoded payload is larger than the configured bound.
    #[error("token of {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Encoded size.
        size: usize,
        /// Configured bound.
        limit: usize,
    },

    /// The payload could not be encoded or decoded.
    #[error("token codec error: {0}")]
    Codec(#[from] CodecError),
}

/// A pre-encoded, immutable value.
///
/// The payload is a single MessagePack value. Tokens are compared by their
/// encoded representation and cloning one only bumps a reference count.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    data: Bytes,
}

impl Token {
    /// Wrap an already encoded payload, enforcing [`MAX_TOKEN_SIZE`].
    pub fn new(data: impl Into<Bytes>) -> Result<Self, TokenError> {
        Self::with_limit(data, MAX_TOKEN_SIZE)
    }

    /// Wrap an already encoded payload with an explicit size bound.
    pub fn with_limit(data: impl Into<Bytes>, limit: usize) -> Result<Self, TokenError> {
        let data = data.into();
        if data.len() > limit {
            return Err(TokenError::TooLarge {
                size: data.len(),
                limit,
            });
        }
        Ok(Self { data })
    }

    /// Encode `value` into a new token.
    pub fn from_value(value: &Value) -> Result<Self, TokenError> {
        Self::new(encode_value(value)?)
    }

    /// Token carrying an unsigned integer.
    pub fn from_uint(n: u64) -> Result<Self, TokenError> {
        Self::from_value(&Value::from(n))
    }

    /// Decode the payload.
    pub fn to_value(&self) -> Result<Value, TokenError> {
        Ok(decode_value(&self.data)?)
    }

    /// Payload as an unsigned integer, if it is one.
    pub fn as_uint(&self) -> Option<u64> {
        self.to_value().ok().and_then(|v| v.as_u64())
    }

    /// Encoded payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
