//! Wire format for frames exchanged with the proxy.
//!
//! Frame format: `[length:4][payload:N]`
//!
//! - **length**: payload size in bytes (big-endian u32, prefix excluded)
//! - **payload**: one encoded message (JSON during the join handshake,
//!   MessagePack afterwards)

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Default maximum payload size (1MB).
///
/// Frames announcing a larger payload are rejected before any allocation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Payload exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced or actual payload size in bytes.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Length field announces an empty payload.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the prefix.
        length: u32,
    },
}

/// Prefix `payload` with its big-endian length.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the payload exceeds `max`.
///
/// # Examples
///
/// ```
/// use minnow_transport::wire::{encode_frame, decode_frame, MAX_FRAME_SIZE};
///
/// let frame = encode_frame(b"hello", MAX_FRAME_SIZE).expect("encode");
/// assert_eq!(&frame[..4], &[0, 0, 0, 5]);
///
/// let (payload, used) = decode_frame(&frame, MAX_FRAME_SIZE).expect("decode");
/// assert_eq!(payload, b"hello");
/// assert_eq!(used, frame.len());
/// ```
pub fn encode_frame(payload: &[u8], max: usize) -> Result<Vec<u8>, WireError> {
    if payload.len() > max || payload.len() > u32::MAX as usize {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
            max,
        });
    }
    if payload.is_empty() {
        return Err(WireError::InvalidLength { length: 0 });
    }

    let mut data = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len());
    data.put_u32(payload.len() as u32);
    data.extend_from_slice(payload);
    Ok(data)
}

fn read_length(data: &[u8], max: usize) -> Result<usize, WireError> {
    if data.len() < LEN_PREFIX_SIZE {
        return Err(WireError::InsufficientData {
            needed: LEN_PREFIX_SIZE,
            have: data.len(),
        });
    }
    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if length == 0 {
        return Err(WireError::InvalidLength { length });
    }
    let size = length as usize;
    if size > max {
        return Err(WireError::FrameTooLarge { size, max });
    }
    Ok(size)
}

/// Decode a single frame from the start of `data`.
///
/// Returns the payload and the total number of bytes consumed.
///
/// # Errors
///
/// - `InsufficientData`: the prefix or the payload is incomplete
/// - `FrameTooLarge`: the prefix announces more than `max` bytes
/// - `InvalidLength`: the prefix announces an empty payload
pub fn decode_frame(data: &[u8], max: usize) -> Result<(&[u8], usize), WireError> {
    let size = read_length(data, max)?;
    let total = LEN_PREFIX_SIZE + size;
    if data.len() < total {
        return Err(WireError::InsufficientData {
            needed: total,
            have: data.len(),
        });
    }
    Ok((&data[LEN_PREFIX_SIZE..total], total))
}

/// Try to decode a frame, returning `None` if more data is needed.
///
/// Use this for streaming scenarios where data arrives incrementally.
///
/// # Errors
///
/// Returns errors other than `InsufficientData` (which becomes `Ok(None)`).
pub fn try_decode_frame(data: &[u8], max: usize) -> Result<Option<(&[u8], usize)>, WireError> {
    match decode_frame(data, max) {
        Ok(result) => Ok(Some(result)),
        Err(WireError::InsufficientData { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Reassembles frames from a byte stream that may split or coalesce them.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max: usize,
}

impl FrameDecoder {
    /// Create a decoder accepting payloads up to `max` bytes.
    pub fn new(max: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max,
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete payload, if one is buffered.
    ///
    /// # Errors
    ///
    /// A malformed prefix poisons the stream; the caller must disconnect.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        let size = match read_length(&self.buffer, self.max) {
            Ok(size) => size,
            Err(WireError::InsufficientData { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if self.buffer.len() < LEN_PREFIX_SIZE + size {
            return Ok(None);
        }
        self.buffer.advance(LEN_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(size).freeze()))
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
